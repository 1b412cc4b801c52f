//! Rendezvous stream framing and control packets.
//!
//! Every packet on the server connection is a little-endian `u16` length
//! prefix followed by a one-byte packet kind and the kind-specific payload.
//! The length covers the kind byte and payload. Peer-to-peer signalling
//! rides inside `OutMsg`/`InMsg` payloads (see [`crate::msg`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::PeerId;

// Control packet kinds.
pub const SC_KEEPALIVE: u8 = 0;
pub const SC_CLIENTHELLO: u8 = 1;
pub const SC_SERVERHELLO: u8 = 2;
pub const SC_NEWCLIENT: u8 = 3;
pub const SC_ENDCLIENT: u8 = 4;
pub const SC_OUTMSG: u8 = 5;
pub const SC_INMSG: u8 = 6;
pub const SC_RESETPEER: u8 = 7;

/// Length prefix size.
pub const PACKETPROTO_HEADER_LEN: usize = 2;

/// Kind byte size.
pub const SC_HEADER_LEN: usize = 1;

/// Maximum payload after the kind byte. Bounds every allocation made while
/// reading the server stream.
pub const SC_MAX_PAYLOAD: usize = 8192;

/// Maximum certificate carried in a newclient announcement.
pub const MAX_CERT_LEN: usize = SC_MAX_PAYLOAD - 4;

/// Maximum peer signalling payload that fits an outmsg after both headers.
pub const MSG_MAX_PAYLOAD: usize = SC_MAX_PAYLOAD - 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated packet")]
    Truncated,
    #[error("oversized packet ({0} bytes)")]
    Oversize(usize),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("unknown field id {0}")]
    UnknownField(u8),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("bad length for field: {0}")]
    BadLength(&'static str),
    #[error("trailing bytes after message")]
    Trailing,
    #[error("malformed address")]
    BadAddress,
}

/// A typed packet on the server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Keepalive,
    ClientHello { version: u16 },
    ServerHello { flags: u16, id: PeerId, ext_ip: [u8; 4] },
    NewClient { id: PeerId, flags: u16, cert: Vec<u8> },
    EndClient { id: PeerId },
    OutMsg { to: PeerId, payload: Vec<u8> },
    InMsg { from: PeerId, payload: Vec<u8> },
    ResetPeer { id: PeerId },
}

impl ControlPacket {
    pub fn kind(&self) -> u8 {
        match self {
            ControlPacket::Keepalive => SC_KEEPALIVE,
            ControlPacket::ClientHello { .. } => SC_CLIENTHELLO,
            ControlPacket::ServerHello { .. } => SC_SERVERHELLO,
            ControlPacket::NewClient { .. } => SC_NEWCLIENT,
            ControlPacket::EndClient { .. } => SC_ENDCLIENT,
            ControlPacket::OutMsg { .. } => SC_OUTMSG,
            ControlPacket::InMsg { .. } => SC_INMSG,
            ControlPacket::ResetPeer { .. } => SC_RESETPEER,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ControlPacket::Keepalive => "keepalive",
            ControlPacket::ClientHello { .. } => "clienthello",
            ControlPacket::ServerHello { .. } => "serverhello",
            ControlPacket::NewClient { .. } => "newclient",
            ControlPacket::EndClient { .. } => "endclient",
            ControlPacket::OutMsg { .. } => "outmsg",
            ControlPacket::InMsg { .. } => "inmsg",
            ControlPacket::ResetPeer { .. } => "resetpeer",
        }
    }

    /// Encode as a complete wire packet: length prefix, kind, payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.kind());
        match self {
            ControlPacket::Keepalive => {}
            ControlPacket::ClientHello { version } => body.put_u16_le(*version),
            ControlPacket::ServerHello { flags, id, ext_ip } => {
                body.put_u16_le(*flags);
                body.put_u16_le(*id);
                body.put_slice(ext_ip);
            }
            ControlPacket::NewClient { id, flags, cert } => {
                body.put_u16_le(*id);
                body.put_u16_le(*flags);
                body.put_slice(cert);
            }
            ControlPacket::EndClient { id } => body.put_u16_le(*id),
            ControlPacket::OutMsg { to, payload } => {
                body.put_u16_le(*to);
                body.put_slice(payload);
            }
            ControlPacket::InMsg { from, payload } => {
                body.put_u16_le(*from);
                body.put_slice(payload);
            }
            ControlPacket::ResetPeer { id } => body.put_u16_le(*id),
        }

        debug_assert!(body.len() <= SC_HEADER_LEN + SC_MAX_PAYLOAD);
        let mut out = Vec::with_capacity(PACKETPROTO_HEADER_LEN + body.len());
        out.put_u16_le(body.len() as u16);
        out.extend_from_slice(&body);
        out
    }

    /// Decode a framed packet body (kind byte + payload, no length prefix).
    pub fn decode(mut buf: &[u8]) -> Result<ControlPacket, WireError> {
        if buf.remaining() < SC_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let kind = buf.get_u8();
        match kind {
            SC_KEEPALIVE => {
                if buf.has_remaining() {
                    return Err(WireError::Trailing);
                }
                Ok(ControlPacket::Keepalive)
            }
            SC_CLIENTHELLO => {
                let version = get_u16(&mut buf)?;
                expect_empty(buf)?;
                Ok(ControlPacket::ClientHello { version })
            }
            SC_SERVERHELLO => {
                let flags = get_u16(&mut buf)?;
                let id = get_u16(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let mut ext_ip = [0u8; 4];
                buf.copy_to_slice(&mut ext_ip);
                expect_empty(buf)?;
                Ok(ControlPacket::ServerHello { flags, id, ext_ip })
            }
            SC_NEWCLIENT => {
                let id = get_u16(&mut buf)?;
                let flags = get_u16(&mut buf)?;
                if buf.remaining() > MAX_CERT_LEN {
                    return Err(WireError::Oversize(buf.remaining()));
                }
                Ok(ControlPacket::NewClient { id, flags, cert: buf.to_vec() })
            }
            SC_ENDCLIENT => {
                let id = get_u16(&mut buf)?;
                expect_empty(buf)?;
                Ok(ControlPacket::EndClient { id })
            }
            SC_OUTMSG => {
                let to = get_u16(&mut buf)?;
                Ok(ControlPacket::OutMsg { to, payload: buf.to_vec() })
            }
            SC_INMSG => {
                let from = get_u16(&mut buf)?;
                Ok(ControlPacket::InMsg { from, payload: buf.to_vec() })
            }
            SC_RESETPEER => {
                let id = get_u16(&mut buf)?;
                expect_empty(buf)?;
                Ok(ControlPacket::ResetPeer { id })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn expect_empty(buf: &[u8]) -> Result<(), WireError> {
    if buf.has_remaining() { Err(WireError::Trailing) } else { Ok(()) }
}

/// Reassembles length-prefixed packets from an arbitrary byte stream.
#[derive(Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete framed body (kind byte + payload), if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.buf.len() < PACKETPROTO_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > SC_HEADER_LEN + SC_MAX_PAYLOAD {
            return Err(WireError::Oversize(len));
        }
        if self.buf.len() < PACKETPROTO_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(PACKETPROTO_HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: ControlPacket) {
        let wire = packet.encode();
        let len = u16::from_le_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(wire.len(), PACKETPROTO_HEADER_LEN + len);
        let decoded = ControlPacket::decode(&wire[PACKETPROTO_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        roundtrip(ControlPacket::Keepalive);
        roundtrip(ControlPacket::ClientHello { version: 26 });
        roundtrip(ControlPacket::ServerHello { flags: 0, id: 9, ext_ip: [203, 0, 113, 7] });
        roundtrip(ControlPacket::NewClient { id: 3, flags: 5, cert: vec![0x30, 0x82, 1, 2] });
        roundtrip(ControlPacket::NewClient { id: 4, flags: 0, cert: vec![] });
        roundtrip(ControlPacket::EndClient { id: 3 });
        roundtrip(ControlPacket::OutMsg { to: 3, payload: vec![1, 2, 3] });
        roundtrip(ControlPacket::InMsg { from: 3, payload: vec![] });
        roundtrip(ControlPacket::ResetPeer { id: 3 });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(ControlPacket::decode(&[]), Err(WireError::Truncated));
        assert_eq!(ControlPacket::decode(&[99]), Err(WireError::UnknownKind(99)));
        // Endclient with trailing byte.
        assert_eq!(ControlPacket::decode(&[SC_ENDCLIENT, 1, 0, 0xaa]), Err(WireError::Trailing));
        // Serverhello cut short.
        assert_eq!(ControlPacket::decode(&[SC_SERVERHELLO, 1, 0]), Err(WireError::Truncated));
    }

    #[test]
    fn test_assembler_reassembles_split_packets() {
        let a = ControlPacket::EndClient { id: 1 }.encode();
        let b = ControlPacket::Keepalive.encode();
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        let mut asm = FrameAssembler::new();
        // Feed one byte at a time.
        let mut frames = Vec::new();
        for byte in stream {
            asm.extend(&[byte]);
            while let Some(frame) = asm.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(ControlPacket::decode(&frames[0]).unwrap(), ControlPacket::EndClient { id: 1 });
        assert_eq!(ControlPacket::decode(&frames[1]).unwrap(), ControlPacket::Keepalive);
    }

    #[test]
    fn test_assembler_rejects_oversize() {
        let mut asm = FrameAssembler::new();
        let len = (SC_HEADER_LEN + SC_MAX_PAYLOAD + 1) as u16;
        asm.extend(&len.to_le_bytes());
        assert!(matches!(asm.next_frame(), Err(WireError::Oversize(_))));
    }
}
