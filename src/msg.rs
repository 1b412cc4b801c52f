//! Peer-to-peer signalling messages.
//!
//! These are the typed messages two peers exchange through the server to
//! negotiate a direct link: a `u16` message kind followed by TLV fields,
//! each field being `id: u8, len: u16 LE, value`. Parsers are strict: an
//! unknown field, a missing mandatory field, a bad length or trailing bytes
//! reject the whole message. A rejected message is logged and dropped by the
//! caller; it never resets the peer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use crate::proto::{MSG_MAX_PAYLOAD, WireError};

pub const MSGID_YOUCONNECT: u16 = 1;
pub const MSGID_CANNOTCONNECT: u16 = 2;
pub const MSGID_CANNOTBIND: u16 = 3;
pub const MSGID_YOURETRY: u16 = 4;
pub const MSGID_SEED: u16 = 5;
pub const MSGID_CONFIRMSEED: u16 = 6;

// Field ids inside youconnect.
const F_YC_ADDR: u8 = 1;
const F_YC_KEY: u8 = 2;
const F_YC_PASSWORD: u8 = 3;

// Field ids inside a youconnect address entry.
const F_ADDR_NAME: u8 = 1;
const F_ADDR_ADDR: u8 = 2;

// Field ids inside seed / confirmseed.
const F_SEED_ID: u8 = 1;
const F_SEED_KEY: u8 = 2;
const F_SEED_IV: u8 = 3;

/// Addresses advertised in one youconnect.
pub const MAX_YOUCONNECT_ADDRS: usize = 16;

/// Bound on scope names, keys and IVs inside messages.
pub const MAX_FIELD_LEN: usize = 64;

/// One advertised endpoint: a socket address tagged with the scope name the
/// receiver must recognise before connecting to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAddr {
    pub scope: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMsg {
    /// Master bound a local endpoint; the slave should try these addresses.
    YouConnect { addrs: Vec<ExternalAddr>, key: Option<Vec<u8>>, password: Option<u64> },
    /// Slave found no acceptable address.
    CannotConnect,
    /// Master ran out of bind addresses.
    CannotBind,
    /// Slave-side failure; the master should reset and retry.
    YouRetry,
    /// Fresh one-time-pad seed for the sender's transmit direction.
    Seed { seed_id: u16, key: Vec<u8>, iv: Vec<u8> },
    /// The seed with this id is provisioned and may be used.
    ConfirmSeed { seed_id: u16 },
}

impl PeerMsg {
    pub fn kind(&self) -> u16 {
        match self {
            PeerMsg::YouConnect { .. } => MSGID_YOUCONNECT,
            PeerMsg::CannotConnect => MSGID_CANNOTCONNECT,
            PeerMsg::CannotBind => MSGID_CANNOTBIND,
            PeerMsg::YouRetry => MSGID_YOURETRY,
            PeerMsg::Seed { .. } => MSGID_SEED,
            PeerMsg::ConfirmSeed { .. } => MSGID_CONFIRMSEED,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PeerMsg::YouConnect { .. } => "youconnect",
            PeerMsg::CannotConnect => "cannotconnect",
            PeerMsg::CannotBind => "cannotbind",
            PeerMsg::YouRetry => "youretry",
            PeerMsg::Seed { .. } => "seed",
            PeerMsg::ConfirmSeed { .. } => "confirmseed",
        }
    }

    /// Encode kind header plus fields. Errors only when the result would not
    /// fit a signalling payload (oversized youconnect address lists).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16_le(self.kind());
        match self {
            PeerMsg::YouConnect { addrs, key, password } => {
                for entry in addrs {
                    let mut nested = BytesMut::new();
                    put_field(&mut nested, F_ADDR_NAME, entry.scope.as_bytes());
                    put_field(&mut nested, F_ADDR_ADDR, &encode_sockaddr(&entry.addr));
                    put_field(&mut buf, F_YC_ADDR, &nested);
                }
                if let Some(key) = key {
                    put_field(&mut buf, F_YC_KEY, key);
                }
                if let Some(password) = password {
                    put_field(&mut buf, F_YC_PASSWORD, &password.to_le_bytes());
                }
            }
            PeerMsg::CannotConnect | PeerMsg::CannotBind | PeerMsg::YouRetry => {}
            PeerMsg::Seed { seed_id, key, iv } => {
                put_field(&mut buf, F_SEED_ID, &seed_id.to_le_bytes());
                put_field(&mut buf, F_SEED_KEY, key);
                put_field(&mut buf, F_SEED_IV, iv);
            }
            PeerMsg::ConfirmSeed { seed_id } => {
                put_field(&mut buf, F_SEED_ID, &seed_id.to_le_bytes());
            }
        }
        if buf.len() > MSG_MAX_PAYLOAD {
            return Err(WireError::Oversize(buf.len()));
        }
        Ok(buf.to_vec())
    }

    pub fn decode(mut buf: &[u8]) -> Result<PeerMsg, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let kind = buf.get_u16_le();
        match kind {
            MSGID_YOUCONNECT => decode_youconnect(buf),
            MSGID_CANNOTCONNECT => empty(buf, PeerMsg::CannotConnect),
            MSGID_CANNOTBIND => empty(buf, PeerMsg::CannotBind),
            MSGID_YOURETRY => empty(buf, PeerMsg::YouRetry),
            MSGID_SEED => decode_seed(buf),
            MSGID_CONFIRMSEED => decode_confirmseed(buf),
            other => Err(WireError::UnknownKind(other as u8)),
        }
    }
}

fn empty(buf: &[u8], msg: PeerMsg) -> Result<PeerMsg, WireError> {
    if buf.has_remaining() { Err(WireError::Trailing) } else { Ok(msg) }
}

fn put_field(buf: &mut BytesMut, id: u8, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u8(id);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value);
}

fn next_field<'a>(buf: &mut &'a [u8]) -> Result<(u8, &'a [u8]), WireError> {
    if buf.remaining() < 3 {
        return Err(WireError::Truncated);
    }
    let id = buf.get_u8();
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let (value, rest) = buf.split_at(len);
    *buf = rest;
    Ok((id, value))
}

fn decode_youconnect(mut buf: &[u8]) -> Result<PeerMsg, WireError> {
    let mut addrs = Vec::new();
    let mut key = None;
    let mut password = None;
    while buf.has_remaining() {
        let (id, value) = next_field(&mut buf)?;
        match id {
            F_YC_ADDR => {
                if addrs.len() >= MAX_YOUCONNECT_ADDRS {
                    return Err(WireError::Oversize(addrs.len() + 1));
                }
                addrs.push(decode_addr_entry(value)?);
            }
            F_YC_KEY => {
                if value.is_empty() || value.len() > MAX_FIELD_LEN {
                    return Err(WireError::BadLength("key"));
                }
                if key.replace(value.to_vec()).is_some() {
                    return Err(WireError::BadLength("key"));
                }
            }
            F_YC_PASSWORD => {
                let bytes: [u8; 8] =
                    value.try_into().map_err(|_| WireError::BadLength("password"))?;
                if password.replace(u64::from_le_bytes(bytes)).is_some() {
                    return Err(WireError::BadLength("password"));
                }
            }
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(PeerMsg::YouConnect { addrs, key, password })
}

fn decode_addr_entry(mut buf: &[u8]) -> Result<ExternalAddr, WireError> {
    let mut scope = None;
    let mut addr = None;
    while buf.has_remaining() {
        let (id, value) = next_field(&mut buf)?;
        match id {
            F_ADDR_NAME => {
                if value.len() > MAX_FIELD_LEN {
                    return Err(WireError::BadLength("name"));
                }
                let name = std::str::from_utf8(value).map_err(|_| WireError::BadLength("name"))?;
                if scope.replace(name.to_owned()).is_some() {
                    return Err(WireError::BadLength("name"));
                }
            }
            F_ADDR_ADDR => {
                if addr.replace(decode_sockaddr(value)?).is_some() {
                    return Err(WireError::BadAddress);
                }
            }
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(ExternalAddr {
        scope: scope.ok_or(WireError::MissingField("name"))?,
        addr: addr.ok_or(WireError::MissingField("addr"))?,
    })
}

fn decode_seed(mut buf: &[u8]) -> Result<PeerMsg, WireError> {
    let mut seed_id = None;
    let mut key = None;
    let mut iv = None;
    while buf.has_remaining() {
        let (id, value) = next_field(&mut buf)?;
        match id {
            F_SEED_ID => {
                let bytes: [u8; 2] =
                    value.try_into().map_err(|_| WireError::BadLength("seed_id"))?;
                seed_id = Some(u16::from_le_bytes(bytes));
            }
            F_SEED_KEY => {
                if value.is_empty() || value.len() > MAX_FIELD_LEN {
                    return Err(WireError::BadLength("key"));
                }
                key = Some(value.to_vec());
            }
            F_SEED_IV => {
                if value.is_empty() || value.len() > MAX_FIELD_LEN {
                    return Err(WireError::BadLength("iv"));
                }
                iv = Some(value.to_vec());
            }
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(PeerMsg::Seed {
        seed_id: seed_id.ok_or(WireError::MissingField("seed_id"))?,
        key: key.ok_or(WireError::MissingField("key"))?,
        iv: iv.ok_or(WireError::MissingField("iv"))?,
    })
}

fn decode_confirmseed(mut buf: &[u8]) -> Result<PeerMsg, WireError> {
    let mut seed_id = None;
    while buf.has_remaining() {
        let (id, value) = next_field(&mut buf)?;
        match id {
            F_SEED_ID => {
                let bytes: [u8; 2] =
                    value.try_into().map_err(|_| WireError::BadLength("seed_id"))?;
                seed_id = Some(u16::from_le_bytes(bytes));
            }
            other => return Err(WireError::UnknownField(other)),
        }
    }
    Ok(PeerMsg::ConfirmSeed { seed_id: seed_id.ok_or(WireError::MissingField("seed_id"))? })
}

/// Wire socket address: kind byte (4 or 6), port, then address octets in
/// network order.
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19);
    match addr {
        SocketAddr::V4(a) => {
            buf.put_u8(4);
            buf.put_u16_le(a.port());
            buf.put_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            buf.put_u8(6);
            buf.put_u16_le(a.port());
            buf.put_slice(&a.ip().octets());
        }
    }
    buf
}

pub fn decode_sockaddr(mut buf: &[u8]) -> Result<SocketAddr, WireError> {
    if buf.remaining() < 3 {
        return Err(WireError::BadAddress);
    }
    let kind = buf.get_u8();
    let port = buf.get_u16_le();
    match kind {
        4 => {
            let octets: [u8; 4] = buf.try_into().map_err(|_| WireError::BadAddress)?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            let octets: [u8; 16] = buf.try_into().map_err(|_| WireError::BadAddress)?;
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(WireError::BadAddress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: PeerMsg) {
        let wire = msg.encode().unwrap();
        assert_eq!(PeerMsg::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        roundtrip(PeerMsg::YouConnect { addrs: vec![], key: None, password: None });
        roundtrip(PeerMsg::YouConnect {
            addrs: vec![
                ExternalAddr { scope: "internet".into(), addr: "203.0.113.7:8000".parse().unwrap() },
                ExternalAddr { scope: "lan".into(), addr: "[2001:db8::1]:8000".parse().unwrap() },
            ],
            key: Some(vec![0x11; 16]),
            password: None,
        });
        roundtrip(PeerMsg::YouConnect {
            addrs: vec![ExternalAddr {
                scope: "internet".into(),
                addr: "192.0.2.1:7000".parse().unwrap(),
            }],
            key: None,
            password: Some(0xdead_beef_f00d_cafe),
        });
        roundtrip(PeerMsg::CannotConnect);
        roundtrip(PeerMsg::CannotBind);
        roundtrip(PeerMsg::YouRetry);
        roundtrip(PeerMsg::Seed { seed_id: 42, key: vec![1; 16], iv: vec![2; 8] });
        roundtrip(PeerMsg::ConfirmSeed { seed_id: 42 });
    }

    #[test]
    fn test_reject_trailing_bytes() {
        let mut wire = PeerMsg::CannotBind.encode().unwrap();
        wire.push(0);
        assert_eq!(PeerMsg::decode(&wire), Err(WireError::Trailing));
    }

    #[test]
    fn test_reject_unknown_field() {
        let mut wire = PeerMsg::ConfirmSeed { seed_id: 1 }.encode().unwrap();
        wire.extend_from_slice(&[9, 1, 0, 0xff]);
        assert_eq!(PeerMsg::decode(&wire), Err(WireError::UnknownField(9)));
    }

    #[test]
    fn test_reject_missing_field() {
        // Seed with only an id.
        let mut buf = BytesMut::new();
        buf.put_u16_le(MSGID_SEED);
        put_field(&mut buf, F_SEED_ID, &7u16.to_le_bytes());
        assert_eq!(PeerMsg::decode(&buf), Err(WireError::MissingField("key")));
    }

    #[test]
    fn test_reject_truncated_field() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(MSGID_CONFIRMSEED);
        buf.put_u8(F_SEED_ID);
        buf.put_u16_le(10); // claims 10 bytes, provides none
        assert_eq!(PeerMsg::decode(&buf), Err(WireError::Truncated));
    }

    #[test]
    fn test_sockaddr_rejects_bad_kind_and_length() {
        assert!(decode_sockaddr(&[5, 0, 0, 1, 2, 3, 4]).is_err());
        assert!(decode_sockaddr(&[4, 0, 0, 1, 2, 3]).is_err());
        assert!(decode_sockaddr(&[4, 0, 0, 1, 2, 3, 4, 5]).is_err());
    }
}
