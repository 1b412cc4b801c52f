//! Client side of the rendezvous server connection.
//!
//! Reassembles the framed stream, enforces the hello handshake, and turns
//! incoming control packets into typed events. Exactly one `Ready` is
//! produced per session and it precedes every peer event; anything else is
//! a protocol violation and fatal to the client. The send side is owned by
//! the fair queue once ready — this module only produces the packets.

use thiserror::Error;
use tracing::{debug, warn};

use crate::proto::{ControlPacket, FrameAssembler, WireError};
use crate::types::{PeerFlags, PeerId, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("wire error on server stream: {0}")]
    Wire(#[from] WireError),
    #[error("server hello violation: {0}")]
    Hello(&'static str),
    #[error("unexpected packet from server: {0}")]
    Unexpected(&'static str),
}

/// Upward events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Ready { self_id: PeerId, ext_ip: [u8; 4] },
    NewClient { id: PeerId, flags: PeerFlags, cert: Vec<u8> },
    EndClient { id: PeerId },
    Message { from: PeerId, payload: Vec<u8> },
}

/// Write surface for the server link. One packet is in flight at a time;
/// completion comes back through the reactor as a write-done event.
pub trait ServerLink {
    fn send_packet(&mut self, packet: Vec<u8>);
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    AwaitHello,
    Ready,
}

pub struct ServerConnection {
    assembler: FrameAssembler,
    phase: Phase,
}

impl ServerConnection {
    pub fn new() -> Self {
        Self { assembler: FrameAssembler::new(), phase: Phase::AwaitHello }
    }

    /// The packet that opens the session.
    pub fn hello_packet() -> Vec<u8> {
        ControlPacket::ClientHello { version: PROTOCOL_VERSION }.encode()
    }

    pub fn keepalive_packet() -> Vec<u8> {
        ControlPacket::Keepalive.encode()
    }

    pub fn outmsg_packet(to: PeerId, payload: Vec<u8>) -> Vec<u8> {
        ControlPacket::OutMsg { to, payload }.encode()
    }

    pub fn resetpeer_packet(id: PeerId) -> Vec<u8> {
        ControlPacket::ResetPeer { id }.encode()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Feed raw stream bytes; returns the decoded events. Any error is
    /// fatal to the session.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<ServerEvent>, ServerError> {
        self.assembler.extend(data);
        let mut events = Vec::new();
        while let Some(frame) = self.assembler.next_frame()? {
            if let Some(event) = self.handle_packet(ControlPacket::decode(&frame)?)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn handle_packet(&mut self, packet: ControlPacket) -> Result<Option<ServerEvent>, ServerError> {
        match packet {
            ControlPacket::Keepalive => Ok(None),
            ControlPacket::ServerHello { flags: _, id, ext_ip } => {
                if self.phase != Phase::AwaitHello {
                    return Err(ServerError::Hello("second hello"));
                }
                self.phase = Phase::Ready;
                debug!("server hello: our id is {}", id);
                Ok(Some(ServerEvent::Ready { self_id: id, ext_ip }))
            }
            ControlPacket::NewClient { id, flags, cert } => {
                self.require_ready("newclient")?;
                Ok(Some(ServerEvent::NewClient { id, flags: PeerFlags(flags), cert }))
            }
            ControlPacket::EndClient { id } => {
                self.require_ready("endclient")?;
                Ok(Some(ServerEvent::EndClient { id }))
            }
            ControlPacket::InMsg { from, payload } => {
                self.require_ready("inmsg")?;
                Ok(Some(ServerEvent::Message { from, payload }))
            }
            // Client-to-server kinds coming down are a violation.
            other => {
                warn!("server sent client-side packet {}", other.kind_name());
                Err(ServerError::Unexpected(other.kind_name()))
            }
        }
    }

    fn require_ready(&self, what: &'static str) -> Result<(), ServerError> {
        if self.phase != Phase::Ready {
            return Err(ServerError::Hello(what));
        }
        Ok(())
    }
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Vec<u8> {
        ControlPacket::ServerHello { flags: 0, id: 5, ext_ip: [203, 0, 113, 9] }.encode()
    }

    #[test]
    fn test_hello_then_events() {
        let mut conn = ServerConnection::new();
        let events = conn.receive(&hello()).unwrap();
        assert_eq!(events, vec![ServerEvent::Ready { self_id: 5, ext_ip: [203, 0, 113, 9] }]);
        assert!(conn.is_ready());

        let mut stream = ControlPacket::NewClient { id: 7, flags: 1, cert: vec![] }.encode();
        stream.extend(ControlPacket::InMsg { from: 7, payload: vec![9] }.encode());
        stream.extend(ControlPacket::EndClient { id: 7 }.encode());
        let events = conn.receive(&stream).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::NewClient { id: 7, flags: PeerFlags(1), cert: vec![] },
                ServerEvent::Message { from: 7, payload: vec![9] },
                ServerEvent::EndClient { id: 7 },
            ]
        );
    }

    #[test]
    fn test_peer_event_before_hello_is_fatal() {
        let mut conn = ServerConnection::new();
        let stream = ControlPacket::EndClient { id: 7 }.encode();
        assert!(matches!(conn.receive(&stream), Err(ServerError::Hello(_))));
    }

    #[test]
    fn test_double_hello_is_fatal() {
        let mut conn = ServerConnection::new();
        conn.receive(&hello()).unwrap();
        assert!(matches!(conn.receive(&hello()), Err(ServerError::Hello(_))));
    }

    #[test]
    fn test_keepalive_produces_no_event() {
        let mut conn = ServerConnection::new();
        conn.receive(&hello()).unwrap();
        assert!(conn.receive(&ControlPacket::Keepalive.encode()).unwrap().is_empty());
    }

    #[test]
    fn test_client_kind_from_server_is_fatal() {
        let mut conn = ServerConnection::new();
        conn.receive(&hello()).unwrap();
        let stream = ControlPacket::ResetPeer { id: 1 }.encode();
        assert!(matches!(conn.receive(&stream), Err(ServerError::Unexpected(_))));
    }
}
