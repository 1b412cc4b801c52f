//! Per-peer state.
//!
//! A peer is everything we know about one other client: its announcement
//! (id, flags, certificate), the chat channel tunnelled through the server,
//! its lane on the server fair queue, the link or relay state, master-side
//! binding progress, and the OTP seed negotiation for UDP links. All
//! relationships to other peers are id handles resolved through the node's
//! peer map; nothing here points at another peer directly.

use tracing::warn;

use crate::dataplane::{DataFlow, DataSink};
use crate::reactor::{JobId, SourceId, TimerId};
use crate::server_queue::FlowId;
use crate::transport::{ChatCipher, ChatCipherError, DatagramLink, StreamLink};
use crate::types::{PeerFlags, PeerId};

/// TLS role on the chat channel, derived from mastership when both sides
/// carry certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSslMode {
    None,
    Client,
    Server,
}

/// The signalling channel to one peer. The transform behind `cipher` is
/// plain passthrough or TLS; the chat itself only sequences messages.
pub struct Chat {
    pub ssl_mode: ChatSslMode,
    cipher: Box<dyn ChatCipher>,
}

impl Chat {
    pub fn new(ssl_mode: ChatSslMode, cipher: Box<dyn ChatCipher>) -> Self {
        Self { ssl_mode, cipher }
    }

    pub fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, ChatCipherError> {
        self.cipher.seal(msg)
    }

    pub fn open(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ChatCipherError> {
        self.cipher.open(data)
    }
}

/// An OTP send seed that has been transmitted but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSeed {
    pub id: u16,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

pub enum LinkIo {
    Datagram(Box<dyn DatagramLink>),
    Stream(Box<dyn StreamLink>),
}

impl LinkIo {
    pub fn send_frame(&mut self, frame: &[u8]) {
        match self {
            LinkIo::Datagram(link) => link.send_frame(frame),
            LinkIo::Stream(link) => link.send_frame(frame),
        }
    }
}

/// Resources that exist exactly while the peer has a direct link.
pub struct Link {
    pub io: LinkIo,
    pub source: SourceId,
    pub sink: DataSink,
    /// Next send-seed id to hand out (UDP + OTP).
    pub sendseed_next_id: u16,
    /// Send seed awaiting the peer's confirmation; at most one in flight.
    pub sendseed_sent: Option<SentSeed>,
    /// Receive-seed id to confirm once the transport reports it ready.
    pub pending_recv_seed_id: Option<u16>,
    pub job_send_seed: JobId,
}

pub struct Peer {
    pub id: PeerId,
    pub flags: PeerFlags,
    pub common_name: Option<String>,
    /// Raw DER certificate from the announcement, kept for peer TLS.
    pub cert: Vec<u8>,

    pub chat: Option<Chat>,
    /// A resetpeer control packet replaced the chat as the flow's producer.
    pub resetpeer_sent: bool,
    pub flow_id: FlowId,

    pub job_init: JobId,
    pub retry_timer: TimerId,

    pub link: Option<Link>,
    pub relaying_via: Option<PeerId>,
    pub waiting_relay: bool,
    /// This peer forwards frames for others; implies a live link.
    pub is_relay: bool,
    pub relay_users: Vec<PeerId>,

    /// Master-side binding walk.
    pub binding: bool,
    pub binding_addr_index: usize,

    /// Lane for local frames addressed to this peer.
    pub flow: DataFlow,
}

impl Peer {
    pub fn have_link(&self) -> bool {
        self.link.is_some()
    }

    /// Holds after every event: link, relaying and waiting-relay are
    /// mutually exclusive, and a relay provider has a link.
    pub fn check_link_state(&self) {
        let states =
            self.have_link() as u8 + self.relaying_via.is_some() as u8 + self.waiting_relay as u8;
        if states > 1 {
            warn!("peer {}: inconsistent link state", self.id);
        }
        debug_assert!(states <= 1);
        debug_assert!(!self.is_relay || self.have_link());
    }
}

/// Read-only snapshot for tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub id: PeerId,
    pub flags: PeerFlags,
    pub have_link: bool,
    pub link_up: bool,
    pub relaying_via: Option<PeerId>,
    pub waiting_relay: bool,
    pub is_relay: bool,
    pub relay_users: Vec<PeerId>,
    pub binding: bool,
    pub have_chat: bool,
    pub resetpeer_sent: bool,
    pub flow_attached_to: Option<PeerId>,
    pub sendseed_sent: Option<u16>,
}

impl From<&Peer> for PeerView {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id,
            flags: peer.flags,
            have_link: peer.have_link(),
            link_up: peer.link.as_ref().map(|l| l.sink.is_up()).unwrap_or(false),
            relaying_via: peer.relaying_via,
            waiting_relay: peer.waiting_relay,
            is_relay: peer.is_relay,
            relay_users: peer.relay_users.clone(),
            binding: peer.binding,
            have_chat: peer.chat.is_some(),
            resetpeer_sent: peer.resetpeer_sent,
            flow_attached_to: peer.flow.attached_to(),
            sendseed_sent: peer.link.as_ref().and_then(|l| l.sendseed_sent.as_ref().map(|s| s.id)),
        }
    }
}
