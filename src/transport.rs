//! Sealed surfaces for the peer transports, the tap device and the chat
//! transform.
//!
//! The node drives links exclusively through these traits; the concrete
//! datagram/stream machinery (socket handling, SPProto encryption and
//! fragmentation, TLS) lives behind them. Reference adapters are in
//! [`crate::io`], deterministic in-memory ones in the `sim` harness
//! (compiled for test builds only).

use std::net::SocketAddr;

use thiserror::Error;

/// Transport used for peer links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
}

/// Symmetric cipher selection for the datagram transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    None,
    Blowfish,
    Aes,
}

impl CipherMode {
    /// Key size in bytes; zero when encryption is off.
    pub fn key_len(self) -> usize {
        match self {
            CipherMode::None => 0,
            CipherMode::Blowfish => 16,
            CipherMode::Aes => 16,
        }
    }

    /// Cipher block size, which is also the IV size.
    pub fn block_len(self) -> usize {
        match self {
            CipherMode::None => 0,
            CipherMode::Blowfish => 8,
            CipherMode::Aes => 16,
        }
    }
}

/// Integrity mode for the datagram transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    None,
    Md5,
    Sha1,
}

/// One-time-pad keying: `num` pads per seed, warning once fewer than
/// `num_warn` remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtpConfig {
    pub mode: CipherMode,
    pub num: u32,
    pub num_warn: u32,
}

/// Security parameters handed to every datagram link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpParams {
    pub encryption: CipherMode,
    pub hash: HashMode,
    pub otp: Option<OtpConfig>,
}

impl SpParams {
    pub fn plaintext() -> Self {
        Self { encryption: CipherMode::None, hash: HashMode::None, otp: None }
    }

    pub fn have_encryption(&self) -> bool {
        self.encryption != CipherMode::None
    }

    pub fn have_otp(&self) -> bool {
        self.otp.is_some()
    }

    pub fn otp_key_len(&self) -> usize {
        self.otp.map(|o| o.mode.key_len()).unwrap_or(0)
    }

    pub fn otp_iv_len(&self) -> usize {
        self.otp.map(|o| o.mode.block_len()).unwrap_or(0)
    }
}

/// Events a peer link reports back to the node. Delivery goes through the
/// reactor inbox, tagged with the owning peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link failed; the peer will be reset.
    Error,
    /// OTP send pads are running low; a fresh seed should be negotiated.
    SeedWarning,
    /// A previously added receive seed is provisioned.
    SeedReady(u16),
    /// A data-plane frame arrived.
    Frame(Vec<u8>),
}

/// Events the tap device reports to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// An Ethernet frame was read from the device.
    Frame(Vec<u8>),
    /// The device failed; this is fatal for the client.
    Error,
}

/// UDP peer link. One instance per peer link attempt; dropped on teardown.
pub trait DatagramLink {
    /// Bind the local endpoint. A false return means this address/port is
    /// unusable and the caller should try the next one.
    fn bind(&mut self, addr: SocketAddr) -> bool;

    /// Start exchanging datagrams with the given remote endpoint.
    fn connect(&mut self, addr: SocketAddr) -> bool;

    /// Install the symmetric session key (encryption mode only).
    fn set_encryption_key(&mut self, key: &[u8]);

    /// Stage `seed_id` for the send direction; activated by
    /// [`DatagramLink::activate_otp_send_seed`] once the peer confirms it.
    fn set_otp_send_seed(&mut self, seed_id: u16, key: &[u8], iv: &[u8]);

    /// Begin using the staged send seed.
    fn activate_otp_send_seed(&mut self);

    /// Provision a receive seed; [`LinkEvent::SeedReady`] follows once it is
    /// usable. A repeated `seed_id` must be treated idempotently.
    fn add_otp_recv_seed(&mut self, seed_id: u16, key: &[u8], iv: &[u8]);

    /// Queue one data-plane frame for transmission. Lossy, like the wire.
    fn send_frame(&mut self, frame: &[u8]);
}

/// TCP peer link.
pub trait StreamLink {
    /// Reserve a one-shot password on the listener belonging to the given
    /// bind address and await an inbound connection presenting it.
    fn listen(&mut self, bind_index: usize) -> Option<u64>;

    /// Connect out and present the password.
    fn connect(&mut self, addr: SocketAddr, password: u64) -> bool;

    /// Queue one data-plane frame for transmission.
    fn send_frame(&mut self, frame: &[u8]);
}

/// Local tap device. Reads arrive as [`DeviceEvent`]s; only the write half
/// is driven through the trait.
pub trait TapDevice {
    fn mtu(&self) -> usize;
    fn write_frame(&mut self, frame: &[u8]);
}

#[derive(Debug, Error)]
pub enum ChatCipherError {
    #[error("chat transform failed: {0}")]
    Failed(String),
}

/// Transform applied to chat messages between this node and one peer. The
/// TLS transform (client/server role derived from mastership) implements
/// this; [`PlainChatCipher`] is the passthrough used when neither side
/// requires TLS.
pub trait ChatCipher {
    /// Transform one outgoing message into bytes for the server channel.
    fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, ChatCipherError>;

    /// Transform received channel bytes; may buffer (handshake traffic) and
    /// yield nothing.
    fn open(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ChatCipherError>;
}

/// No-op chat transform.
#[derive(Default)]
pub struct PlainChatCipher;

impl ChatCipher for PlainChatCipher {
    fn seal(&mut self, msg: &[u8]) -> Result<Vec<u8>, ChatCipherError> {
        Ok(msg.to_vec())
    }

    fn open(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, ChatCipherError> {
        Ok(Some(data.to_vec()))
    }
}
