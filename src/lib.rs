//! Peer-to-peer layer-2 VPN client core.
//!
//! A tapmesh node registers with a rendezvous server, learns of other
//! clients, negotiates a direct UDP or TCP link with each of them under the
//! server's coordination, and switches Ethernet frames between a local tap
//! device and those links. Peers that cannot establish a direct link are
//! relayed through a peer that volunteers as a relay provider.

pub mod config;
pub mod dataplane;
pub mod decider;
pub mod io;
pub mod msg;
pub mod node;
pub mod peer;
pub mod proto;
pub mod reactor;
pub mod server;
pub mod server_queue;
#[cfg(feature = "sim")]
pub mod sim;
pub mod transport;
pub mod types;
