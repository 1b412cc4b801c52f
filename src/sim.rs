//! Deterministic in-process simulation harness.
//!
//! Runs several nodes against a mock rendezvous hub and an in-memory port
//! space, all on manual-clock reactors: no sockets, no threads, no sleeps.
//! Integration tests drive whole peer lifecycles this way and assert on the
//! hub's control-packet log, the transport operation log and each node's
//! peer views.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use crate::config::Config;
use crate::msg::PeerMsg;
use crate::node::{Ev, LinkFactory, Node};
use crate::proto::{ControlPacket, PACKETPROTO_HEADER_LEN};
use crate::reactor::{Inbox, Reactor, SourceId};
use crate::transport::{DatagramLink, DeviceEvent, LinkEvent, StreamLink, TapDevice};
use crate::types::PeerId;

// =============================================================================
// MOCK RENDEZVOUS HUB
// =============================================================================

struct HubClient {
    id: PeerId,
    ext_ip: [u8; 4],
    inbox: Inbox<Ev>,
    source: SourceId,
    /// Write completions withheld while stalled.
    stalled: bool,
    pending_write_dones: u32,
}

/// The server side of every node's rendezvous connection.
#[derive(Default)]
pub struct Hub {
    clients: HashMap<usize, HubClient>,
    /// Every control packet each client sent, in order.
    pub control_log: Vec<(usize, ControlPacket)>,
    pub resetpeers: Vec<(usize, PeerId)>,
}

impl Hub {
    fn register(&mut self, idx: usize, id: PeerId, ext_ip: [u8; 4], inbox: Inbox<Ev>, source: SourceId) {
        self.clients.insert(
            idx,
            HubClient { id, ext_ip, inbox, source, stalled: false, pending_write_dones: 0 },
        );
    }

    fn deliver(&self, idx: usize, packet: Vec<u8>) {
        let client = &self.clients[&idx];
        client.inbox.send(client.source, Ev::ServerData(packet));
    }

    fn handle_packet(&mut self, idx: usize, wire: &[u8]) {
        let packet = ControlPacket::decode(&wire[PACKETPROTO_HEADER_LEN..])
            .expect("client sent malformed packet");
        self.control_log.push((idx, packet.clone()));
        match packet {
            ControlPacket::ClientHello { .. } => {
                let client = &self.clients[&idx];
                let hello = ControlPacket::ServerHello {
                    flags: 0,
                    id: client.id,
                    ext_ip: client.ext_ip,
                };
                self.deliver(idx, hello.encode());
            }
            ControlPacket::OutMsg { to, payload } => {
                let from = self.clients[&idx].id;
                if let Some((dest, _)) = self.clients.iter().find(|(_, c)| c.id == to) {
                    let packet = ControlPacket::InMsg { from, payload };
                    self.deliver(*dest, packet.encode());
                }
            }
            ControlPacket::ResetPeer { id } => self.resetpeers.push((idx, id)),
            ControlPacket::Keepalive => {}
            other => panic!("client sent unexpected packet {}", other.kind_name()),
        }
    }

    fn write_done(&mut self, idx: usize) {
        let client = self.clients.get_mut(&idx).expect("client registered");
        if client.stalled {
            client.pending_write_dones += 1;
        } else {
            client.inbox.send(client.source, Ev::ServerWriteDone);
        }
    }

    /// Withhold write completions for this client (the link looks busy).
    pub fn set_stalled(&mut self, idx: usize, stalled: bool) {
        let client = self.clients.get_mut(&idx).expect("client registered");
        client.stalled = stalled;
        if !stalled {
            for _ in 0..std::mem::take(&mut client.pending_write_dones) {
                client.inbox.send(client.source, Ev::ServerWriteDone);
            }
        }
    }

    /// Peer signalling messages a client has sent, decoded.
    pub fn peer_msgs_from(&self, idx: usize) -> Vec<(PeerId, PeerMsg)> {
        self.control_log
            .iter()
            .filter(|(i, _)| *i == idx)
            .filter_map(|(_, packet)| match packet {
                ControlPacket::OutMsg { to, payload } => {
                    PeerMsg::decode(payload).ok().map(|msg| (*to, msg))
                }
                _ => None,
            })
            .collect()
    }
}

struct HubLink {
    hub: Rc<RefCell<Hub>>,
    idx: usize,
}

impl crate::server::ServerLink for HubLink {
    fn send_packet(&mut self, packet: Vec<u8>) {
        let mut hub = self.hub.borrow_mut();
        hub.handle_packet(self.idx, &packet);
        hub.write_done(self.idx);
    }
}

// =============================================================================
// IN-MEMORY PORT SPACE AND PEER LINKS
// =============================================================================

/// (node index, peer id the link was created for).
pub type EndpointKey = (usize, PeerId);

/// Transport operations tests assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpOp {
    SetSendSeed(u16),
    ActivateSendSeed,
    AddRecvSeed(u16),
}

struct Endpoint {
    inbox: Inbox<Ev>,
    source: SourceId,
    /// Peer id this link belongs to, from its own node's point of view.
    peer: PeerId,
    remote: Option<EndpointKey>,
}

#[derive(Default)]
pub struct MemNet {
    endpoints: HashMap<EndpointKey, Endpoint>,
    bindings: HashMap<SocketAddr, EndpointKey>,
    /// Addresses unavailable for binding, as if another process held them.
    occupied: HashSet<SocketAddr>,
    next_password: u64,
    pending_accepts: HashMap<u64, EndpointKey>,
    /// Endpoints whose transport never finishes provisioning receive seeds.
    suppress_seed_ready: HashSet<EndpointKey>,
    pub otp_log: Vec<(EndpointKey, OtpOp)>,
    pub frames_sent: HashMap<EndpointKey, u64>,
}

impl MemNet {
    /// Make an address un-bindable.
    pub fn occupy(&mut self, addr: SocketAddr) {
        self.occupied.insert(addr);
    }

    /// Inject a link event, as the transport would.
    pub fn inject(&mut self, key: EndpointKey, event: LinkEvent) {
        let endpoint = self.endpoints.get(&key).expect("endpoint exists");
        endpoint.inbox.send(endpoint.source, Ev::Link(endpoint.peer, event));
    }

    pub fn has_endpoint(&self, key: EndpointKey) -> bool {
        self.endpoints.contains_key(&key)
    }

    /// Kill an endpoint as if its socket vanished: frames in both
    /// directions go nowhere until the node builds a fresh link.
    pub fn cut(&mut self, key: EndpointKey) {
        self.remove(key);
    }

    /// Hold back the seed-ready report for this endpoint, leaving the
    /// sender's seed unconfirmed.
    pub fn suppress_seed_ready(&mut self, key: EndpointKey) {
        self.suppress_seed_ready.insert(key);
    }

    fn register(&mut self, key: EndpointKey, endpoint: Endpoint) {
        self.remove(key);
        self.endpoints.insert(key, endpoint);
    }

    fn remove(&mut self, key: EndpointKey) {
        if self.endpoints.remove(&key).is_some() {
            self.bindings.retain(|_, k| *k != key);
            self.pending_accepts.retain(|_, k| *k != key);
            for endpoint in self.endpoints.values_mut() {
                if endpoint.remote == Some(key) {
                    endpoint.remote = None;
                }
            }
        }
    }

    fn bind(&mut self, key: EndpointKey, addr: SocketAddr) -> bool {
        if self.occupied.contains(&addr) {
            return false;
        }
        if let Some(existing) = self.bindings.get(&addr) {
            if *existing != key {
                return false;
            }
        }
        self.bindings.insert(addr, key);
        true
    }

    fn connect(&mut self, key: EndpointKey, addr: SocketAddr) -> bool {
        if let Some(&bound_key) = self.bindings.get(&addr) {
            self.endpoints.get_mut(&key).expect("endpoint exists").remote = Some(bound_key);
            self.endpoints.get_mut(&bound_key).expect("bound endpoint").remote = Some(key);
        }
        // A datagram connect succeeds locally even with nobody listening.
        true
    }

    fn wire_password(&mut self, key: EndpointKey, password: u64) -> bool {
        let Some(bound_key) = self.pending_accepts.remove(&password) else {
            return false;
        };
        self.endpoints.get_mut(&key).expect("endpoint exists").remote = Some(bound_key);
        self.endpoints.get_mut(&bound_key).expect("listening endpoint").remote = Some(key);
        true
    }

    fn send_frame(&mut self, key: EndpointKey, frame: &[u8]) {
        *self.frames_sent.entry(key).or_insert(0) += 1;
        let Some(remote_key) = self.endpoints.get(&key).and_then(|e| e.remote) else {
            return;
        };
        let Some(remote) = self.endpoints.get(&remote_key) else { return };
        remote.inbox.send(remote.source, Ev::Link(remote.peer, LinkEvent::Frame(frame.to_vec())));
    }
}

struct MemDatagramLink {
    net: Rc<RefCell<MemNet>>,
    key: EndpointKey,
}

impl DatagramLink for MemDatagramLink {
    fn bind(&mut self, addr: SocketAddr) -> bool {
        self.net.borrow_mut().bind(self.key, addr)
    }

    fn connect(&mut self, addr: SocketAddr) -> bool {
        self.net.borrow_mut().connect(self.key, addr)
    }

    fn set_encryption_key(&mut self, _key: &[u8]) {}

    fn set_otp_send_seed(&mut self, seed_id: u16, _key: &[u8], _iv: &[u8]) {
        self.net.borrow_mut().otp_log.push((self.key, OtpOp::SetSendSeed(seed_id)));
    }

    fn activate_otp_send_seed(&mut self) {
        self.net.borrow_mut().otp_log.push((self.key, OtpOp::ActivateSendSeed));
    }

    fn add_otp_recv_seed(&mut self, seed_id: u16, _key: &[u8], _iv: &[u8]) {
        let mut net = self.net.borrow_mut();
        net.otp_log.push((self.key, OtpOp::AddRecvSeed(seed_id)));
        // The transport provisions the seed and reports it usable.
        if !net.suppress_seed_ready.contains(&self.key) {
            net.inject(self.key, LinkEvent::SeedReady(seed_id));
        }
    }

    fn send_frame(&mut self, frame: &[u8]) {
        self.net.borrow_mut().send_frame(self.key, frame);
    }
}

impl Drop for MemDatagramLink {
    fn drop(&mut self) {
        self.net.borrow_mut().remove(self.key);
    }
}

struct MemStreamLink {
    net: Rc<RefCell<MemNet>>,
    key: EndpointKey,
}

impl StreamLink for MemStreamLink {
    fn listen(&mut self, _bind_index: usize) -> Option<u64> {
        let mut net = self.net.borrow_mut();
        net.next_password += 1;
        let password = net.next_password;
        net.pending_accepts.insert(password, self.key);
        Some(password)
    }

    fn connect(&mut self, _addr: SocketAddr, password: u64) -> bool {
        self.net.borrow_mut().wire_password(self.key, password)
    }

    fn send_frame(&mut self, frame: &[u8]) {
        self.net.borrow_mut().send_frame(self.key, frame);
    }
}

impl Drop for MemStreamLink {
    fn drop(&mut self) {
        self.net.borrow_mut().remove(self.key);
    }
}

struct MemFactory {
    net: Rc<RefCell<MemNet>>,
    client: usize,
}

impl LinkFactory for MemFactory {
    fn datagram(
        &mut self,
        peer: PeerId,
        source: SourceId,
        inbox: Inbox<Ev>,
    ) -> Box<dyn DatagramLink> {
        let key = (self.client, peer);
        self.net
            .borrow_mut()
            .register(key, Endpoint { inbox, source, peer, remote: None });
        Box::new(MemDatagramLink { net: self.net.clone(), key })
    }

    fn stream(&mut self, peer: PeerId, source: SourceId, inbox: Inbox<Ev>) -> Box<dyn StreamLink> {
        let key = (self.client, peer);
        self.net
            .borrow_mut()
            .register(key, Endpoint { inbox, source, peer, remote: None });
        Box::new(MemStreamLink { net: self.net.clone(), key })
    }
}

// =============================================================================
// TAP DEVICE
// =============================================================================

struct MemTap {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl TapDevice for MemTap {
    fn mtu(&self) -> usize {
        1500
    }

    fn write_frame(&mut self, frame: &[u8]) {
        self.frames.borrow_mut().push(frame.to_vec());
    }
}

// =============================================================================
// WORLD
// =============================================================================

pub struct SimNode {
    pub reactor: Reactor<Ev>,
    pub node: Node,
    /// Frames the node wrote to its tap device.
    pub tap: Rc<RefCell<Vec<Vec<u8>>>>,
    inbox: Inbox<Ev>,
    device_source: SourceId,
}

impl SimNode {
    /// Inject a frame as if read from the tap device.
    pub fn send_tap_frame(&self, frame: Vec<u8>) {
        self.inbox.send(self.device_source, Ev::Device(DeviceEvent::Frame(frame)));
    }

    pub fn fail_device(&self) {
        self.inbox.send(self.device_source, Ev::Device(DeviceEvent::Error));
    }
}

pub struct SimWorld {
    pub hub: Rc<RefCell<Hub>>,
    pub net: Rc<RefCell<MemNet>>,
    pub nodes: Vec<SimNode>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub::default())),
            net: Rc::new(RefCell::new(MemNet::default())),
            nodes: Vec::new(),
        }
    }

    /// Create a node with a fixed server-assigned id. Returns its index.
    pub fn add_node(&mut self, id: PeerId, config: Config) -> usize {
        self.add_node_with_ext_ip(id, config, [203, 0, 113, 1])
    }

    pub fn add_node_with_ext_ip(&mut self, id: PeerId, config: Config, ext_ip: [u8; 4]) -> usize {
        let idx = self.nodes.len();
        let mut reactor = Reactor::new_manual();
        let server_source = reactor.source_register();
        let device_source = reactor.source_register();
        let inbox = reactor.inbox();

        self.hub.borrow_mut().register(idx, id, ext_ip, inbox.clone(), server_source);

        let tap = Rc::new(RefCell::new(Vec::new()));
        let node = Node::new(
            config,
            &mut reactor,
            Box::new(HubLink { hub: self.hub.clone(), idx }),
            server_source,
            Box::new(MemTap { frames: tap.clone() }),
            device_source,
            Box::new(MemFactory { net: self.net.clone(), client: idx }),
        );

        self.nodes.push(SimNode { reactor, node, tap, inbox, device_source });
        idx
    }

    /// Send the hello and process the server's ready.
    pub fn connect(&mut self, idx: usize) {
        self.nodes[idx].node.start();
        self.run_until_quiet();
    }

    /// Tell `to` about `about` with the given announcement flags.
    pub fn announce(&mut self, to: usize, about: usize, flags: u16) {
        let id = self.hub.borrow().clients[&about].id;
        let packet = ControlPacket::NewClient { id, flags, cert: Vec::new() }.encode();
        self.hub.borrow_mut().deliver(to, packet);
        self.run_until_quiet();
    }

    /// Announce two nodes to each other.
    pub fn announce_pair(&mut self, a: usize, b: usize, flags_a: u16, flags_b: u16) {
        let id_a = self.hub.borrow().clients[&a].id;
        let id_b = self.hub.borrow().clients[&b].id;
        let to_a = ControlPacket::NewClient { id: id_b, flags: flags_b, cert: Vec::new() }.encode();
        let to_b = ControlPacket::NewClient { id: id_a, flags: flags_a, cert: Vec::new() }.encode();
        {
            let hub = self.hub.borrow();
            hub.deliver(a, to_a);
            hub.deliver(b, to_b);
        }
        self.run_until_quiet();
    }

    /// Withdraw `about` from `to`.
    pub fn withdraw(&mut self, to: usize, about: usize) {
        let id = self.hub.borrow().clients[&about].id;
        let packet = ControlPacket::EndClient { id }.encode();
        self.hub.borrow_mut().deliver(to, packet);
        self.run_until_quiet();
    }

    /// Deliver a raw control packet to a node, bypassing the hub logic.
    pub fn deliver(&mut self, to: usize, packet: ControlPacket) {
        self.hub.borrow_mut().deliver(to, packet.encode());
        self.run_until_quiet();
    }

    /// Step every reactor until nothing makes progress, then check the
    /// structural invariants on every node.
    pub fn run_until_quiet(&mut self) {
        loop {
            let mut worked = false;
            for sim in self.nodes.iter_mut() {
                worked |= sim.reactor.step(&mut sim.node);
            }
            if !worked {
                break;
            }
        }
        for sim in &self.nodes {
            sim.node.check_invariants();
        }
    }

    /// Advance every clock and settle.
    pub fn advance(&mut self, by: Duration) {
        for sim in self.nodes.iter_mut() {
            sim.reactor.advance(by);
        }
        self.run_until_quiet();
    }

    pub fn node_id(&self, idx: usize) -> PeerId {
        self.hub.borrow().clients[&idx].id
    }

    /// Route one outmsg directly between nodes, as the hub does, but from a
    /// forged sender. Used for protocol-abuse tests.
    pub fn forge_peer_msg(&mut self, to: usize, from_id: PeerId, msg: &PeerMsg) {
        let packet = ControlPacket::InMsg { from: from_id, payload: msg.encode().unwrap() };
        self.deliver(to, packet);
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}
