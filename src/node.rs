//! The client node: peer set, state machines and event dispatch.
//!
//! One `Node` owns the server connection state, the fair queue, the frame
//! decider and every peer. It implements [`App`] for the reactor; every
//! timer, job and injected I/O event lands in [`Node::dispatch`] and is
//! routed to the peer lifecycle code below.
//!
//! The peer lifecycle follows the rendezvous protocol: the master of a pair
//! (greater id) binds a local endpoint and sends `youconnect`; the slave
//! picks the first advertised address whose scope it trusts and connects.
//! Failures funnel through `peer_reset` (master re-binds after a retry
//! delay, the slave asks the master via `youretry`) or, for chat failures,
//! through `peer_resetpeer`, which asks the server to recycle the peer.
//! Peers that cannot get a direct link are paired with relay providers.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, ExtAddrSpec};
use crate::dataplane::{DataSink, decode_frame, encode_frame, encode_keepalive};
use crate::decider::{DeciderConfig, FrameDecider};
use crate::msg::{ExternalAddr, PeerMsg};
use crate::peer::{Chat, ChatSslMode, Link, LinkIo, Peer, PeerView, SentSeed};
use crate::proto::MAX_CERT_LEN;
use crate::reactor::{App, Inbox, JobId, LimitId, Reactor, SourceId, TimerId};
use crate::server::{ServerConnection, ServerEvent, ServerLink};
use crate::server_queue::{FairQueue, FlowId};
use crate::transport::{
    DatagramLink, DeviceEvent, LinkEvent, PlainChatCipher, StreamLink, TapDevice, TransportMode,
};
use crate::types::{
    PEER_KEEPALIVE_INTERVAL_MS, PEER_KEEPALIVE_RECEIVE_TIMER_MS, PEER_RETRY_TIME_MS, PeerFlags,
    PeerId, SERVER_FLOW_BUFFER_PACKETS, SERVER_KEEPALIVE_INTERVAL_MS,
};

/// Frames written to the device per reactor iteration.
const DEVICE_WRITES_PER_ITERATION: u64 = 64;

/// Event tags dispatched to the node.
#[derive(Debug, Clone)]
pub enum Ev {
    // Server connection.
    ServerData(Vec<u8>),
    ServerWriteDone,
    ServerError,
    ServerKeepalive,
    ServerEventsJob,
    // Tap device.
    Device(DeviceEvent),
    // Per-peer primitives.
    PeerJobInit(PeerId),
    PeerJobSendSeed(PeerId),
    PeerRetryTimer(PeerId),
    SinkKeepalive(PeerId),
    SinkReceiveTimeout(PeerId),
    Link(PeerId, LinkEvent),
    // Decider membership expiry.
    DeciderTimer,
    // Signal-initiated shutdown.
    Terminate,
}

/// Creates transport links for peer link attempts. The factory tags every
/// event it injects with the peer id it was created for.
pub trait LinkFactory {
    fn datagram(&mut self, peer: PeerId, source: SourceId, inbox: Inbox<Ev>)
    -> Box<dyn DatagramLink>;
    fn stream(&mut self, peer: PeerId, source: SourceId, inbox: Inbox<Ev>) -> Box<dyn StreamLink>;
}

/// A bind address with its advertised endpoints fixed up against the
/// server-reported external IP.
#[derive(Debug, Clone)]
struct ResolvedBindAddr {
    addr: SocketAddr,
    num_ports: u16,
    ext_addrs: Vec<ExternalAddr>,
}

pub struct Node {
    config: Config,
    conn: ServerConnection,
    server_link: Box<dyn ServerLink>,
    server_source: SourceId,
    device: Box<dyn TapDevice>,
    device_source: SourceId,
    factory: Box<dyn LinkFactory>,

    queue: FairQueue,
    keepalive_flow: Option<FlowId>,
    keepalive_timer: TimerId,
    events_job: JobId,
    pending_events: VecDeque<ServerEvent>,

    server_ready: bool,
    self_id: PeerId,
    bind_addrs: Vec<ResolvedBindAddr>,

    peers: HashMap<PeerId, Peer>,
    decider: FrameDecider,
    decider_timer: TimerId,
    relay_providers: VecDeque<PeerId>,
    waiting_relay_peers: VecDeque<PeerId>,

    device_write_limit: LimitId,
    terminating: bool,
}

impl App<Ev> for Node {
    fn dispatch(&mut self, r: &mut Reactor<Ev>, event: Ev) {
        match event {
            Ev::ServerData(data) => self.handle_server_data(r, &data),
            Ev::ServerWriteDone => {
                if let Some(freed) = self.queue.write_done() {
                    debug!("server flow {} freed after draining", freed);
                }
                self.pump_server_queue();
            }
            Ev::ServerError => {
                error!("server connection failed, exiting");
                self.terminate(r, 1);
            }
            Ev::ServerKeepalive => self.handle_server_keepalive(r),
            Ev::ServerEventsJob => self.handle_events_job(r),
            Ev::Device(DeviceEvent::Frame(frame)) => self.handle_device_frame(r, &frame),
            Ev::Device(DeviceEvent::Error) => {
                error!("device error");
                self.terminate(r, 1);
            }
            Ev::PeerJobInit(id) => self.peer_job_init(r, id),
            Ev::PeerJobSendSeed(id) => self.peer_job_send_seed(id),
            Ev::PeerRetryTimer(id) => self.peer_retry_timer(r, id),
            Ev::SinkKeepalive(id) => self.sink_keepalive(r, id),
            Ev::SinkReceiveTimeout(id) => self.sink_receive_timeout(id),
            Ev::Link(id, event) => self.handle_link_event(r, id, event),
            Ev::DeciderTimer => {
                self.decider.expire(r.now());
                self.rearm_decider_timer(r);
            }
            Ev::Terminate => {
                info!("termination requested");
                self.terminate(r, 0);
            }
        }
    }
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        r: &mut Reactor<Ev>,
        server_link: Box<dyn ServerLink>,
        server_source: SourceId,
        device: Box<dyn TapDevice>,
        device_source: SourceId,
        factory: Box<dyn LinkFactory>,
    ) -> Self {
        let decider = FrameDecider::new(DeciderConfig {
            max_macs: config.max_macs,
            max_groups: config.max_groups,
            membership_interval: config.igmp_group_membership_interval,
            last_member_query_time: config.igmp_last_member_query_time,
        });
        Node {
            conn: ServerConnection::new(),
            server_link,
            server_source,
            device,
            device_source,
            factory,
            queue: FairQueue::new(),
            keepalive_flow: None,
            keepalive_timer: r.timer(Ev::ServerKeepalive),
            events_job: r.job(Ev::ServerEventsJob),
            pending_events: VecDeque::new(),
            server_ready: false,
            self_id: 0,
            bind_addrs: Vec::new(),
            peers: HashMap::new(),
            decider,
            decider_timer: r.timer(Ev::DeciderTimer),
            relay_providers: VecDeque::new(),
            waiting_relay_peers: VecDeque::new(),
            device_write_limit: r.limit(DEVICE_WRITES_PER_ITERATION),
            terminating: false,
            config,
        }
    }

    /// Open the session: the hello goes out before anything else.
    pub fn start(&mut self) {
        self.server_link.send_packet(ServerConnection::hello_packet());
    }

    // -------------------------------------------------------------------------
    // Introspection (tests, diagnostics)
    // -------------------------------------------------------------------------

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn server_ready(&self) -> bool {
        self.server_ready
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn peer_view(&self, id: PeerId) -> Option<PeerView> {
        self.peers.get(&id).map(PeerView::from)
    }

    pub fn queue(&self) -> &FairQueue {
        &self.queue
    }

    /// Clamp the peer's server-flow depth. Diagnostic hook; lets tests
    /// drive the chat out-of-buffer path deterministically.
    pub fn set_peer_flow_capacity(&mut self, id: PeerId, capacity: usize) {
        if let Some(peer) = self.peers.get(&id) {
            self.queue.flow_set_capacity(peer.flow_id, capacity);
        }
    }

    pub fn decider(&self) -> &FrameDecider {
        &self.decider
    }

    fn am_master(&self, other: PeerId) -> bool {
        self.self_id > other
    }

    /// Structural invariants; tests call this after every simulated event.
    pub fn check_invariants(&self) {
        assert!(self.peers.len() <= self.config.max_peers);
        for (id, peer) in &self.peers {
            assert_eq!(*id, peer.id);
            if self.server_ready {
                assert_ne!(*id, self.self_id);
            }
            peer.check_link_state();
            assert!(!peer.is_relay || peer.have_link());
            if let Some(relay) = peer.relaying_via {
                let provider = self.peers.get(&relay).expect("relay provider exists");
                assert!(provider.is_relay);
                assert!(provider.relay_users.contains(id));
            }
            if peer.waiting_relay {
                assert!(self.waiting_relay_peers.contains(id));
            }
        }
        for id in &self.waiting_relay_peers {
            assert!(self.peers.get(id).map(|p| p.waiting_relay).unwrap_or(false));
        }
        for id in &self.relay_providers {
            assert!(self.peers.get(id).map(|p| p.is_relay).unwrap_or(false));
        }
    }

    // -------------------------------------------------------------------------
    // Server connection
    // -------------------------------------------------------------------------

    fn handle_server_data(&mut self, r: &mut Reactor<Ev>, data: &[u8]) {
        match self.conn.receive(data) {
            Ok(events) => {
                if !events.is_empty() {
                    self.pending_events.extend(events);
                    r.job_set(self.events_job);
                }
            }
            Err(e) => {
                error!("server connection failed: {}", e);
                self.terminate(r, 1);
            }
        }
    }

    /// Server events are delivered one per job so that anything a handler
    /// posts (in particular a new peer's init job) runs before the next
    /// event.
    fn handle_events_job(&mut self, r: &mut Reactor<Ev>) {
        let Some(event) = self.pending_events.pop_front() else { return };
        self.handle_server_event(r, event);
        if !self.pending_events.is_empty() {
            r.job_set(self.events_job);
        }
    }

    fn handle_server_event(&mut self, r: &mut Reactor<Ev>, event: ServerEvent) {
        match event {
            ServerEvent::Ready { self_id, ext_ip } => self.handle_ready(r, self_id, ext_ip),
            ServerEvent::NewClient { id, flags, cert } => self.handle_newclient(r, id, flags, cert),
            ServerEvent::EndClient { id } => self.handle_endclient(r, id),
            ServerEvent::Message { from, payload } => self.handle_peer_message(r, from, payload),
        }
    }

    fn handle_ready(&mut self, r: &mut Reactor<Ev>, self_id: PeerId, ext_ip: [u8; 4]) {
        self.self_id = self_id;

        // Fix server-reported external addresses against what the server saw.
        let mut resolved = Vec::with_capacity(self.config.bind_addrs.len());
        for bind in &self.config.bind_addrs {
            let mut ext_addrs = Vec::with_capacity(bind.ext_addrs.len());
            for ext in &bind.ext_addrs {
                let addr = match &ext.spec {
                    ExtAddrSpec::Fixed(addr) => *addr,
                    ExtAddrSpec::ServerReported { port } => {
                        if ext_ip == [0, 0, 0, 0] {
                            error!("server did not provide our address");
                            self.terminate(r, 1);
                            return;
                        }
                        let addr = SocketAddr::from((ext_ip, *port));
                        info!("external address: server reported {}", addr);
                        addr
                    }
                };
                ext_addrs.push(ExternalAddr { scope: ext.scope.clone(), addr });
            }
            resolved.push(ResolvedBindAddr {
                addr: bind.addr,
                num_ports: bind.num_ports,
                ext_addrs,
            });
        }
        self.bind_addrs = resolved;

        // The fair queue owns the writer from here on; keepalives get their
        // own always-connected flow.
        let keepalive_flow = self.queue.flow_init(1);
        self.queue.flow_connect(keepalive_flow);
        self.keepalive_flow = Some(keepalive_flow);
        r.timer_set(self.keepalive_timer, Duration::from_millis(SERVER_KEEPALIVE_INTERVAL_MS));

        self.server_ready = true;
        info!("server: ready, my ID is {}", self.self_id);
    }

    fn handle_server_keepalive(&mut self, r: &mut Reactor<Ev>) {
        if let Some(flow) = self.keepalive_flow {
            // A still-queued previous keepalive just means the link is slow.
            let _ = self.queue.submit(flow, ServerConnection::keepalive_packet());
            self.pump_server_queue();
        }
        r.timer_set(self.keepalive_timer, Duration::from_millis(SERVER_KEEPALIVE_INTERVAL_MS));
    }

    fn pump_server_queue(&mut self) {
        if let Some((flow, packet)) = self.queue.start_next() {
            trace!("server queue: flow {} transmitting", flow);
            self.server_link.send_packet(packet);
        }
    }

    // -------------------------------------------------------------------------
    // Peer set
    // -------------------------------------------------------------------------

    fn handle_newclient(&mut self, r: &mut Reactor<Ev>, id: PeerId, flags: PeerFlags, cert: Vec<u8>) {
        if self.peers.contains_key(&id) {
            warn!("server: newclient: peer {} already known", id);
            return;
        }
        if id == self.self_id {
            warn!("server: newclient: peer has our ID");
            return;
        }
        if self.peers.len() >= self.config.max_peers {
            warn!("server: newclient: no space for peer {} (maximum number reached)", id);
            return;
        }
        if cert.len() > MAX_CERT_LEN {
            warn!("server: newclient: oversized certificate");
            return;
        }
        if !self.config.ssl && !cert.is_empty() {
            warn!("server: newclient: certificate supplied, but not using TLS");
            return;
        }
        self.peer_add(r, id, flags, cert);
    }

    fn handle_endclient(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        if !self.peers.contains_key(&id) {
            warn!("server: endclient: peer {} not known", id);
            return;
        }
        self.peer_remove(r, id, false);
    }

    fn peer_add(&mut self, r: &mut Reactor<Ev>, id: PeerId, flags: PeerFlags, cert: Vec<u8>) {
        if flags.ssl() && !self.config.ssl {
            error!("peer {}: requires talking with TLS, but we have none configured", id);
            return;
        }
        if self.config.ssl && !flags.ssl() && !self.config.allow_peer_talk_without_ssl {
            error!("peer {}: requires talking without TLS, but we don't allow that", id);
            return;
        }
        if self.config.ssl {
            // DER sanity: a certificate is a SEQUENCE.
            if cert.is_empty() || cert[0] & 0x1f != 0x10 {
                error!("peer {}: certificate does not look like DER", id);
                return;
            }
            debug!("peer {}: certificate fingerprint {}", id, hex::encode(&cert[..cert.len().min(8)]));
        }

        let chat_ssl_mode = if flags.ssl() {
            if self.am_master(id) { ChatSslMode::Server } else { ChatSslMode::Client }
        } else {
            ChatSslMode::None
        };

        // The init job must exist before the server flow so the first
        // message we compose already has a lane.
        let job_init = r.job(Ev::PeerJobInit(id));
        r.job_set(job_init);

        let flow_id = self.queue.flow_init(SERVER_FLOW_BUFFER_PACKETS);
        self.queue.flow_connect(flow_id);

        let peer = Peer {
            id,
            flags,
            common_name: None,
            cert,
            chat: Some(Chat::new(chat_ssl_mode, Box::new(PlainChatCipher))),
            resetpeer_sent: false,
            flow_id,
            job_init,
            retry_timer: r.timer(Ev::PeerRetryTimer(id)),
            link: None,
            relaying_via: None,
            waiting_relay: false,
            is_relay: false,
            relay_users: Vec::new(),
            binding: false,
            binding_addr_index: 0,
            flow: crate::dataplane::DataFlow::new(id, self.config.send_buffer_size),
        };
        self.decider.peer_add(id);
        self.peers.insert(id, peer);

        match chat_ssl_mode {
            ChatSslMode::None => info!("peer {}: initialized; talking in plaintext mode", id),
            ChatSslMode::Client => info!("peer {}: initialized; talking in TLS client mode", id),
            ChatSslMode::Server => info!("peer {}: initialized; talking in TLS server mode", id),
        }
    }

    fn peer_remove(&mut self, r: &mut Reactor<Ev>, id: PeerId, exiting: bool) {
        info!("peer {}: removing", id);

        self.peer_cleanup_connections(r, id);

        let Some(mut peer) = self.peers.remove(&id) else { return };
        debug_assert!(!peer.have_link());
        debug_assert!(peer.relaying_via.is_none());
        debug_assert!(!peer.waiting_relay);
        debug_assert!(!peer.is_relay);

        r.timer_free(peer.retry_timer);
        self.decider.peer_remove(id);

        // Chat or the resetpeer source is the flow's producer; detach it.
        if peer.chat.take().is_some() || peer.resetpeer_sent {
            self.queue.flow_disconnect(peer.flow_id);
        }

        if exiting || !self.queue.flow_is_busy(peer.flow_id) {
            self.queue.flow_free(peer.flow_id);
        } else {
            debug!("peer {}: server flow busy, marking dying", id);
            self.queue.flow_die(peer.flow_id);
        }

        r.job_free(peer.job_init);
    }

    fn peer_job_init(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        if !self.peers.contains_key(&id) {
            return;
        }
        if self.am_master(id) {
            self.peer_start_binding(r, id);
        }
    }

    // -------------------------------------------------------------------------
    // Link lifecycle
    // -------------------------------------------------------------------------

    fn peer_init_link(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let source = r.source_register();
        let inbox = r.inbox();
        let io = match self.config.transport {
            TransportMode::Udp => LinkIo::Datagram(self.factory.datagram(id, source, inbox)),
            TransportMode::Tcp => LinkIo::Stream(self.factory.stream(id, source, inbox)),
        };
        let keepalive_timer = r.timer(Ev::SinkKeepalive(id));
        let receive_timer = r.timer(Ev::SinkReceiveTimeout(id));
        let job_send_seed = r.job(Ev::PeerJobSendSeed(id));
        r.timer_set(keepalive_timer, Duration::from_millis(PEER_KEEPALIVE_INTERVAL_MS));

        let send_buffer = self.config.send_buffer_size;
        let peer = self.peers.get_mut(&id).expect("link init for live peer");
        debug_assert!(!peer.have_link());
        debug_assert!(peer.relaying_via.is_none());
        debug_assert!(!peer.waiting_relay);
        peer.flow.attach(id, send_buffer);
        peer.link = Some(Link {
            io,
            source,
            sink: DataSink::new(keepalive_timer, receive_timer),
            sendseed_next_id: 0,
            sendseed_sent: None,
            pending_recv_seed_id: None,
            job_send_seed,
        });
    }

    fn peer_free_link(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let peer = self.peers.get_mut(&id).expect("link free for live peer");
        debug_assert!(!peer.is_relay);
        if let Some(link) = peer.link.take() {
            peer.flow.detach();
            r.timer_free(link.sink.keepalive_timer);
            r.timer_free(link.sink.receive_timer);
            r.job_free(link.job_send_seed);
            r.source_unregister(link.source);
        }
    }

    /// The only edge that tears down link, relaying or waiting-relay state.
    /// Idempotent.
    fn peer_cleanup_connections(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else { return };
        let (have_link, is_relay, relaying, waiting) =
            (peer.have_link(), peer.is_relay, peer.relaying_via.is_some(), peer.waiting_relay);
        if have_link {
            if is_relay {
                self.peer_disable_relay_provider(id);
            }
            self.peer_free_link(r, id);
        } else if relaying {
            self.peer_free_relaying(id);
        } else if waiting {
            self.peer_unregister_need_relay(id);
        }
    }

    // -------------------------------------------------------------------------
    // Relaying
    // -------------------------------------------------------------------------

    fn peer_enable_relay_provider(&mut self, id: PeerId) {
        let peer = self.peers.get_mut(&id).expect("provider is live");
        debug_assert!(peer.have_link());
        debug_assert!(!peer.is_relay);
        peer.is_relay = true;
        self.relay_providers.push_back(id);
        debug!("peer {}: now a relay provider", id);
        self.assign_relays();
    }

    fn peer_disable_relay_provider(&mut self, id: PeerId) {
        let users = {
            let peer = self.peers.get_mut(&id).expect("provider is live");
            debug_assert!(peer.is_relay);
            peer.is_relay = false;
            std::mem::take(&mut peer.relay_users)
        };
        for user in users {
            if let Some(peer) = self.peers.get_mut(&user) {
                debug_assert_eq!(peer.relaying_via, Some(id));
                info!("peer {}: uninstalling relaying through {}", user, id);
                peer.relaying_via = None;
                peer.flow.detach();
                peer.waiting_relay = true;
                self.waiting_relay_peers.push_back(user);
            }
        }
        self.relay_providers.retain(|p| *p != id);
        self.assign_relays();
    }

    fn peer_install_relaying(&mut self, user: PeerId, relay: PeerId) {
        info!("peer {}: installing relaying through {}", user, relay);
        let capacity = self.config.send_buffer_relay_size;
        self.peers.get_mut(&relay).expect("relay is live").relay_users.push(user);
        let peer = self.peers.get_mut(&user).expect("user is live");
        debug_assert!(!peer.have_link());
        debug_assert!(!peer.waiting_relay);
        debug_assert!(peer.relaying_via.is_none());
        peer.flow.attach(relay, capacity);
        peer.relaying_via = Some(relay);
    }

    fn peer_free_relaying(&mut self, user: PeerId) {
        let relay = {
            let peer = self.peers.get_mut(&user).expect("user is live");
            let relay = peer.relaying_via.take().expect("was relaying");
            peer.flow.detach();
            relay
        };
        info!("peer {}: uninstalling relaying through {}", user, relay);
        if let Some(provider) = self.peers.get_mut(&relay) {
            provider.relay_users.retain(|u| *u != user);
        }
    }

    fn peer_need_relay(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let (is_relay, waiting, have_link, relaying) = match self.peers.get(&id) {
            Some(peer) => {
                (peer.is_relay, peer.waiting_relay, peer.have_link(), peer.relaying_via.is_some())
            }
            None => return,
        };
        if is_relay {
            // A provider has a working link; tearing it down would orphan
            // its users.
            return;
        }
        if waiting {
            return;
        }
        if have_link {
            self.peer_free_link(r, id);
        } else if relaying {
            self.peer_free_relaying(id);
        }
        self.peer_register_need_relay(id);
        self.assign_relays();
    }

    fn peer_register_need_relay(&mut self, id: PeerId) {
        let peer = self.peers.get_mut(&id).expect("peer is live");
        debug_assert!(!peer.waiting_relay);
        debug_assert!(!peer.have_link());
        debug_assert!(peer.relaying_via.is_none());
        peer.waiting_relay = true;
        self.waiting_relay_peers.push_back(id);
    }

    fn peer_unregister_need_relay(&mut self, id: PeerId) {
        let peer = self.peers.get_mut(&id).expect("peer is live");
        debug_assert!(peer.waiting_relay);
        peer.waiting_relay = false;
        self.waiting_relay_peers.retain(|p| *p != id);
    }

    /// Pair waiting peers with the first available provider until one of
    /// the lists is empty.
    fn assign_relays(&mut self) {
        while let Some(&waiter) = self.waiting_relay_peers.front() {
            let Some(&provider) = self.relay_providers.front() else {
                debug!("no relays available");
                return;
            };
            self.peer_unregister_need_relay(waiter);
            self.peer_install_relaying(waiter, provider);
        }
    }

    // -------------------------------------------------------------------------
    // Reset paths
    // -------------------------------------------------------------------------

    /// Link-level failure: tear down and either retry (master) or ask the
    /// master to (slave).
    fn peer_reset(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        info!("peer {}: resetting", id);
        self.peer_cleanup_connections(r, id);
        if self.am_master(id) {
            let timer = self.peers.get(&id).expect("peer is live").retry_timer;
            r.timer_set(timer, Duration::from_millis(PEER_RETRY_TIME_MS));
        } else {
            self.peer_send_msg(id, PeerMsg::YouRetry);
        }
    }

    fn peer_retry_timer(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        if !self.peers.contains_key(&id) {
            return;
        }
        debug_assert!(self.am_master(id));
        info!("peer {}: retry timer expired", id);
        self.peer_start_binding(r, id);
    }

    /// Chat-level failure: drop the chat and ask the server to recycle the
    /// peer with a one-shot resetpeer packet on our flow.
    fn peer_resetpeer(&mut self, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        if peer.resetpeer_sent || peer.chat.is_none() {
            return;
        }
        peer.chat = None;
        peer.resetpeer_sent = true;
        let flow = peer.flow_id;

        // Swap the flow's producer: out with the chat, in with the one-shot
        // control packet. The resetpeer source holds exactly one packet, so
        // the flow gets that much room even if the chat exhausted its own.
        self.queue.flow_disconnect(flow);
        self.queue.flow_clear(flow);
        self.queue.flow_set_capacity(flow, 1);
        self.queue.flow_connect(flow);
        if self.queue.submit(flow, ServerConnection::resetpeer_packet(id)).is_err() {
            warn!("peer {}: could not queue resetpeer", id);
        }
        self.pump_server_queue();
    }

    // -------------------------------------------------------------------------
    // Chat
    // -------------------------------------------------------------------------

    fn handle_peer_message(&mut self, r: &mut Reactor<Ev>, from: PeerId, payload: Vec<u8>) {
        enum Opened {
            NoPeer,
            NoChat,
            Pending,
            Failed,
            Msg(Vec<u8>),
        }
        let opened = match self.peers.get_mut(&from) {
            None => Opened::NoPeer,
            Some(peer) => match peer.chat.as_mut() {
                None => Opened::NoChat,
                Some(chat) => match chat.open(&payload) {
                    Ok(Some(bytes)) => Opened::Msg(bytes),
                    Ok(None) => Opened::Pending,
                    Err(_) => Opened::Failed,
                },
            },
        };
        match opened {
            Opened::NoPeer => warn!("server: message: peer {} not known", from),
            Opened::NoChat => error!("peer {}: cannot process message, chat is down", from),
            Opened::Pending => {}
            Opened::Failed => {
                error!("peer {}: chat error, sending resetpeer", from);
                self.peer_resetpeer(from);
            }
            Opened::Msg(bytes) => match PeerMsg::decode(&bytes) {
                Ok(msg) => self.handle_peer_msg(r, from, msg),
                Err(e) => warn!("peer {}: msg: failed to parse: {}", from, e),
            },
        }
    }

    fn handle_peer_msg(&mut self, r: &mut Reactor<Ev>, id: PeerId, msg: PeerMsg) {
        trace!("peer {}: received {}", id, msg.kind_name());
        match msg {
            PeerMsg::YouConnect { addrs, key, password } => {
                self.msg_youconnect(r, id, addrs, key, password)
            }
            PeerMsg::CannotConnect => self.msg_cannotconnect(r, id),
            PeerMsg::CannotBind => self.msg_cannotbind(r, id),
            PeerMsg::YouRetry => self.msg_youretry(r, id),
            PeerMsg::Seed { seed_id, key, iv } => self.msg_seed(id, seed_id, key, iv),
            PeerMsg::ConfirmSeed { seed_id } => self.msg_confirmseed(id, seed_id),
        }
    }

    fn peer_send_msg(&mut self, id: PeerId, msg: PeerMsg) {
        let encoded = match msg.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("peer {}: cannot encode {}: {}", id, msg.kind_name(), e);
                return;
            }
        };
        enum Sealed {
            NoChat,
            Failed,
            Packet(FlowId, Vec<u8>),
        }
        let sealed = match self.peers.get_mut(&id) {
            None => return,
            Some(peer) => match peer.chat.as_mut() {
                None => Sealed::NoChat,
                Some(chat) => match chat.seal(&encoded) {
                    Ok(bytes) => Sealed::Packet(peer.flow_id, bytes),
                    Err(_) => Sealed::Failed,
                },
            },
        };
        match sealed {
            Sealed::NoChat => error!("peer {}: cannot send message, chat is down", id),
            Sealed::Failed => {
                error!("peer {}: chat error, sending resetpeer", id);
                self.peer_resetpeer(id);
            }
            Sealed::Packet(flow, bytes) => {
                let packet = ServerConnection::outmsg_packet(id, bytes);
                match self.queue.submit(flow, packet) {
                    Ok(()) => self.pump_server_queue(),
                    Err(_) => {
                        error!("peer {}: cannot send message, out of buffer, sending resetpeer", id);
                        self.peer_resetpeer(id);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Signalling message handlers
    // -------------------------------------------------------------------------

    fn msg_youconnect(
        &mut self,
        r: &mut Reactor<Ev>,
        id: PeerId,
        addrs: Vec<ExternalAddr>,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    ) {
        // Addresses are tried in order; the first with a trusted scope wins.
        let chosen = addrs
            .into_iter()
            .find(|entry| self.config.scopes.iter().any(|scope| *scope == entry.scope));
        let Some(entry) = chosen else {
            info!("peer {}: youconnect: no usable addresses", id);
            self.peer_send_msg(id, PeerMsg::CannotConnect);
            return;
        };
        info!("peer {}: youconnect: using address {} in scope '{}'", id, entry.addr, entry.scope);

        match self.config.transport {
            TransportMode::Udp => {
                if self.config.sp_params.have_encryption() {
                    let Some(k) = key.as_ref() else {
                        warn!("peer {}: youconnect: no key", id);
                        return;
                    };
                    if k.len() != self.config.sp_params.encryption.key_len() {
                        warn!("peer {}: youconnect: wrong key size", id);
                        return;
                    }
                }
            }
            TransportMode::Tcp => {
                if password.is_none() {
                    warn!("peer {}: youconnect: no password", id);
                    return;
                }
            }
        }

        info!("peer {}: connecting", id);
        self.peer_connect(r, id, entry.addr, key, password.unwrap_or(0));
    }

    fn msg_cannotconnect(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let Some(peer) = self.peers.get(&id) else { return };
        if !peer.binding {
            warn!("peer {}: cannotconnect: not binding", id);
            return;
        }
        info!("peer {}: peer could not connect", id);
        self.peer_bind(r, id);
    }

    fn msg_cannotbind(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        if self.am_master(id) {
            warn!("peer {}: cannotbind: but we are the master", id);
            return;
        }
        info!("peer {}: peer cannot bind", id);
        let is_relay = self.peers.get(&id).map(|p| p.is_relay).unwrap_or(false);
        if !is_relay {
            self.peer_need_relay(r, id);
        }
    }

    fn msg_youretry(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        if !self.am_master(id) {
            warn!("peer {}: youretry: we are not master", id);
            return;
        }
        info!("peer {}: requests reset", id);
        self.peer_reset(r, id);
    }

    fn msg_seed(&mut self, id: PeerId, seed_id: u16, key: Vec<u8>, iv: Vec<u8>) {
        if self.config.transport != TransportMode::Udp {
            warn!("peer {}: seed: not in UDP mode", id);
            return;
        }
        if !self.config.sp_params.have_otp() {
            warn!("peer {}: seed: OTPs disabled", id);
            return;
        }
        if key.len() != self.config.sp_params.otp_key_len() {
            warn!("peer {}: seed: wrong key length", id);
            return;
        }
        if iv.len() != self.config.sp_params.otp_iv_len() {
            warn!("peer {}: seed: wrong IV length", id);
            return;
        }
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let Some(link) = peer.link.as_mut() else {
            warn!("peer {}: seed: have no link", id);
            return;
        };
        debug!("peer {}: received OTP receive seed {}", id, seed_id);
        if let LinkIo::Datagram(io) = &mut link.io {
            io.add_otp_recv_seed(seed_id, &key, &iv);
            // Confirmed from the seed-ready callback.
            link.pending_recv_seed_id = Some(seed_id);
        }
    }

    fn msg_confirmseed(&mut self, id: PeerId, seed_id: u16) {
        if self.config.transport != TransportMode::Udp {
            warn!("peer {}: confirmseed: not in UDP mode", id);
            return;
        }
        if !self.config.sp_params.have_otp() {
            warn!("peer {}: confirmseed: OTPs disabled", id);
            return;
        }
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let Some(link) = peer.link.as_mut() else {
            warn!("peer {}: confirmseed: have no link", id);
            return;
        };
        let Some(sent) = link.sendseed_sent.as_ref() else {
            warn!("peer {}: confirmseed: no seed has been sent", id);
            return;
        };
        if sent.id != seed_id {
            warn!(
                "peer {}: confirmseed: invalid seed: expecting {}, received {}",
                id, sent.id, seed_id
            );
            return;
        }
        debug!("peer {}: OTP send seed {} confirmed", id, seed_id);
        link.sendseed_sent = None;
        if let LinkIo::Datagram(io) = &mut link.io {
            io.activate_otp_send_seed();
        }
    }

    // -------------------------------------------------------------------------
    // OTP seeds
    // -------------------------------------------------------------------------

    fn peer_job_send_seed(&mut self, id: PeerId) {
        let key_len = self.config.sp_params.otp_key_len();
        let iv_len = self.config.sp_params.otp_iv_len();
        if key_len == 0 {
            return;
        }
        let msg = {
            let Some(peer) = self.peers.get_mut(&id) else { return };
            let Some(link) = peer.link.as_mut() else { return };
            if link.sendseed_sent.is_some() {
                return;
            }
            let seed_id = link.sendseed_next_id;
            link.sendseed_next_id = link.sendseed_next_id.wrapping_add(1);
            let mut key = vec![0u8; key_len];
            let mut iv = vec![0u8; iv_len];
            rand::thread_rng().fill_bytes(&mut key);
            rand::thread_rng().fill_bytes(&mut iv);
            if let LinkIo::Datagram(io) = &mut link.io {
                io.set_otp_send_seed(seed_id, &key, &iv);
            }
            link.sendseed_sent = Some(SentSeed { id: seed_id, key: key.clone(), iv: iv.clone() });
            debug!("peer {}: sending OTP send seed {}", id, seed_id);
            PeerMsg::Seed { seed_id, key, iv }
        };
        self.peer_send_msg(id, msg);
    }

    // -------------------------------------------------------------------------
    // Binding and connecting
    // -------------------------------------------------------------------------

    fn peer_start_binding(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        peer.binding = true;
        peer.binding_addr_index = 0;
        self.peer_bind(r, id);
    }

    fn peer_bind(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        loop {
            let index = match self.peers.get(&id) {
                Some(peer) => {
                    debug_assert!(peer.binding);
                    peer.binding_addr_index
                }
                None => return,
            };
            if index >= self.bind_addrs.len() {
                break;
            }
            // A bind address advertising nothing is useless to the peer.
            if self.bind_addrs[index].ext_addrs.is_empty() {
                self.peers.get_mut(&id).expect("peer is live").binding_addr_index += 1;
                continue;
            }
            let cont = self.peer_bind_one_address(r, id, index);
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.binding_addr_index += 1;
            }
            if !cont {
                return;
            }
        }

        info!("peer {}: no more addresses to bind to", id);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.binding = false;
        }
        self.peer_send_msg(id, PeerMsg::CannotBind);
        let is_relay = self.peers.get(&id).map(|p| p.is_relay).unwrap_or(false);
        if !is_relay {
            self.peer_need_relay(r, id);
        }
    }

    /// Try one bind address; returns whether the walk should continue.
    fn peer_bind_one_address(&mut self, r: &mut Reactor<Ev>, id: PeerId, index: usize) -> bool {
        // Fresh link for every attempt.
        self.peer_cleanup_connections(r, id);
        self.peer_init_link(r, id);

        match self.config.transport {
            TransportMode::Udp => {
                let (base_addr, num_ports) =
                    (self.bind_addrs[index].addr, self.bind_addrs[index].num_ports);
                let bound = {
                    let peer = self.peers.get_mut(&id).expect("peer is live");
                    let link = peer.link.as_mut().expect("fresh link");
                    let LinkIo::Datagram(io) = &mut link.io else { unreachable!() };
                    let mut bound = None;
                    for port_add in 0..num_ports {
                        let mut addr = base_addr;
                        addr.set_port(base_addr.port().wrapping_add(port_add));
                        if io.bind(addr) {
                            bound = Some(port_add);
                            break;
                        }
                    }
                    bound
                };
                let Some(port_add) = bound else {
                    info!("peer {}: failed to bind to any port of address {}", id, index);
                    return true;
                };

                let mut key = None;
                if self.config.sp_params.have_encryption() {
                    let mut bytes = vec![0u8; self.config.sp_params.encryption.key_len()];
                    rand::thread_rng().fill_bytes(&mut bytes);
                    let peer = self.peers.get_mut(&id).expect("peer is live");
                    let link = peer.link.as_mut().expect("fresh link");
                    if let LinkIo::Datagram(io) = &mut link.io {
                        io.set_encryption_key(&bytes);
                    }
                    key = Some(bytes);
                }
                if self.config.sp_params.have_otp() {
                    let job = {
                        let peer = self.peers.get(&id).expect("peer is live");
                        peer.link.as_ref().expect("fresh link").job_send_seed
                    };
                    r.job_set(job);
                }

                info!("peer {}: bound to address number {}", id, index);
                self.peer_send_connectinfo(id, index, port_add, key, None);
                false
            }
            TransportMode::Tcp => {
                let password = {
                    let peer = self.peers.get_mut(&id).expect("peer is live");
                    let link = peer.link.as_mut().expect("fresh link");
                    let LinkIo::Stream(io) = &mut link.io else { unreachable!() };
                    io.listen(index)
                };
                match password {
                    Some(password) => {
                        info!("peer {}: bound to address number {}", id, index);
                        self.peer_send_connectinfo(id, index, 0, None, Some(password));
                        false
                    }
                    None => {
                        info!("peer {}: listener unavailable for address {}", id, index);
                        true
                    }
                }
            }
        }
    }

    fn peer_send_connectinfo(
        &mut self,
        id: PeerId,
        index: usize,
        port_adjust: u16,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    ) {
        let addrs: Vec<ExternalAddr> = self.bind_addrs[index]
            .ext_addrs
            .iter()
            .map(|entry| {
                let mut addr = entry.addr;
                addr.set_port(addr.port().wrapping_add(port_adjust));
                ExternalAddr { scope: entry.scope.clone(), addr }
            })
            .collect();
        self.peer_send_msg(id, PeerMsg::YouConnect { addrs, key, password });
    }

    fn peer_connect(
        &mut self,
        r: &mut Reactor<Ev>,
        id: PeerId,
        addr: SocketAddr,
        key: Option<Vec<u8>>,
        password: u64,
    ) {
        self.peer_cleanup_connections(r, id);
        self.peer_init_link(r, id);

        let connected = {
            let peer = self.peers.get_mut(&id).expect("peer is live");
            let link = peer.link.as_mut().expect("fresh link");
            match &mut link.io {
                LinkIo::Datagram(io) => {
                    if !io.connect(addr) {
                        false
                    } else {
                        if let Some(key) = key.as_ref() {
                            io.set_encryption_key(key);
                        }
                        true
                    }
                }
                LinkIo::Stream(io) => io.connect(addr, password),
            }
        };
        if !connected {
            info!("peer {}: connect failed", id);
            self.peer_reset(r, id);
            return;
        }
        if self.config.transport == TransportMode::Udp && self.config.sp_params.have_otp() {
            let job = {
                let peer = self.peers.get(&id).expect("peer is live");
                peer.link.as_ref().expect("fresh link").job_send_seed
            };
            r.job_set(job);
        }
    }

    // -------------------------------------------------------------------------
    // Link events and the data plane
    // -------------------------------------------------------------------------

    fn handle_link_event(&mut self, r: &mut Reactor<Ev>, id: PeerId, event: LinkEvent) {
        match event {
            LinkEvent::Error => {
                info!("peer {}: link failed", id);
                self.peer_reset(r, id);
            }
            LinkEvent::SeedWarning => {
                let Some(peer) = self.peers.get(&id) else { return };
                let Some(link) = peer.link.as_ref() else { return };
                if link.sendseed_sent.is_none() {
                    r.job_set(link.job_send_seed);
                }
            }
            LinkEvent::SeedReady(_) => {
                let pending = self
                    .peers
                    .get(&id)
                    .and_then(|p| p.link.as_ref())
                    .and_then(|l| l.pending_recv_seed_id);
                match pending {
                    Some(seed_id) => self.peer_send_msg(id, PeerMsg::ConfirmSeed { seed_id }),
                    None => warn!("peer {}: seed ready without a pending seed", id),
                }
            }
            LinkEvent::Frame(frame) => self.handle_link_frame(r, id, &frame),
        }
    }

    /// Link up/down edges. A provider-capable peer becomes a relay provider
    /// on up; a provider stops providing on down.
    fn peer_dataproto_handler(&mut self, id: PeerId, up: bool) {
        let Some(peer) = self.peers.get(&id) else { return };
        debug_assert!(peer.have_link());
        if up {
            info!("peer {}: up", id);
            if peer.flags.relay_server() && !peer.is_relay {
                self.peer_enable_relay_provider(id);
            }
        } else {
            info!("peer {}: down", id);
            if peer.is_relay {
                self.peer_disable_relay_provider(id);
            }
        }
    }

    fn sink_keepalive(&mut self, r: &mut Reactor<Ev>, id: PeerId) {
        let self_id = self.self_id;
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let Some(link) = peer.link.as_mut() else { return };
        let frame = encode_keepalive(link.sink.is_up(), self_id);
        link.io.send_frame(&frame);
        r.timer_set(link.sink.keepalive_timer, Duration::from_millis(PEER_KEEPALIVE_INTERVAL_MS));
    }

    fn sink_receive_timeout(&mut self, id: PeerId) {
        let down_edge = match self.peers.get_mut(&id).and_then(|p| p.link.as_mut()) {
            Some(link) => link.sink.on_receive_timeout(),
            None => return,
        };
        if down_edge {
            self.peer_dataproto_handler(id, false);
        }
    }

    fn handle_link_frame(&mut self, r: &mut Reactor<Ev>, id: PeerId, frame: &[u8]) {
        let (header, payload) = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("peer {}: bad data frame: {}", id, e);
                return;
            }
        };
        let payload = payload.to_vec();

        // Hearing the peer keeps the link up.
        let up_edge = {
            let Some(peer) = self.peers.get_mut(&id) else { return };
            let Some(link) = peer.link.as_mut() else { return };
            r.timer_set(
                link.sink.receive_timer,
                Duration::from_millis(PEER_KEEPALIVE_RECEIVE_TIMER_MS),
            );
            link.sink.on_received()
        };
        if up_edge {
            self.peer_dataproto_handler(id, true);
        }

        if payload.is_empty() {
            return;
        }

        // Learning is attributed to the original sender, which differs from
        // the link peer for relayed frames.
        if self.peers.contains_key(&header.from) {
            self.decider.analyze_from_peer(header.from, &payload, r.now());
            self.rearm_decider_timer(r);
        }

        let relay_allowed =
            self.peers.get(&id).map(|p| p.flags.relay_client()).unwrap_or(false);
        for dest in header.dests {
            if dest == self.self_id {
                if r.limit_inc(self.device_write_limit) {
                    self.device.write_frame(&payload);
                } else {
                    trace!("device write budget exhausted, dropping frame");
                }
            } else if relay_allowed {
                // Forward on behalf of a relay client.
                let Some(peer) = self.peers.get_mut(&dest) else { continue };
                let Some(link) = peer.link.as_mut() else { continue };
                let wire = encode_frame(link.sink.is_up(), header.from, &[dest], &payload);
                link.io.send_frame(&wire);
                r.timer_set(
                    link.sink.keepalive_timer,
                    Duration::from_millis(PEER_KEEPALIVE_INTERVAL_MS),
                );
            }
        }
    }

    fn handle_device_frame(&mut self, r: &mut Reactor<Ev>, frame: &[u8]) {
        let mut decision = self.decider.decide(frame);
        let mut routed = Vec::new();
        while let Some((dest, more_follow)) = decision.next_destination() {
            if let Some(peer) = self.peers.get_mut(&dest) {
                peer.flow.route(frame, more_follow);
                routed.push(dest);
            }
        }
        for dest in routed {
            self.drain_flow(r, dest);
        }
    }

    /// Push everything queued on the flow toward its sink owner's link.
    fn drain_flow(&mut self, r: &mut Reactor<Ev>, dest: PeerId) {
        let (owner, frames) = {
            let Some(peer) = self.peers.get_mut(&dest) else { return };
            let Some(owner) = peer.flow.attached_to() else { return };
            let mut frames = Vec::new();
            while let Some(frame) = peer.flow.pop() {
                frames.push(frame);
            }
            (owner, frames)
        };
        if frames.is_empty() {
            return;
        }
        let self_id = self.self_id;
        let Some(peer) = self.peers.get_mut(&owner) else { return };
        let Some(link) = peer.link.as_mut() else { return };
        for frame in frames {
            let wire = encode_frame(link.sink.is_up(), self_id, &[dest], &frame);
            link.io.send_frame(&wire);
        }
        // Real traffic substitutes for keepalives.
        r.timer_set(link.sink.keepalive_timer, Duration::from_millis(PEER_KEEPALIVE_INTERVAL_MS));
    }

    fn rearm_decider_timer(&mut self, r: &mut Reactor<Ev>) {
        match self.decider.next_deadline() {
            Some(deadline) => r.timer_set_absolute(self.decider_timer, deadline),
            None => r.timer_unset(self.decider_timer),
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Full teardown and reactor exit. Safe to call repeatedly.
    pub fn terminate(&mut self, r: &mut Reactor<Ev>, code: i32) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        // Detach the queue from the link before any flow goes away, and
        // stop the stream from referencing peer buffers.
        self.queue.prepare_free();
        self.pending_events.clear();

        let ids = self.peer_ids();
        for id in ids {
            self.peer_remove(r, id, true);
        }

        r.timer_free(self.keepalive_timer);
        r.timer_free(self.decider_timer);
        r.job_free(self.events_job);
        r.limit_free(self.device_write_limit);
        r.source_unregister(self.server_source);
        r.source_unregister(self.device_source);
        r.quit(code);
    }
}
