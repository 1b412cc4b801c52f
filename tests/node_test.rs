//! End-to-end peer lifecycle tests.
//!
//! Every test runs whole nodes against the in-process hub and port space
//! from `tapmesh::sim`, on manual clocks. Structural invariants are checked
//! by the harness after every settled turn.

use std::time::Duration;

use tapmesh::config::{BindAddr, Config, ExtAddr, ExtAddrSpec};
use tapmesh::msg::{ExternalAddr, PeerMsg};
use tapmesh::proto::ControlPacket;
use tapmesh::sim::{OtpOp, SimWorld};
use tapmesh::transport::{CipherMode, HashMode, OtpConfig, SpParams, TransportMode};
use tapmesh::types::PeerFlags;

const KEEPALIVE: Duration = Duration::from_millis(10_000);
const RETRY: Duration = Duration::from_millis(5_000);

fn udp_config() -> Config {
    Config::for_test(TransportMode::Udp)
}

fn bind_spec(addr: &str, ports: u16, exts: &[(&str, &str)]) -> BindAddr {
    BindAddr {
        addr: addr.parse().unwrap(),
        num_ports: ports,
        ext_addrs: exts
            .iter()
            .map(|(ext, scope)| ExtAddr {
                spec: ExtAddrSpec::Fixed(ext.parse().unwrap()),
                scope: (*scope).to_string(),
            })
            .collect(),
    }
}

fn otp_params() -> SpParams {
    SpParams {
        encryption: CipherMode::Aes,
        hash: HashMode::Sha1,
        otp: Some(OtpConfig { mode: CipherMode::Aes, num: 1024, num_warn: 64 }),
    }
}

fn eth(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(payload);
    frame
}

fn broadcast(src: [u8; 6]) -> Vec<u8> {
    eth([0xff; 6], src, b"hello mesh")
}

fn youconnects_from(world: &SimWorld, idx: usize) -> Vec<PeerMsg> {
    world
        .hub
        .borrow()
        .peer_msgs_from(idx)
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            PeerMsg::YouConnect { .. } => Some(msg),
            _ => None,
        })
        .collect()
}

fn count_msgs(world: &SimWorld, idx: usize, kind: &str) -> usize {
    world
        .hub
        .borrow()
        .peer_msgs_from(idx)
        .iter()
        .filter(|(_, msg)| msg.kind_name() == kind)
        .count()
}

/// Two nodes, B (greater id) master with one bind address; returns after
/// both links are up.
fn paired_world(config_a: Config, config_b: Config) -> (SimWorld, usize, usize) {
    let mut world = SimWorld::new();
    let a = world.add_node(1, config_a);
    let b = world.add_node(2, config_b);
    world.connect(a);
    world.connect(b);
    world.announce_pair(a, b, 0, 0);
    world.advance(KEEPALIVE);
    (world, a, b)
}

fn master_bind_config(addr: &str) -> Config {
    let mut config = udp_config();
    config.bind_addrs = vec![bind_spec(addr, 1, &[(addr, "internet")])];
    config
}

#[test]
fn test_pair_up_udp_plaintext() {
    let (world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9001"));

    // The master advertised exactly its external address.
    let yc = youconnects_from(&world, b);
    assert_eq!(yc.len(), 1);
    assert_eq!(
        yc[0],
        PeerMsg::YouConnect {
            addrs: vec![ExternalAddr {
                scope: "internet".into(),
                addr: "127.0.0.1:9001".parse().unwrap(),
            }],
            key: None,
            password: None,
        }
    );

    let view_a = world.nodes[a].node.peer_view(2).unwrap();
    let view_b = world.nodes[b].node.peer_view(1).unwrap();
    assert!(view_a.have_link && view_a.link_up);
    assert!(view_b.have_link && view_b.link_up);

    // A frame entering A's tap comes out of B's tap.
    let mut world = world;
    let frame = broadcast([2, 0, 0, 0, 0, 0xaa]);
    world.nodes[a].send_tap_frame(frame.clone());
    world.run_until_quiet();
    assert_eq!(world.nodes[b].tap.borrow().as_slice(), &[frame.clone()]);

    // And B learned A's source MAC, so the reply goes unicast.
    let reply = eth([2, 0, 0, 0, 0, 0xaa], [2, 0, 0, 0, 0, 0xbb], b"re");
    world.nodes[b].send_tap_frame(reply.clone());
    world.run_until_quiet();
    assert_eq!(world.nodes[a].tap.borrow().as_slice(), &[reply]);
}

#[test]
fn test_master_bind_exhaustion_falls_back_to_relay() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    let b = world.add_node(2, master_bind_config("127.0.0.1:9100"));
    let mut config_c = udp_config();
    config_c.bind_addrs = vec![bind_spec("127.0.0.1:9200", 8, &[("127.0.0.1:9200", "internet")])];
    let c = world.add_node(3, config_c);
    for idx in [a, b, c] {
        world.connect(idx);
    }

    // The address B would bind is already taken.
    world.net.borrow_mut().occupy("127.0.0.1:9100".parse().unwrap());

    // C links up with both A and B and volunteers as a relay provider;
    // A is allowed to be relayed.
    world.announce_pair(a, c, PeerFlags::RELAY_CLIENT, PeerFlags::RELAY_SERVER);
    world.announce_pair(b, c, PeerFlags::RELAY_CLIENT, PeerFlags::RELAY_SERVER);
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(3).unwrap().is_relay);
    assert!(world.nodes[b].node.peer_view(3).unwrap().is_relay);

    // B cannot bind for A; both sides fall back to relaying through C.
    world.announce_pair(a, b, 0, 0);
    assert_eq!(count_msgs(&world, b, "cannotbind"), 1);

    let view_a = world.nodes[a].node.peer_view(2).unwrap();
    assert_eq!(view_a.relaying_via, Some(3));
    assert_eq!(view_a.flow_attached_to, Some(3));
    let view_b = world.nodes[b].node.peer_view(1).unwrap();
    assert_eq!(view_b.relaying_via, Some(3));
    assert!(world.nodes[c].node.peer_view(1).is_some());

    // A broadcast from A reaches B through C, and C itself.
    let frame = broadcast([2, 0, 0, 0, 0, 0x11]);
    world.nodes[a].send_tap_frame(frame.clone());
    world.run_until_quiet();
    assert!(world.nodes[c].tap.borrow().contains(&frame));
    assert!(world.nodes[b].tap.borrow().contains(&frame));
}

#[test]
fn test_slave_scope_mismatch_advances_bind_addr() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config()); // trusts only "internet"
    let mut config_b = udp_config();
    config_b.bind_addrs = vec![
        bind_spec("127.0.0.1:9300", 1, &[("10.0.0.2:9300", "lan")]),
        bind_spec("127.0.0.1:9301", 1, &[("127.0.0.1:9301", "internet")]),
    ];
    let b = world.add_node(2, config_b);
    world.connect(a);
    world.connect(b);
    world.announce_pair(a, b, 0, 0);

    // First offer is lan-only: the slave declines, the master advances.
    assert_eq!(count_msgs(&world, a, "cannotconnect"), 1);
    let yc = youconnects_from(&world, b);
    assert_eq!(yc.len(), 2);

    // No reset happened, and the second address linked up.
    assert_eq!(count_msgs(&world, a, "youretry"), 0);
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
}

#[test]
fn test_otp_seed_exchange_and_rotation() {
    let mut config_a = udp_config();
    config_a.sp_params = otp_params();
    let mut config_b = master_bind_config("127.0.0.1:9400");
    config_b.sp_params = otp_params();
    let (mut world, a, b) = paired_world(config_a, config_b);

    // The youconnect carried a session key of the cipher's size.
    match &youconnects_from(&world, b)[0] {
        PeerMsg::YouConnect { key: Some(key), .. } => assert_eq!(key.len(), 16),
        other => panic!("unexpected youconnect {:?}", other),
    }

    // Both directions negotiated seed 0 on link setup.
    {
        let net = world.net.borrow();
        for (me, peer) in [(b, 1), (a, 2)] {
            let them = if me == b { (a, 2) } else { (b, 1) };
            assert!(net.otp_log.contains(&((me, peer), OtpOp::SetSendSeed(0))));
            assert!(net.otp_log.contains(&(them, OtpOp::AddRecvSeed(0))));
            assert!(net.otp_log.contains(&((me, peer), OtpOp::ActivateSendSeed)));
        }
    }
    assert!(world.nodes[a].node.peer_view(2).unwrap().sendseed_sent.is_none());

    // The transport warns: a fresh seed is negotiated without frame loss.
    world.net.borrow_mut().inject((a, 2), tapmesh::transport::LinkEvent::SeedWarning);
    world.run_until_quiet();
    {
        let net = world.net.borrow();
        assert!(net.otp_log.contains(&((a, 2), OtpOp::SetSendSeed(1))));
        assert!(net.otp_log.contains(&((b, 1), OtpOp::AddRecvSeed(1))));
    }
    assert!(world.nodes[a].node.peer_view(2).unwrap().sendseed_sent.is_none());

    let frame = broadcast([2, 0, 0, 0, 0, 0x42]);
    world.nodes[a].send_tap_frame(frame.clone());
    world.run_until_quiet();
    assert!(world.nodes[b].tap.borrow().contains(&frame));
}

#[test]
fn test_confirmseed_mismatch_is_ignored() {
    let mut config_a = udp_config();
    config_a.sp_params = otp_params();
    let mut config_b = master_bind_config("127.0.0.1:9500");
    config_b.sp_params = otp_params();
    let (mut world, a, b) = paired_world(config_a, config_b);

    // Leave A's next seed unconfirmed by holding back B's provisioning.
    world.net.borrow_mut().suppress_seed_ready((b, 1));
    world.net.borrow_mut().inject((a, 2), tapmesh::transport::LinkEvent::SeedWarning);
    world.run_until_quiet();
    assert_eq!(world.nodes[a].node.peer_view(2).unwrap().sendseed_sent, Some(1));

    // A mismatched confirmation changes nothing.
    let activations_before = world
        .net
        .borrow()
        .otp_log
        .iter()
        .filter(|(key, op)| *key == (a, 2) && *op == OtpOp::ActivateSendSeed)
        .count();
    world.forge_peer_msg(a, 2, &PeerMsg::ConfirmSeed { seed_id: 99 });
    assert_eq!(world.nodes[a].node.peer_view(2).unwrap().sendseed_sent, Some(1));

    // The right id still works.
    world.forge_peer_msg(a, 2, &PeerMsg::ConfirmSeed { seed_id: 1 });
    assert_eq!(world.nodes[a].node.peer_view(2).unwrap().sendseed_sent, None);
    let activations_after = world
        .net
        .borrow()
        .otp_log
        .iter()
        .filter(|(key, op)| *key == (a, 2) && *op == OtpOp::ActivateSendSeed)
        .count();
    assert_eq!(activations_after, activations_before + 1);
}

#[test]
fn test_chat_buffer_overflow_sends_one_resetpeer() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    let b = world.add_node(2, udp_config()); // master with nothing to bind
    world.connect(a);
    world.connect(b);
    world.announce_pair(a, b, 0, 0);

    // Chat send space is gone; the next message A composes must fail.
    world.nodes[a].node.set_peer_flow_capacity(2, 0);
    world.forge_peer_msg(
        a,
        2,
        &PeerMsg::YouConnect {
            addrs: vec![ExternalAddr { scope: "lan".into(), addr: "10.0.0.9:9000".parse().unwrap() }],
            key: None,
            password: None,
        },
    );

    assert_eq!(world.hub.borrow().resetpeers, vec![(a, 2)]);
    let view = world.nodes[a].node.peer_view(2).unwrap();
    assert!(!view.have_chat);
    assert!(view.resetpeer_sent);

    // Further messages for that peer are dropped without another resetpeer.
    world.forge_peer_msg(a, 2, &PeerMsg::CannotBind);
    assert_eq!(world.hub.borrow().resetpeers.len(), 1);

    // The server recycles the peer cleanly.
    world.withdraw(a, b);
    assert!(world.nodes[a].node.peer_view(2).is_none());
    world.announce(a, b, 0);
    assert!(world.nodes[a].node.peer_view(2).unwrap().have_chat);
}

#[test]
fn test_dying_server_flow_lifecycle() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    let b = world.add_node(2, udp_config());
    world.connect(a);
    world.connect(b);
    world.announce_pair(a, b, 0, 0);

    // A's next signalling packet sticks at the link.
    world.hub.borrow_mut().set_stalled(a, true);
    world.forge_peer_msg(
        a,
        2,
        &PeerMsg::YouConnect {
            addrs: vec![ExternalAddr { scope: "lan".into(), addr: "10.0.0.9:9000".parse().unwrap() }],
            key: None,
            password: None,
        },
    );
    assert_eq!(count_msgs(&world, a, "cannotconnect"), 1);

    // Removing the peer now leaves its flow dying, but allocated.
    let flows_before = world.nodes[a].node.queue().flow_count();
    world.withdraw(a, b);
    assert!(world.nodes[a].node.queue().has_dying_flow());
    assert_eq!(world.nodes[a].node.queue().flow_count(), flows_before);

    // Another peer is not blocked by the dying flow.
    let c = world.add_node(3, udp_config());
    world.connect(c);
    world.announce(a, c, 0);
    assert!(world.nodes[a].node.peer_view(3).is_some());

    // The write completes; the flow is freed and the slot cleared.
    world.hub.borrow_mut().set_stalled(a, false);
    world.run_until_quiet();
    assert!(!world.nodes[a].node.queue().has_dying_flow());
    assert_eq!(world.nodes[a].node.queue().flow_count(), flows_before);
}

#[test]
fn test_max_peers_boundary() {
    let mut config = udp_config();
    config.max_peers = 2;
    let mut world = SimWorld::new();
    let a = world.add_node(1, config);
    world.connect(a);

    for id in [10u16, 11, 12] {
        world.deliver(a, ControlPacket::NewClient { id, flags: 0, cert: vec![] });
    }
    // The third announcement is ignored; the first two are untouched.
    assert_eq!(world.nodes[a].node.peer_ids(), vec![10, 11]);
    assert!(world.nodes[a].node.peer_view(12).is_none());
}

#[test]
fn test_duplicate_and_self_announcements_ignored() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    world.connect(a);
    world.deliver(a, ControlPacket::NewClient { id: 10, flags: 0, cert: vec![] });
    world.deliver(a, ControlPacket::NewClient { id: 10, flags: 2, cert: vec![] });
    world.deliver(a, ControlPacket::NewClient { id: 1, flags: 0, cert: vec![] });
    assert_eq!(world.nodes[a].node.peer_ids(), vec![10]);
    // The duplicate did not clobber the original flags.
    assert_eq!(world.nodes[a].node.peer_view(10).unwrap().flags, PeerFlags(0));
}

#[test]
fn test_mac_learning_bounded_per_peer() {
    let mut config_a = udp_config();
    config_a.max_macs = 2;
    let (mut world, a, b) = paired_world(config_a, master_bind_config("127.0.0.1:9600"));

    for i in 0..4u8 {
        world.nodes[b].send_tap_frame(broadcast([2, 0, 0, 0, 7, i]));
    }
    world.run_until_quiet();
    assert_eq!(world.nodes[a].node.decider().macs_of(2), 2);
}

#[test]
fn test_zero_port_bind_addr_is_skipped() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    let mut config_b = udp_config();
    config_b.bind_addrs = vec![
        bind_spec("127.0.0.1:9700", 0, &[("127.0.0.1:9700", "internet")]),
        bind_spec("127.0.0.1:9701", 1, &[("127.0.0.1:9701", "internet")]),
    ];
    let b = world.add_node(2, config_b);
    world.connect(a);
    world.connect(b);
    world.announce_pair(a, b, 0, 0);

    // No error, no cannotbind; the second address won.
    assert_eq!(count_msgs(&world, b, "cannotbind"), 0);
    let yc = youconnects_from(&world, b);
    assert_eq!(yc.len(), 1);
    match &yc[0] {
        PeerMsg::YouConnect { addrs, .. } => {
            assert_eq!(addrs[0].addr, "127.0.0.1:9701".parse().unwrap())
        }
        _ => unreachable!(),
    }
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
}

#[test]
fn test_master_transport_error_retries_after_timer() {
    let (mut world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9800"));

    world.net.borrow_mut().inject((b, 1), tapmesh::transport::LinkEvent::Error);
    world.run_until_quiet();
    let view = world.nodes[b].node.peer_view(1).unwrap();
    assert!(!view.have_link && !view.waiting_relay && view.relaying_via.is_none());

    // Resetting an already-clean peer again must be harmless.
    world.forge_peer_msg(b, 1, &PeerMsg::YouRetry);

    // The retry timer rebinds and the pair comes back up.
    world.advance(RETRY);
    assert_eq!(youconnects_from(&world, b).len(), 2);
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
    assert!(world.nodes[b].node.peer_view(1).unwrap().link_up);
}

#[test]
fn test_slave_transport_error_sends_youretry() {
    let (mut world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9900"));

    world.net.borrow_mut().inject((a, 2), tapmesh::transport::LinkEvent::Error);
    world.run_until_quiet();
    assert_eq!(count_msgs(&world, a, "youretry"), 1);

    // The master resets on youretry and retries after the timer.
    assert!(!world.nodes[b].node.peer_view(1).unwrap().have_link);
    world.advance(RETRY);
    assert_eq!(youconnects_from(&world, b).len(), 2);
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
}

#[test]
fn test_role_confusion_messages_are_ignored() {
    let (mut world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9910"));

    // YOURETRY at the slave, CANNOTBIND at the master: both warn and drop.
    world.forge_peer_msg(a, 2, &PeerMsg::YouRetry);
    world.forge_peer_msg(b, 1, &PeerMsg::CannotBind);

    assert!(world.nodes[a].node.peer_view(2).unwrap().have_link);
    assert!(world.nodes[b].node.peer_view(1).unwrap().have_link);
    assert!(!world.nodes[b].node.peer_view(1).unwrap().waiting_relay);
}

#[test]
fn test_malformed_message_dropped_without_reset() {
    let (mut world, a, _b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9920"));

    // Garbage payload straight to A's chat.
    world.deliver(a, ControlPacket::InMsg { from: 2, payload: vec![0xff, 0xff, 0x01] });
    let view = world.nodes[a].node.peer_view(2).unwrap();
    assert!(view.have_link && view.have_chat && !view.resetpeer_sent);
    assert_eq!(world.hub.borrow().resetpeers.len(), 0);
}

#[test]
fn test_receive_timeout_takes_link_down() {
    let (mut world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9930"));

    // The path vanishes: nothing is heard in either direction anymore.
    world.net.borrow_mut().cut((a, 2));
    world.advance(Duration::from_millis(22_000));

    let view_b = world.nodes[b].node.peer_view(1).unwrap();
    assert!(view_b.have_link && !view_b.link_up);
}

#[test]
fn test_endclient_recycles_link_cleanly() {
    let (mut world, a, b) = paired_world(udp_config(), master_bind_config("127.0.0.1:9940"));

    world.withdraw(a, b);
    world.withdraw(b, a);
    assert_eq!(world.nodes[a].node.num_peers(), 0);
    assert_eq!(world.nodes[b].node.num_peers(), 0);

    // Re-announcing rebuilds the pair from scratch, same id and port.
    world.announce_pair(a, b, 0, 0);
    world.advance(KEEPALIVE);
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
    assert!(world.nodes[b].node.peer_view(1).unwrap().link_up);
}

#[test]
fn test_relay_provider_loss_reassigns_users() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    let b = world.add_node(2, udp_config()); // master over A, nothing to bind
    let mut config_c = udp_config();
    config_c.bind_addrs = vec![bind_spec("127.0.0.1:9950", 8, &[("127.0.0.1:9950", "internet")])];
    let c = world.add_node(3, config_c);
    for idx in [a, b, c] {
        world.connect(idx);
    }
    world.announce_pair(a, c, PeerFlags::RELAY_CLIENT, PeerFlags::RELAY_SERVER);
    world.advance(KEEPALIVE);
    world.announce_pair(a, b, 0, 0);
    assert_eq!(world.nodes[a].node.peer_view(2).unwrap().relaying_via, Some(3));

    // C's link dies: its users return to the waiting list.
    world.net.borrow_mut().inject((a, 3), tapmesh::transport::LinkEvent::Error);
    world.run_until_quiet();
    let view = world.nodes[a].node.peer_view(2).unwrap();
    assert!(view.waiting_relay);
    assert_eq!(view.relaying_via, None);
}

#[test]
fn test_tcp_pair_up_with_password() {
    let mut config_b = Config::for_test(TransportMode::Tcp);
    config_b.bind_addrs = vec![bind_spec("127.0.0.1:9960", 1, &[("127.0.0.1:9960", "internet")])];
    let (world, a, b) = paired_world(Config::for_test(TransportMode::Tcp), config_b);

    // The youconnect carried a one-shot password instead of a key.
    match &youconnects_from(&world, b)[0] {
        PeerMsg::YouConnect { password: Some(_), key: None, .. } => {}
        other => panic!("unexpected youconnect {:?}", other),
    }
    assert!(world.nodes[a].node.peer_view(2).unwrap().link_up);
    assert!(world.nodes[b].node.peer_view(1).unwrap().link_up);

    let mut world = world;
    let frame = broadcast([2, 0, 0, 0, 0, 0x77]);
    world.nodes[a].send_tap_frame(frame.clone());
    world.run_until_quiet();
    assert!(world.nodes[b].tap.borrow().contains(&frame));
}

#[test]
fn test_device_error_is_fatal() {
    let mut world = SimWorld::new();
    let a = world.add_node(1, udp_config());
    world.connect(a);
    world.nodes[a].fail_device();
    world.run_until_quiet();
    assert!(world.nodes[a].reactor.exiting());
    assert_eq!(world.nodes[a].node.num_peers(), 0);
}
