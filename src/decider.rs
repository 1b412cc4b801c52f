//! L2 forwarding decision.
//!
//! The decider watches frames received from peers to learn which peer owns
//! which source MAC and which multicast groups each peer has joined (IGMP
//! snooping), then answers the question "which peers should receive this
//! local frame". All state is bounded per peer with LRU eviction and every
//! membership carries an expiry deadline.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, trace};

use crate::types::{MacAddr, PeerId};

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_IGMP: u8 = 2;

const IGMP_V1_REPORT: u8 = 0x12;
const IGMP_V2_REPORT: u8 = 0x16;
const IGMP_V2_LEAVE: u8 = 0x17;
const IGMP_V3_REPORT: u8 = 0x22;

const V3_MODE_IS_INCLUDE: u8 = 1;
const V3_MODE_IS_EXCLUDE: u8 = 2;
const V3_CHANGE_TO_INCLUDE: u8 = 3;
const V3_CHANGE_TO_EXCLUDE: u8 = 4;

/// Group tag: low 23 bits of the IPv4 group address, the part an Ethernet
/// multicast MAC preserves.
type GroupTag = u32;

/// Local-control groups (224.0.0.0/24) are always flooded, never snooped.
fn is_local_control(tag: GroupTag) -> bool {
    tag & 0x7fff00 == 0
}

#[derive(Debug, Clone, Copy)]
pub struct DeciderConfig {
    pub max_macs: usize,
    pub max_groups: usize,
    pub membership_interval: Duration,
    pub last_member_query_time: Duration,
}

struct PeerState {
    /// LRU order of owned MACs, most recent at the back.
    macs: VecDeque<MacAddr>,
    /// LRU order of joined groups, most recent at the back.
    groups: VecDeque<GroupTag>,
}

struct Membership {
    expires: Duration,
}

pub struct FrameDecider {
    config: DeciderConfig,
    peers: HashMap<PeerId, PeerState>,
    mac_owner: HashMap<MacAddr, PeerId>,
    members: HashMap<GroupTag, HashMap<PeerId, Membership>>,
}

/// Destination set for one frame. `next_destination` yields each target
/// once; peek-ahead lets the caller tell the flow whether more follow.
pub struct Decision {
    targets: Vec<PeerId>,
    pos: usize,
}

impl Decision {
    pub fn next_destination(&mut self) -> Option<(PeerId, bool)> {
        let target = *self.targets.get(self.pos)?;
        self.pos += 1;
        Some((target, self.pos < self.targets.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl FrameDecider {
    pub fn new(config: DeciderConfig) -> Self {
        Self {
            config,
            peers: HashMap::new(),
            mac_owner: HashMap::new(),
            members: HashMap::new(),
        }
    }

    /// Register a peer so flooding reaches it.
    pub fn peer_add(&mut self, id: PeerId) {
        self.peers.insert(id, PeerState { macs: VecDeque::new(), groups: VecDeque::new() });
    }

    /// Drop a peer and everything learned from it.
    pub fn peer_remove(&mut self, id: PeerId) {
        let Some(state) = self.peers.remove(&id) else { return };
        for mac in state.macs {
            if self.mac_owner.get(&mac) == Some(&id) {
                self.mac_owner.remove(&mac);
            }
        }
        for tag in state.groups {
            if let Some(members) = self.members.get_mut(&tag) {
                members.remove(&id);
                if members.is_empty() {
                    self.members.remove(&tag);
                }
            }
        }
    }

    pub fn macs_of(&self, id: PeerId) -> usize {
        self.peers.get(&id).map(|p| p.macs.len()).unwrap_or(0)
    }

    pub fn groups_of(&self, id: PeerId) -> usize {
        self.peers.get(&id).map(|p| p.groups.len()).unwrap_or(0)
    }

    pub fn owner_of(&self, mac: MacAddr) -> Option<PeerId> {
        self.mac_owner.get(&mac).copied()
    }

    /// Learn from a frame received from `peer`: bind its source MAC and snoop
    /// IGMP membership changes.
    pub fn analyze_from_peer(&mut self, peer: PeerId, frame: &[u8], now: Duration) {
        if frame.len() < ETH_HEADER_LEN || !self.peers.contains_key(&peer) {
            return;
        }
        let src = MacAddr(frame[6..12].try_into().unwrap());
        if !src.is_broadcast() && !src.is_multicast() && src != MacAddr([0; 6]) {
            self.learn_mac(peer, src);
        }
        self.snoop_igmp(peer, frame, now);
    }

    fn learn_mac(&mut self, peer: PeerId, mac: MacAddr) {
        // Steal from the previous owner if it moved.
        if let Some(prev) = self.mac_owner.insert(mac, peer) {
            if prev != peer {
                trace!("mac {} moved from peer {} to peer {}", mac, prev, peer);
                if let Some(state) = self.peers.get_mut(&prev) {
                    state.macs.retain(|m| *m != mac);
                }
            }
        }
        let max_macs = self.config.max_macs;
        let state = self.peers.get_mut(&peer).expect("caller checked peer");
        state.macs.retain(|m| *m != mac);
        state.macs.push_back(mac);
        if state.macs.len() > max_macs {
            let evicted = state.macs.pop_front().unwrap();
            trace!("peer {}: evicting mac {}", peer, evicted);
            if self.mac_owner.get(&evicted) == Some(&peer) {
                self.mac_owner.remove(&evicted);
            }
        }
    }

    fn snoop_igmp(&mut self, peer: PeerId, frame: &[u8], now: Duration) {
        let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        if ethertype != ETHERTYPE_IPV4 {
            return;
        }
        let ip = &frame[ETH_HEADER_LEN..];
        if ip.len() < 20 || ip[0] >> 4 != 4 {
            return;
        }
        let ihl = (ip[0] & 0x0f) as usize * 4;
        if ihl < 20 || ip.len() < ihl || ip[9] != IP_PROTO_IGMP {
            return;
        }
        let igmp = &ip[ihl..];
        if igmp.len() < 8 {
            return;
        }
        match igmp[0] {
            IGMP_V1_REPORT | IGMP_V2_REPORT => {
                let group = u32::from_be_bytes(igmp[4..8].try_into().unwrap());
                self.join(peer, group & 0x7fffff, now);
            }
            IGMP_V2_LEAVE => {
                let group = u32::from_be_bytes(igmp[4..8].try_into().unwrap());
                self.leave(peer, group & 0x7fffff, now);
            }
            IGMP_V3_REPORT => {
                let count = u16::from_be_bytes([igmp[6], igmp[7]]) as usize;
                let mut rest = &igmp[8..];
                for _ in 0..count {
                    if rest.len() < 8 {
                        debug!("peer {}: truncated igmpv3 report", peer);
                        return;
                    }
                    let rec_type = rest[0];
                    let aux_len = rest[1] as usize * 4;
                    let num_srcs = u16::from_be_bytes([rest[2], rest[3]]) as usize;
                    let group = u32::from_be_bytes(rest[4..8].try_into().unwrap());
                    let rec_len = 8 + num_srcs * 4 + aux_len;
                    if rest.len() < rec_len {
                        debug!("peer {}: truncated igmpv3 record", peer);
                        return;
                    }
                    let tag = group & 0x7fffff;
                    match rec_type {
                        V3_MODE_IS_EXCLUDE | V3_CHANGE_TO_EXCLUDE => self.join(peer, tag, now),
                        V3_MODE_IS_INCLUDE | V3_CHANGE_TO_INCLUDE if num_srcs == 0 => {
                            self.leave(peer, tag, now)
                        }
                        _ => {}
                    }
                    rest = &rest[rec_len..];
                }
            }
            _ => {}
        }
    }

    fn join(&mut self, peer: PeerId, tag: GroupTag, now: Duration) {
        if is_local_control(tag) {
            return;
        }
        let max_groups = self.config.max_groups;
        let Some(state) = self.peers.get_mut(&peer) else { return };
        state.groups.retain(|g| *g != tag);
        state.groups.push_back(tag);
        let mut evicted = None;
        if state.groups.len() > max_groups {
            evicted = state.groups.pop_front();
        }
        let expires = now + self.config.membership_interval;
        self.members.entry(tag).or_default().insert(peer, Membership { expires });
        trace!("peer {}: joined group {:#08x}", peer, tag);
        if let Some(old) = evicted {
            debug!("peer {}: group table full, evicting {:#08x}", peer, old);
            self.drop_membership(peer, old);
        }
    }

    fn leave(&mut self, peer: PeerId, tag: GroupTag, now: Duration) {
        let deadline = now + self.config.last_member_query_time;
        if let Some(members) = self.members.get_mut(&tag) {
            if let Some(entry) = members.get_mut(&peer) {
                // Shorten, never extend: a rejoin will push it out again.
                if entry.expires > deadline {
                    entry.expires = deadline;
                    trace!("peer {}: leaving group {:#08x}", peer, tag);
                }
            }
        }
    }

    fn drop_membership(&mut self, peer: PeerId, tag: GroupTag) {
        if let Some(members) = self.members.get_mut(&tag) {
            members.remove(&peer);
            if members.is_empty() {
                self.members.remove(&tag);
            }
        }
        if let Some(state) = self.peers.get_mut(&peer) {
            state.groups.retain(|g| *g != tag);
        }
    }

    /// Earliest membership expiry, for timer arming.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.members
            .values()
            .flat_map(|m| m.values())
            .map(|e| e.expires)
            .min()
    }

    /// Drop memberships whose deadline has passed.
    pub fn expire(&mut self, now: Duration) {
        let mut dead = Vec::new();
        for (tag, members) in self.members.iter() {
            for (peer, entry) in members.iter() {
                if entry.expires <= now {
                    dead.push((*peer, *tag));
                }
            }
        }
        for (peer, tag) in dead {
            debug!("peer {}: group {:#08x} membership expired", peer, tag);
            self.drop_membership(peer, tag);
        }
    }

    /// Decide the destination set for a local outgoing frame.
    pub fn decide(&mut self, frame: &[u8]) -> Decision {
        if frame.len() < ETH_HEADER_LEN {
            return Decision { targets: Vec::new(), pos: 0 };
        }
        let dst = MacAddr(frame[0..6].try_into().unwrap());

        let targets: Vec<PeerId> = if dst.is_broadcast() {
            self.all_peers()
        } else if dst.is_ipv4_multicast() {
            let tag = dst.ipv4_group_tag();
            if is_local_control(tag) {
                self.all_peers()
            } else {
                let mut members: Vec<PeerId> = self
                    .members
                    .get(&tag)
                    .map(|m| m.keys().copied().collect())
                    .unwrap_or_default();
                members.sort_unstable();
                members
            }
        } else if dst.is_multicast() {
            // Non-IPv4 multicast (IPv6 etc.) floods.
            self.all_peers()
        } else {
            match self.mac_owner.get(&dst) {
                Some(owner) => vec![*owner],
                // Unknown unicast floods, standard L2 behaviour.
                None => self.all_peers(),
            }
        };

        Decision { targets, pos: 0 }
    }

    fn all_peers(&self) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self.peers.keys().copied().collect();
        all.sort_unstable();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeciderConfig {
        DeciderConfig {
            max_macs: 2,
            max_groups: 2,
            membership_interval: Duration::from_secs(260),
            last_member_query_time: Duration::from_secs(2),
        }
    }

    fn eth_frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&[0x08, 0x06]); // ARP, irrelevant payload
        frame.extend_from_slice(&[0; 28]);
        frame
    }

    fn igmp_frame(src: [u8; 6], igmp_type: u8, group: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x01, 0x00, 0x5e, 0, 0, 1]);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&[0x08, 0x00]);
        // Minimal IPv4 header, ihl=5, proto=IGMP.
        let mut ip = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 1, IP_PROTO_IGMP, 0, 0];
        ip.extend_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&[224, 0, 0, 1]);
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&[igmp_type, 0, 0, 0]);
        frame.extend_from_slice(&group);
        frame
    }

    fn targets(mut decision: Decision) -> Vec<PeerId> {
        let mut out = Vec::new();
        while let Some((peer, _)) = decision.next_destination() {
            out.push(peer);
        }
        out
    }

    #[test]
    fn test_unicast_learning_and_flood() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        d.peer_add(2);

        let mac_a = [2, 0, 0, 0, 0, 0xaa];
        // Unknown unicast floods.
        assert_eq!(targets(d.decide(&eth_frame(mac_a, [2, 0, 0, 0, 0, 1]))), vec![1, 2]);

        // Learn A behind peer 1, then unicast goes only there.
        d.analyze_from_peer(1, &eth_frame([0xff; 6], mac_a), Duration::ZERO);
        assert_eq!(targets(d.decide(&eth_frame(mac_a, [2, 0, 0, 0, 0, 1]))), vec![1]);

        // A moves behind peer 2.
        d.analyze_from_peer(2, &eth_frame([0xff; 6], mac_a), Duration::ZERO);
        assert_eq!(targets(d.decide(&eth_frame(mac_a, [2, 0, 0, 0, 0, 1]))), vec![2]);
        assert_eq!(d.macs_of(1), 0);
    }

    #[test]
    fn test_mac_lru_eviction() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        for i in 0..3u8 {
            d.analyze_from_peer(1, &eth_frame([0xff; 6], [2, 0, 0, 0, 0, i]), Duration::ZERO);
        }
        // max_macs = 2: the first MAC was evicted.
        assert_eq!(d.macs_of(1), 2);
        assert_eq!(d.owner_of(MacAddr([2, 0, 0, 0, 0, 0])), None);
        assert_eq!(d.owner_of(MacAddr([2, 0, 0, 0, 0, 2])), Some(1));
    }

    #[test]
    fn test_broadcast_floods_all() {
        let mut d = FrameDecider::new(config());
        d.peer_add(3);
        d.peer_add(1);
        let frame = eth_frame([0xff; 6], [2, 0, 0, 0, 0, 1]);
        assert_eq!(targets(d.decide(&frame)), vec![1, 3]);
    }

    #[test]
    fn test_igmp_join_leave_expiry() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        d.peer_add(2);

        let group = [239, 1, 2, 3];
        let group_mac = [0x01, 0x00, 0x5e, 1, 2, 3];
        let t0 = Duration::ZERO;

        // No members yet: routed multicast goes nowhere.
        assert!(targets(d.decide(&eth_frame(group_mac, [2, 0, 0, 0, 0, 9]))).is_empty());

        d.analyze_from_peer(1, &igmp_frame([2, 0, 0, 0, 0, 1], IGMP_V2_REPORT, group), t0);
        assert_eq!(targets(d.decide(&eth_frame(group_mac, [2, 0, 0, 0, 0, 9]))), vec![1]);

        // Leave shortens the deadline to the last-member-query window.
        d.analyze_from_peer(1, &igmp_frame([2, 0, 0, 0, 0, 1], IGMP_V2_LEAVE, group), t0);
        assert_eq!(d.next_deadline(), Some(t0 + config().last_member_query_time));
        d.expire(t0 + Duration::from_secs(3));
        assert!(targets(d.decide(&eth_frame(group_mac, [2, 0, 0, 0, 0, 9]))).is_empty());
        assert_eq!(d.groups_of(1), 0);
    }

    #[test]
    fn test_membership_expires_without_refresh() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        let group = [239, 1, 2, 3];
        d.analyze_from_peer(1, &igmp_frame([2, 0, 0, 0, 0, 1], IGMP_V1_REPORT, group), Duration::ZERO);
        d.expire(Duration::from_secs(259));
        assert_eq!(d.groups_of(1), 1);
        d.expire(Duration::from_secs(261));
        assert_eq!(d.groups_of(1), 0);
    }

    #[test]
    fn test_local_control_groups_flood() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        d.peer_add(2);
        // 224.0.0.1 (all hosts) floods even without members.
        let frame = eth_frame([0x01, 0x00, 0x5e, 0, 0, 1], [2, 0, 0, 0, 0, 9]);
        assert_eq!(targets(d.decide(&frame)), vec![1, 2]);
    }

    #[test]
    fn test_more_follow_flag() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        d.peer_add(2);
        let mut decision = d.decide(&eth_frame([0xff; 6], [2, 0, 0, 0, 0, 1]));
        assert_eq!(decision.next_destination(), Some((1, true)));
        assert_eq!(decision.next_destination(), Some((2, false)));
        assert_eq!(decision.next_destination(), None);
    }

    #[test]
    fn test_peer_remove_clears_state() {
        let mut d = FrameDecider::new(config());
        d.peer_add(1);
        let mac = [2, 0, 0, 0, 0, 0xaa];
        d.analyze_from_peer(1, &eth_frame([0xff; 6], mac), Duration::ZERO);
        d.analyze_from_peer(
            1,
            &igmp_frame([2, 0, 0, 0, 0, 1], IGMP_V2_REPORT, [239, 0, 0, 5]),
            Duration::ZERO,
        );
        d.peer_remove(1);
        assert_eq!(d.owner_of(MacAddr(mac)), None);
        assert_eq!(d.next_deadline(), None);
    }
}
