//! Data-plane lanes and the frame header that rides every peer link.
//!
//! Each frame on a link carries a small header: a receiving flag (the
//! sender currently hears us), the sender's id, and the list of destination
//! ids the frame is meant for. A header with no destinations and no payload
//! is a keepalive. Outgoing local frames travel through a per-destination
//! [`DataFlow`] attached to the [`DataSink`] of either the owning peer or a
//! relay provider; the sink tracks link liveness with a keepalive timer and
//! a receive-inactivity timer.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use tracing::trace;

use crate::proto::WireError;
use crate::reactor::TimerId;
use crate::types::PeerId;

/// Sender currently receives traffic from us on this link.
pub const DP_FLAG_RECEIVING: u8 = 1 << 0;

/// Destinations carried in one frame header.
pub const DP_MAX_DESTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub receiving: bool,
    pub from: PeerId,
    pub dests: Vec<PeerId>,
}

pub fn encode_frame(receiving: bool, from: PeerId, dests: &[PeerId], payload: &[u8]) -> Vec<u8> {
    debug_assert!(dests.len() <= DP_MAX_DESTS);
    let mut buf = Vec::with_capacity(5 + dests.len() * 2 + payload.len());
    buf.put_u8(if receiving { DP_FLAG_RECEIVING } else { 0 });
    buf.put_u16_le(from);
    buf.put_u16_le(dests.len() as u16);
    for dest in dests {
        buf.put_u16_le(*dest);
    }
    buf.put_slice(payload);
    buf
}

pub fn encode_keepalive(receiving: bool, from: PeerId) -> Vec<u8> {
    encode_frame(receiving, from, &[], &[])
}

pub fn decode_frame(mut buf: &[u8]) -> Result<(DataHeader, &[u8]), WireError> {
    if buf.remaining() < 5 {
        return Err(WireError::Truncated);
    }
    let flags = buf.get_u8();
    let from = buf.get_u16_le();
    let count = buf.get_u16_le() as usize;
    if count > DP_MAX_DESTS {
        return Err(WireError::Oversize(count));
    }
    if buf.remaining() < count * 2 {
        return Err(WireError::Truncated);
    }
    let mut dests = Vec::with_capacity(count);
    for _ in 0..count {
        dests.push(buf.get_u16_le());
    }
    Ok((DataHeader { receiving: flags & DP_FLAG_RECEIVING != 0, from, dests }, buf))
}

/// Outgoing lane for local frames addressed to one destination peer. The
/// flow buffers while attached to a sink and silently drops otherwise; the
/// node drains the buffer into the sink owner's link.
pub struct DataFlow {
    dest: PeerId,
    capacity: usize,
    attached_to: Option<PeerId>,
    queue: VecDeque<Vec<u8>>,
    dropped: u64,
}

impl DataFlow {
    pub fn new(dest: PeerId, capacity: usize) -> Self {
        Self { dest, capacity, attached_to: None, queue: VecDeque::new(), dropped: 0 }
    }

    pub fn dest(&self) -> PeerId {
        self.dest
    }

    /// Sink owner this flow currently feeds: the destination itself for a
    /// direct link, or a relay provider.
    pub fn attached_to(&self) -> Option<PeerId> {
        self.attached_to
    }

    pub fn attach(&mut self, sink_owner: PeerId, capacity: usize) {
        debug_assert!(self.attached_to.is_none());
        self.attached_to = Some(sink_owner);
        self.capacity = capacity;
    }

    /// Detach from the sink. Queued frames are dropped without error.
    pub fn detach(&mut self) {
        debug_assert!(self.attached_to.is_some());
        self.attached_to = None;
        self.queue.clear();
    }

    /// Queue one frame. `more_follow` tells the flow whether the caller will
    /// route the same frame elsewhere too; either way this lane keeps its
    /// own copy. Unattached flows drop silently.
    pub fn route(&mut self, frame: &[u8], _more_follow: bool) {
        if self.attached_to.is_none() {
            return;
        }
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            trace!("flow to peer {}: buffer full, dropping", self.dest);
            return;
        }
        self.queue.push_back(frame.to_vec());
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Per-link send side. Owns the keepalive and receive-inactivity timers
/// (armed by the node) and the up/down edge derived from them.
pub struct DataSink {
    pub keepalive_timer: TimerId,
    pub receive_timer: TimerId,
    up: bool,
}

impl DataSink {
    pub fn new(keepalive_timer: TimerId, receive_timer: TimerId) -> Self {
        Self { keepalive_timer, receive_timer, up: false }
    }

    /// The peer is heard on this link; true on the down→up edge.
    pub fn on_received(&mut self) -> bool {
        let edge = !self.up;
        self.up = true;
        edge
    }

    /// Receive-inactivity timer fired; true on the up→down edge.
    pub fn on_receive_timeout(&mut self) -> bool {
        let edge = self.up;
        self.up = false;
        edge
    }

    pub fn is_up(&self) -> bool {
        self.up
    }
}
