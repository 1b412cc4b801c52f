//! Fair queue of per-peer flows feeding the server connection.
//!
//! Every peer owns one flow; the keepalive producer owns another. Flows are
//! scheduled round-robin with a single packet in flight at the link, so one
//! chatty peer cannot starve another's signalling. A flow torn down while
//! its packet is in flight is marked dying and freed from the write-done
//! callback; at most one flow is dying at a time.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Flow handle. Stable for the life of the flow, never reused within one
/// queue instance.
pub type FlowId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("flow buffer full")]
    Full,
    #[error("flow not connected")]
    NotConnected,
}

struct Flow {
    connected: bool,
    queue: VecDeque<Vec<u8>>,
    capacity: usize,
    scheduled: bool,
}

pub struct FairQueue {
    flows: HashMap<FlowId, Flow>,
    next_id: FlowId,
    /// Round-robin order of flows with queued packets.
    order: VecDeque<FlowId>,
    /// Flow whose packet is currently at the link.
    busy: Option<FlowId>,
    dying_flow: Option<FlowId>,
}

impl FairQueue {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            next_id: 0,
            order: VecDeque::new(),
            busy: None,
            dying_flow: None,
        }
    }

    pub fn flow_init(&mut self, capacity: usize) -> FlowId {
        let id = self.next_id;
        self.next_id += 1;
        self.flows.insert(
            id,
            Flow { connected: false, queue: VecDeque::new(), capacity, scheduled: false },
        );
        id
    }

    /// Attach a producer. Only connected flows accept packets.
    pub fn flow_connect(&mut self, id: FlowId) {
        if let Some(flow) = self.flows.get_mut(&id) {
            debug_assert!(!flow.connected);
            flow.connected = true;
        }
    }

    /// Detach the producer; queued packets stay scheduled.
    pub fn flow_disconnect(&mut self, id: FlowId) {
        if let Some(flow) = self.flows.get_mut(&id) {
            debug_assert!(flow.connected);
            flow.connected = false;
        }
    }

    /// The flow's packet is at the link right now.
    pub fn flow_is_busy(&self, id: FlowId) -> bool {
        self.busy == Some(id)
    }

    pub fn has_dying_flow(&self) -> bool {
        self.dying_flow.is_some()
    }

    pub fn dying_flow(&self) -> Option<FlowId> {
        self.dying_flow
    }

    /// Queue one packet on the flow.
    pub fn submit(&mut self, id: FlowId, packet: Vec<u8>) -> Result<(), QueueError> {
        let flow = self.flows.get_mut(&id).ok_or(QueueError::NotConnected)?;
        if !flow.connected {
            return Err(QueueError::NotConnected);
        }
        if flow.queue.len() >= flow.capacity {
            return Err(QueueError::Full);
        }
        flow.queue.push_back(packet);
        if !flow.scheduled {
            flow.scheduled = true;
            self.order.push_back(id);
        }
        Ok(())
    }

    /// Pick the next packet to transmit, if the link is idle and anything is
    /// queued. The caller hands the packet to the link and reports back with
    /// [`FairQueue::write_done`].
    pub fn start_next(&mut self) -> Option<(FlowId, Vec<u8>)> {
        if self.busy.is_some() {
            return None;
        }
        loop {
            let id = self.order.pop_front()?;
            let Some(flow) = self.flows.get_mut(&id) else { continue };
            let Some(packet) = flow.queue.pop_front() else {
                flow.scheduled = false;
                continue;
            };
            if flow.queue.is_empty() {
                flow.scheduled = false;
            } else {
                // Round robin: go to the back for the next packet.
                self.order.push_back(id);
            }
            self.busy = Some(id);
            trace!("flow {}: packet to link", id);
            return Some((id, packet));
        }
    }

    /// The link finished the in-flight packet. Frees the flow if it was
    /// dying; returns the freed flow for logging.
    pub fn write_done(&mut self) -> Option<FlowId> {
        let id = self.busy.take()?;
        if self.dying_flow == Some(id) {
            debug!("flow {}: drained, freeing dying flow", id);
            self.dying_flow = None;
            self.flows.remove(&id);
            return Some(id);
        }
        None
    }

    /// Override a flow's queue depth. Capacity zero makes every submit
    /// fail, which is how tests drive the out-of-buffer path.
    pub fn flow_set_capacity(&mut self, id: FlowId, capacity: usize) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.capacity = capacity;
        }
    }

    /// Drop everything queued on the flow. The in-flight packet, if any, is
    /// unaffected. Used when the flow's producer is swapped out.
    pub fn flow_clear(&mut self, id: FlowId) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.queue.clear();
        }
    }

    /// Free an idle flow, dropping anything still queued.
    pub fn flow_free(&mut self, id: FlowId) {
        debug_assert!(!self.flow_is_busy(id));
        if self.dying_flow == Some(id) {
            self.dying_flow = None;
        }
        self.flows.remove(&id);
    }

    /// Keep a busy flow alive until its in-flight packet drains, then free
    /// it from the write-done path.
    pub fn flow_die(&mut self, id: FlowId) {
        debug_assert!(self.flow_is_busy(id));
        debug_assert!(self.dying_flow.is_none());
        if let Some(previous) = self.dying_flow.take() {
            // Cannot happen through the node; recover by dropping the older
            // one outright rather than leaking it.
            warn!("flow {}: second dying flow, freeing the older {}", id, previous);
            self.flows.remove(&previous);
        }
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.connected = false;
            flow.queue.clear();
            self.dying_flow = Some(id);
        }
    }

    /// Shutdown path: forget link state so every flow can be freed
    /// unconditionally, in any order.
    pub fn prepare_free(&mut self) {
        self.busy = None;
        self.dying_flow = None;
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

impl Default for FairQueue {
    fn default() -> Self {
        Self::new()
    }
}
