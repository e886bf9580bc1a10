//! Per-request queue network.
//!
//! Each pipeline stage owns one queue per direction. Queues are stored
//! in a flat vector and addressed by stable `QueueId` indices (instead
//! of the intrusive pointer rings the design derives from), which keeps
//! O(1) linking while the connection retains exclusive ownership.
//!
//! The service ring schedules queues that have work pending. A queue is
//! in the ring at most once: the `scheduled` flag acts as the membership
//! sentinel and is cleared when the queue is popped for servicing, so a
//! stage that re-schedules itself mid-service gets a fresh turn instead
//! of recursing.

use crate::pipeline::packet::Packet;
use crate::pipeline::stage::Stage;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

pub type QueueId = usize;

/// Data flow direction of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Response data, toward the connector.
    Send,
    /// Request body data, toward the handler.
    Receive,
}

/// One stage's buffer for one direction of one connection.
pub struct Queue {
    pub stage: Arc<dyn Stage>,
    pub dir: Direction,
    packets: VecDeque<Packet>,
    /// Bytes currently queued (sum of packet counts).
    pub count: usize,
    /// Capacity in bytes.
    pub max: usize,
    /// Preferred fragment size for splits.
    pub packet_size: usize,
    /// Low-water mark: dropping below re-enables a blocked upstream.
    pub low: usize,
    /// Downstream neighbor in flow direction.
    pub next: Option<QueueId>,
    /// Upstream neighbor.
    pub prev: Option<QueueId>,
    /// Same stage's queue in the opposite direction.
    pub pair: Option<QueueId>,
    /// `open` has run for this queue (or its pair covered it).
    pub opened: bool,
    /// This queue's `open` call actually ran (close mirrors it).
    pub owns_open: bool,
    /// Blocked by downstream back-pressure; not schedulable.
    pub disabled: bool,
    /// Marked by an upstream that could not forward into this queue.
    pub full: bool,
    /// Present in the service ring.
    pub scheduled: bool,
    /// Per-request stage state.
    pub stage_state: Option<Box<dyn Any + Send>>,
}

impl Queue {
    fn new(stage: Arc<dyn Stage>, dir: Direction, max: usize, packet_size: usize) -> Queue {
        Queue {
            stage,
            dir,
            packets: VecDeque::new(),
            count: 0,
            max,
            packet_size,
            low: packet_size,
            next: None,
            prev: None,
            pair: None,
            opened: false,
            owns_open: false,
            disabled: false,
            full: false,
            scheduled: false,
            stage_state: None,
        }
    }

    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn first_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Room left before hitting capacity.
    pub fn room(&self) -> usize {
        self.max.saturating_sub(self.count)
    }

    #[cfg(test)]
    pub fn check_count(&self) -> bool {
        self.count == self.packets.iter().map(|p| p.count).sum::<usize>()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("stage", &self.stage.name())
            .field("dir", &self.dir)
            .field("count", &self.count)
            .field("packets", &self.packets.len())
            .field("disabled", &self.disabled)
            .field("full", &self.full)
            .field("scheduled", &self.scheduled)
            .finish()
    }
}

/// The queue network for one request: both direction chains plus the
/// service ring.
#[derive(Debug, Default)]
pub struct QueueNet {
    queues: Vec<Queue>,
    ring: VecDeque<QueueId>,
    /// Handler's send-side queue (head of the send chain).
    pub send_head: QueueId,
    /// Connector's send-side queue (tail of the send chain).
    pub connector: QueueId,
    /// First queue of the receive chain, if the request has a body.
    pub recv_head: Option<QueueId>,
    /// Handler's receive-side queue (tail of the receive chain).
    pub recv_handler: Option<QueueId>,
}

impl QueueNet {
    pub fn new() -> QueueNet {
        QueueNet::default()
    }

    /// Add an unlinked queue, returning its id.
    pub fn add(
        &mut self,
        stage: Arc<dyn Stage>,
        dir: Direction,
        max: usize,
        packet_size: usize,
    ) -> QueueId {
        let id = self.queues.len();
        self.queues.push(Queue::new(stage, dir, max, packet_size));
        id
    }

    /// Link `ids` into a chain in flow order.
    pub fn link(&mut self, ids: &[QueueId]) {
        for pair in ids.windows(2) {
            self.queues[pair[0]].next = Some(pair[1]);
            self.queues[pair[1]].prev = Some(pair[0]);
        }
    }

    pub fn queue(&self, id: QueueId) -> &Queue {
        &self.queues[id]
    }

    pub fn queue_mut(&mut self, id: QueueId) -> &mut Queue {
        &mut self.queues[id]
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = QueueId> {
        0..self.queues.len()
    }

    /// Append a packet at the tail, updating byte accounting.
    pub fn put(&mut self, id: QueueId, packet: Packet) {
        let q = &mut self.queues[id];
        q.count += packet.count;
        q.packets.push_back(packet);
    }

    /// Put a packet back at the head (split tails, deferred packets).
    pub fn put_front(&mut self, id: QueueId, packet: Packet) {
        let q = &mut self.queues[id];
        q.count += packet.count;
        q.packets.push_front(packet);
    }

    /// Pop from the head. Raw removal only; back-pressure release is
    /// the caller's concern (see `Cx::get`).
    pub fn pop(&mut self, id: QueueId) -> Option<Packet> {
        let q = &mut self.queues[id];
        let packet = q.packets.pop_front()?;
        debug_assert!(q.count >= packet.count);
        q.count -= packet.count;
        Some(packet)
    }

    /// Insert into the service ring unless disabled or already present.
    pub fn schedule(&mut self, id: QueueId) {
        let q = &mut self.queues[id];
        if q.scheduled || q.disabled {
            return;
        }
        q.scheduled = true;
        self.ring.push_back(id);
    }

    /// Pop the next queue due for servicing. The queue leaves the ring
    /// before its service routine runs.
    pub fn next_for_service(&mut self) -> Option<QueueId> {
        let id = self.ring.pop_front()?;
        self.queues[id].scheduled = false;
        Some(id)
    }

    pub fn has_scheduled(&self) -> bool {
        !self.ring.is_empty()
    }

    /// Clear back-pressure on a queue: clear `disabled` and schedule it.
    pub fn enable(&mut self, id: QueueId) {
        self.queues[id].disabled = false;
        self.schedule(id);
    }

    /// Drop body data packets, keeping header and end-marker packets
    /// (suppressed-body responses).
    pub fn drop_data(&mut self, id: QueueId) {
        let q = &mut self.queues[id];
        q.packets.retain(|p| p.is_header() || p.is_end());
        q.count = q.packets.iter().map(|p| p.count).sum();
    }

    /// Drop all queued packets in every queue (connection failure path).
    pub fn discard_all(&mut self) {
        for q in &mut self.queues {
            q.packets.clear();
            q.count = 0;
        }
        for id in std::mem::take(&mut self.ring) {
            self.queues[id].scheduled = false;
        }
    }

    /// Total bytes pending across the send chain from `id` downstream.
    pub fn pending_from(&self, mut id: QueueId) -> usize {
        let mut total = 0;
        loop {
            total += self.queues[id].count;
            match self.queues[id].next {
                Some(next) => id = next,
                None => return total,
            }
        }
    }

    #[cfg(test)]
    pub fn ring_contains(&self, id: QueueId) -> usize {
        self.ring.iter().filter(|&&q| q == id).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{Stage, StageKind};

    struct NullStage;

    impl Stage for NullStage {
        fn name(&self) -> &'static str {
            "null"
        }
        fn kind(&self) -> StageKind {
            StageKind::Filter
        }
    }

    fn net_with_queue() -> (QueueNet, QueueId) {
        let mut net = QueueNet::new();
        let id = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        (net, id)
    }

    #[test]
    fn test_count_accounting() {
        let (mut net, id) = net_with_queue();
        net.put(id, Packet::from_slice(b"hello"));
        net.put(id, Packet::from_slice(b"world!"));
        assert_eq!(net.queue(id).count, 11);
        assert!(net.queue(id).check_count());

        let p = net.pop(id).unwrap();
        assert_eq!(p.count, 5);
        assert_eq!(net.queue(id).count, 6);
        assert!(net.queue(id).check_count());

        net.put_front(id, p);
        assert_eq!(net.queue(id).count, 11);
        assert!(net.queue(id).check_count());
    }

    #[test]
    fn test_service_ring_at_most_once() {
        let (mut net, id) = net_with_queue();
        net.schedule(id);
        net.schedule(id);
        net.schedule(id);
        assert_eq!(net.ring_contains(id), 1);

        let popped = net.next_for_service().unwrap();
        assert_eq!(popped, id);
        assert!(!net.queue(id).scheduled);
        assert!(net.next_for_service().is_none());

        // Re-scheduling after pop gets a fresh turn
        net.schedule(id);
        assert_eq!(net.ring_contains(id), 1);
    }

    #[test]
    fn test_disabled_queue_not_scheduled() {
        let (mut net, id) = net_with_queue();
        net.queue_mut(id).disabled = true;
        net.schedule(id);
        assert!(net.next_for_service().is_none());

        net.enable(id);
        assert_eq!(net.next_for_service(), Some(id));
    }

    #[test]
    fn test_link_chain() {
        let mut net = QueueNet::new();
        let a = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        let b = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        let c = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        net.link(&[a, b, c]);

        assert_eq!(net.queue(a).next, Some(b));
        assert_eq!(net.queue(b).next, Some(c));
        assert_eq!(net.queue(c).next, None);
        assert_eq!(net.queue(c).prev, Some(b));
        assert_eq!(net.queue(a).prev, None);
    }

    #[test]
    fn test_discard_all() {
        let (mut net, id) = net_with_queue();
        net.put(id, Packet::from_slice(b"data"));
        net.schedule(id);
        net.discard_all();
        assert_eq!(net.queue(id).count, 0);
        assert!(net.queue(id).is_empty());
        assert!(net.next_for_service().is_none());
        assert!(!net.queue(id).scheduled);
    }

    #[test]
    fn test_pending_from() {
        let mut net = QueueNet::new();
        let a = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        let b = net.add(Arc::new(NullStage), Direction::Send, 64, 16);
        net.link(&[a, b]);
        net.put(a, Packet::from_slice(b"abc"));
        net.put(b, Packet::from_slice(b"de"));
        assert_eq!(net.pending_from(a), 5);
        assert_eq!(net.pending_from(b), 2);
    }
}
