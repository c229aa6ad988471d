//! Per-peer lossless delivery: send/recv queues, acknowledgements and
//! retransmission.
//!
//! Every lossless packet carries a 64-bit message id, assigned sequentially
//! from 1 when the handshake completes. The receiver delivers ids strictly
//! in order and exactly once, buffering a bounded window of out-of-order
//! arrivals. The sender keeps every unacknowledged packet and retries it
//! with doubling backoff until the peer acknowledges it or dies; entries
//! never expire on their own.

use super::packet::GroupPacketType;
use super::types::{
    ACK_REQUEST_INTERVAL_MS, RECV_BUFFER_MAX, RETRANSMIT_CEIL_MS, RETRANSMIT_FLOOR_MS,
    SEND_QUEUE_MAX,
};
use std::collections::BTreeMap;

/// An unacknowledged outbound packet, kept as framed wire bytes so a
/// retransmission is byte-identical to the original send.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub message_id: u64,
    pub packet_type: GroupPacketType,
    pub wire: Vec<u8>,
    pub first_sent_ms: u64,
    pub last_sent_ms: u64,
    /// Number of retransmissions so far; drives the backoff exponent.
    pub attempts: u32,
}

/// Backoff before the next retransmission, doubling from the floor to the
/// ceiling. The id never changes across retries, which is what preserves
/// ordering and exactly-once delivery on the receiver.
fn retransmit_backoff_ms(attempts: u32) -> u64 {
    RETRANSMIT_FLOOR_MS
        .saturating_mul(1u64 << attempts.min(8))
        .min(RETRANSMIT_CEIL_MS)
}

/// Ordered outbound queue with a fixed maximum depth.
#[derive(Debug, Default)]
pub struct SendQueue {
    next_id: u64,
    pending: BTreeMap<u64, PendingPacket>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self { next_id: 1, pending: BTreeMap::new() }
    }

    /// The id the next enqueued packet will carry.
    pub fn next_message_id(&self) -> u64 {
        self.next_id
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= SEND_QUEUE_MAX
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Enqueues an already-framed packet under the next id. The caller must
    /// have framed the packet with `next_message_id()`. Returns the assigned
    /// id, or `None` when the queue is full (backpressure).
    pub fn push(&mut self, packet_type: GroupPacketType, wire: Vec<u8>, now_ms: u64) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingPacket {
                message_id: id,
                packet_type,
                wire,
                first_sent_ms: now_ms,
                last_sent_ms: now_ms,
                attempts: 0,
            },
        );
        Some(id)
    }

    /// Handles a `recv` acknowledgement: drops the matching entry.
    pub fn ack(&mut self, message_id: u64) -> bool {
        self.pending.remove(&message_id).is_some()
    }

    /// Handles a `request` acknowledgement: returns the wire bytes for an
    /// immediate retransmission and restarts that entry's backoff clock.
    pub fn force_retransmit(&mut self, message_id: u64, now_ms: u64) -> Option<Vec<u8>> {
        let entry = self.pending.get_mut(&message_id)?;
        entry.last_sent_ms = now_ms;
        entry.attempts = entry.attempts.saturating_add(1);
        Some(entry.wire.clone())
    }

    /// Collects every entry whose backoff has elapsed, advancing its clock.
    /// Called from the periodic tick.
    pub fn due_retransmits(&mut self, now_ms: u64) -> Vec<Vec<u8>> {
        let mut due = Vec::new();
        for entry in self.pending.values_mut() {
            if now_ms.saturating_sub(entry.last_sent_ms) >= retransmit_backoff_ms(entry.attempts) {
                entry.last_sent_ms = now_ms;
                entry.attempts = entry.attempts.saturating_add(1);
                due.push(entry.wire.clone());
            }
        }
        due
    }
}

/// Result of feeding one inbound lossless packet to the receive queue.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The packet (and possibly buffered successors) are deliverable, in
    /// order. Each delivered id must be acknowledged with `recv`.
    Deliver(Vec<(u64, GroupPacketType, Vec<u8>)>),
    /// Ahead of the expected id; buffered until the gap fills.
    Buffered,
    /// Already delivered or already buffered; acknowledge with `recv` only.
    Duplicate,
    /// Beyond the receive window or the buffer is full; dropped. The sender
    /// will retry after a re-send request or its own backoff.
    Dropped,
}

/// Ordered inbound queue. Accepts exactly `expected_id` for delivery and
/// buffers a bounded window above it.
#[derive(Debug)]
pub struct RecvQueue {
    expected_id: u64,
    buffered: BTreeMap<u64, (GroupPacketType, Vec<u8>)>,
    last_request_ms: u64,
}

impl Default for RecvQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvQueue {
    pub fn new() -> Self {
        Self { expected_id: 1, buffered: BTreeMap::new(), last_request_ms: 0 }
    }

    pub fn expected_id(&self) -> u64 {
        self.expected_id
    }

    pub fn receive(&mut self, message_id: u64, packet_type: GroupPacketType, body: Vec<u8>) -> RecvOutcome {
        if message_id < self.expected_id {
            return RecvOutcome::Duplicate;
        }

        if message_id == self.expected_id {
            let mut run = vec![(message_id, packet_type, body)];
            self.expected_id += 1;
            // Flush the contiguous run of buffered successors.
            while let Some(entry) = self.buffered.remove(&self.expected_id) {
                run.push((self.expected_id, entry.0, entry.1));
                self.expected_id += 1;
            }
            return RecvOutcome::Deliver(run);
        }

        // Out of order: bounded buffering only.
        if message_id >= self.expected_id + RECV_BUFFER_MAX as u64 || self.buffered.len() >= RECV_BUFFER_MAX {
            return RecvOutcome::Dropped;
        }
        if self.buffered.contains_key(&message_id) {
            return RecvOutcome::Duplicate;
        }
        self.buffered.insert(message_id, (packet_type, body));
        RecvOutcome::Buffered
    }

    /// Ids missing below the highest buffered id, oldest first.
    pub fn missing_ids(&self, limit: usize) -> Vec<u64> {
        let Some(&highest) = self.buffered.keys().next_back() else {
            return Vec::new();
        };
        let mut missing = Vec::new();
        for id in self.expected_id..highest {
            if !self.buffered.contains_key(&id) {
                missing.push(id);
                if missing.len() >= limit {
                    break;
                }
            }
        }
        missing
    }

    /// Re-send requests are throttled to one burst per second per peer.
    pub fn may_send_request(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_request_ms) >= ACK_REQUEST_INTERVAL_MS
    }

    pub fn note_request_sent(&mut self, now_ms: u64) {
        self.last_request_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(n: u64) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn test_send_queue_assigns_sequential_ids() {
        let mut queue = SendQueue::new();
        assert_eq!(queue.next_message_id(), 1);
        assert_eq!(queue.push(GroupPacketType::Broadcast, vec![1], 0), Some(1));
        assert_eq!(queue.push(GroupPacketType::Broadcast, vec![2], 0), Some(2));
        assert_eq!(queue.next_message_id(), 3);
    }

    #[test]
    fn test_send_queue_backpressure() {
        let mut queue = SendQueue::new();
        for _ in 0..SEND_QUEUE_MAX {
            assert!(queue.push(GroupPacketType::Broadcast, vec![0], 0).is_some());
        }
        assert!(queue.is_full());
        assert_eq!(queue.push(GroupPacketType::Broadcast, vec![0], 0), None);

        // Acking frees a slot, and ids keep increasing.
        assert!(queue.ack(1));
        let id = queue.push(GroupPacketType::Broadcast, vec![0], 0).unwrap();
        assert_eq!(id as usize, SEND_QUEUE_MAX + 1);
    }

    #[test]
    fn test_ack_removes_only_matching() {
        let mut queue = SendQueue::new();
        queue.push(GroupPacketType::Broadcast, vec![1], 0);
        queue.push(GroupPacketType::Broadcast, vec![2], 0);
        assert!(queue.ack(2));
        assert!(!queue.ack(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retransmit_backoff_schedule() {
        assert_eq!(retransmit_backoff_ms(0), RETRANSMIT_FLOOR_MS);
        assert_eq!(retransmit_backoff_ms(1), RETRANSMIT_FLOOR_MS * 2);
        assert_eq!(retransmit_backoff_ms(3), RETRANSMIT_CEIL_MS);
        assert_eq!(retransmit_backoff_ms(30), RETRANSMIT_CEIL_MS);
    }

    #[test]
    fn test_due_retransmits_advance_clock() {
        let mut queue = SendQueue::new();
        queue.push(GroupPacketType::Broadcast, body(1), 0);

        assert!(queue.due_retransmits(RETRANSMIT_FLOOR_MS - 1).is_empty());
        assert_eq!(queue.due_retransmits(RETRANSMIT_FLOOR_MS).len(), 1);
        // Second retry waits twice as long.
        assert!(queue.due_retransmits(RETRANSMIT_FLOOR_MS * 2).is_empty());
        assert_eq!(queue.due_retransmits(RETRANSMIT_FLOOR_MS * 3).len(), 1);
    }

    #[test]
    fn test_force_retransmit() {
        let mut queue = SendQueue::new();
        queue.push(GroupPacketType::Broadcast, body(9), 100);
        assert_eq!(queue.force_retransmit(1, 150), Some(body(9)));
        assert_eq!(queue.force_retransmit(5, 150), None);
        // The forced send restarted the backoff clock.
        assert!(queue.due_retransmits(150 + RETRANSMIT_FLOOR_MS).is_empty());
    }

    #[test]
    fn test_recv_in_order_delivery() {
        let mut queue = RecvQueue::new();
        match queue.receive(1, GroupPacketType::Broadcast, body(1)) {
            RecvOutcome::Deliver(run) => assert_eq!(run.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(queue.expected_id(), 2);
    }

    #[test]
    fn test_recv_buffers_and_flushes_gap() {
        let mut queue = RecvQueue::new();
        assert_eq!(queue.receive(3, GroupPacketType::Broadcast, body(3)), RecvOutcome::Buffered);
        assert_eq!(queue.receive(2, GroupPacketType::Broadcast, body(2)), RecvOutcome::Buffered);
        match queue.receive(1, GroupPacketType::Broadcast, body(1)) {
            RecvOutcome::Deliver(run) => {
                let ids: Vec<u64> = run.iter().map(|(id, _, _)| *id).collect();
                assert_eq!(ids, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(queue.expected_id(), 4);
    }

    #[test]
    fn test_recv_duplicates() {
        let mut queue = RecvQueue::new();
        let _ = queue.receive(1, GroupPacketType::Broadcast, body(1));
        assert_eq!(queue.receive(1, GroupPacketType::Broadcast, body(1)), RecvOutcome::Duplicate);
        assert_eq!(queue.receive(5, GroupPacketType::Broadcast, body(5)), RecvOutcome::Buffered);
        assert_eq!(queue.receive(5, GroupPacketType::Broadcast, body(5)), RecvOutcome::Duplicate);
    }

    #[test]
    fn test_recv_window_bound() {
        let mut queue = RecvQueue::new();
        let far = 1 + RECV_BUFFER_MAX as u64;
        assert_eq!(queue.receive(far, GroupPacketType::Broadcast, body(far)), RecvOutcome::Dropped);
        assert_eq!(
            queue.receive(far - 1, GroupPacketType::Broadcast, body(far - 1)),
            RecvOutcome::Buffered
        );
    }

    #[test]
    fn test_missing_ids() {
        let mut queue = RecvQueue::new();
        let _ = queue.receive(1, GroupPacketType::Broadcast, body(1));
        let _ = queue.receive(4, GroupPacketType::Broadcast, body(4));
        let _ = queue.receive(6, GroupPacketType::Broadcast, body(6));
        assert_eq!(queue.missing_ids(8), vec![2, 3, 5]);
        assert_eq!(queue.missing_ids(1), vec![2]);
    }

    #[test]
    fn test_request_throttle() {
        let mut queue = RecvQueue::new();
        assert!(queue.may_send_request(ACK_REQUEST_INTERVAL_MS));
        queue.note_request_sent(1_000);
        assert!(!queue.may_send_request(1_500));
        assert!(queue.may_send_request(2_000));
    }
}
