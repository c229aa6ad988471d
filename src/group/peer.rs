//! Per-peer state and the roster arena.
//!
//! Peer records are stored in an arena of generation-tagged slots. Lookups
//! across component boundaries go through stable `PeerHandle`s instead of
//! references, so removing a peer invalidates every outstanding handle
//! without dangling state. The public `PeerId` is a separate runtime-only
//! counter handed to the host; the stable identity of a peer is its
//! encryption public key.

use super::lossless::{RecvQueue, SendQueue};
use super::types::{
    HandshakeState, IpPort, PeerId, PeerStatus, TcpRelay, Transport,
    CONFIRMED_PEER_TIMEOUT_MS, MAX_ANNOUNCED_TCP_RELAYS, PROTOCOL_ERROR_LIMIT,
    UDP_DIRECT_TIMEOUT_MS, UNCONFIRMED_PEER_TIMEOUT_MS, PUBLIC_KEY_SIZE,
};
use crate::crypto::{self, SessionKey};
use std::collections::HashMap;
use tracing::warn;

// =============================================================================
// CONNECTION
// =============================================================================

/// Transport state for one peer. UDP is preferred whenever the direct path
/// has seen traffic recently; otherwise packets are routed through one of
/// the peer's advertised TCP relays.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub ip_port: Option<IpPort>,
    pub tcp_relays: Vec<TcpRelay>,
    pub direct_last_recv_ms: u64,
    pub tcp_last_recv_ms: u64,
}

impl PeerConnection {
    pub fn new() -> Self {
        Self {
            ip_port: None,
            tcp_relays: Vec::new(),
            direct_last_recv_ms: 0,
            tcp_last_recv_ms: 0,
        }
    }

    /// The direct path counts as alive if a UDP packet arrived recently.
    pub fn direct_alive(&self, now_ms: u64) -> bool {
        self.ip_port.is_some()
            && self.direct_last_recv_ms != 0
            && now_ms.saturating_sub(self.direct_last_recv_ms) < UDP_DIRECT_TIMEOUT_MS
    }

    /// Transport the next send should use.
    pub fn preferred_transport(&self, now_ms: u64) -> Transport {
        if self.direct_alive(now_ms) {
            Transport::Udp
        } else if !self.tcp_relays.is_empty() {
            Transport::Tcp
        } else if self.ip_port.is_some() {
            // No relay known; keep trying the direct path.
            Transport::Udp
        } else {
            Transport::None
        }
    }

    /// Merges newly learned relays, keeping the list bounded.
    pub fn add_relays(&mut self, relays: &[TcpRelay]) {
        for relay in relays {
            if self.tcp_relays.iter().any(|r| r.public_key == relay.public_key) {
                continue;
            }
            if self.tcp_relays.len() >= MAX_ANNOUNCED_TCP_RELAYS {
                self.tcp_relays.remove(0);
            }
            self.tcp_relays.push(*relay);
        }
    }
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// PEER RECORD
// =============================================================================

/// State still owed to a freshly confirmed peer.
#[derive(Debug, Clone, Default)]
pub struct PendingSync {
    pub peer_info: bool,
    pub state: bool,
    pub last_request_ms: u64,
}

impl PendingSync {
    pub fn all() -> Self {
        Self { peer_info: true, state: true, last_request_ms: 0 }
    }

    pub fn is_done(&self) -> bool {
        !self.peer_info && !self.state
    }
}

/// Everything the engine tracks for one remote peer.
pub struct PeerRecord {
    // Identity
    pub enc_pk: [u8; PUBLIC_KEY_SIZE],
    pub sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub peer_id: PeerId,

    // Keying. The previous key is kept across a rotation so packets sealed
    // before the switch still open.
    pub session_key: SessionKey,
    pub prev_session_key: Option<SessionKey>,

    // Presence
    pub nick: Vec<u8>,
    pub status: PeerStatus,
    pub ignored: bool,

    // Handshake and connection
    pub handshake: HandshakeState,
    pub connection: PeerConnection,

    // Lossless channel
    pub send_queue: SendQueue,
    pub recv_queue: RecvQueue,

    // Timers
    pub created_ms: u64,
    pub last_received_ms: u64,
    pub last_received_ping_ms: u64,
    pub last_sent_ping_ms: u64,
    pub last_sent_ip_port_ms: u64,

    // Reconciliation and misbehavior
    pub pending_sync: PendingSync,
    pub protocol_errors: u32,
}

impl PeerRecord {
    pub fn new(
        enc_pk: [u8; PUBLIC_KEY_SIZE],
        sign_pk: [u8; PUBLIC_KEY_SIZE],
        session_key: SessionKey,
        now_ms: u64,
    ) -> Self {
        Self {
            enc_pk,
            sign_pk,
            peer_id: 0,
            session_key,
            prev_session_key: None,
            nick: Vec::new(),
            status: PeerStatus::None,
            ignored: false,
            handshake: HandshakeState::None,
            connection: PeerConnection::new(),
            send_queue: SendQueue::new(),
            recv_queue: RecvQueue::new(),
            created_ms: now_ms,
            last_received_ms: now_ms,
            last_received_ping_ms: 0,
            last_sent_ping_ms: 0,
            last_sent_ip_port_ms: 0,
            pending_sync: PendingSync::default(),
            protocol_errors: 0,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.handshake == HandshakeState::Confirmed
    }

    /// Marks inbound traffic on the given transport.
    pub fn on_packet_received(&mut self, transport: Transport, now_ms: u64) {
        self.last_received_ms = now_ms;
        match transport {
            Transport::Udp => self.connection.direct_last_recv_ms = now_ms,
            Transport::Tcp => self.connection.tcp_last_recv_ms = now_ms,
            Transport::None => {}
        }
    }

    /// True once the peer has been silent long enough to be dropped. The
    /// window depends on whether the handshake ever completed.
    pub fn timed_out(&self, now_ms: u64) -> bool {
        let window = if self.is_confirmed() {
            CONFIRMED_PEER_TIMEOUT_MS
        } else {
            UNCONFIRMED_PEER_TIMEOUT_MS
        };
        now_ms.saturating_sub(self.last_received_ms) >= window
    }

    /// Records a peer-attributable protocol error. Returns true once the
    /// configured threshold is crossed and the peer should be dropped.
    pub fn misbehaving(&mut self, reason: &str) -> bool {
        self.protocol_errors = self.protocol_errors.saturating_add(1);
        warn!(
            "peer {} misbehaving: {} ({}/{})",
            crypto::fingerprint(&self.enc_pk),
            reason,
            self.protocol_errors,
            PROTOCOL_ERROR_LIMIT
        );
        self.protocol_errors >= PROTOCOL_ERROR_LIMIT
    }
}

// =============================================================================
// ROSTER ARENA
// =============================================================================

/// Stable reference to a peer slot. Handles from removed peers fail every
/// lookup because the slot generation has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    record: Option<PeerRecord>,
}

/// The roster: an arena of peer records keyed by encryption public key.
/// A peer appears at most once; insertion order is not observable.
#[derive(Default)]
pub struct PeerList {
    slots: Vec<Slot>,
    by_enc_pk: HashMap<[u8; PUBLIC_KEY_SIZE], u32>,
    by_peer_id: HashMap<PeerId, u32>,
    next_peer_id: PeerId,
}

impl PeerList {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_enc_pk: HashMap::new(),
            by_peer_id: HashMap::new(),
            next_peer_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.by_enc_pk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_enc_pk.is_empty()
    }

    pub fn confirmed_count(&self) -> usize {
        self.iter().filter(|(_, p)| p.is_confirmed()).count()
    }

    /// Inserts a record, assigning its public peer id. Fails if the key is
    /// already present.
    pub fn insert(&mut self, mut record: PeerRecord) -> Option<PeerHandle> {
        if self.by_enc_pk.contains_key(&record.enc_pk) {
            return None;
        }
        record.peer_id = self.next_peer_id;
        self.next_peer_id = self.next_peer_id.wrapping_add(1);

        let enc_pk = record.enc_pk;
        let peer_id = record.peer_id;

        // Reuse a free slot if one exists.
        let index = match self.slots.iter().position(|s| s.record.is_none()) {
            Some(free) => {
                self.slots[free].record = Some(record);
                free as u32
            }
            None => {
                self.slots.push(Slot { generation: 0, record: Some(record) });
                (self.slots.len() - 1) as u32
            }
        };

        self.by_enc_pk.insert(enc_pk, index);
        self.by_peer_id.insert(peer_id, index);
        Some(PeerHandle { index, generation: self.slots[index as usize].generation })
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&PeerRecord> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Removes a peer, invalidating every outstanding handle to it.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<PeerRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_enc_pk.remove(&record.enc_pk);
        self.by_peer_id.remove(&record.peer_id);
        Some(record)
    }

    pub fn find_by_enc_pk(&self, enc_pk: &[u8; PUBLIC_KEY_SIZE]) -> Option<PeerHandle> {
        let index = *self.by_enc_pk.get(enc_pk)?;
        Some(PeerHandle { index, generation: self.slots[index as usize].generation })
    }

    pub fn find_by_peer_id(&self, peer_id: PeerId) -> Option<PeerHandle> {
        let index = *self.by_peer_id.get(&peer_id)?;
        Some(PeerHandle { index, generation: self.slots[index as usize].generation })
    }

    /// All live handles, in slot order.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.record.is_some())
            .map(|(index, slot)| PeerHandle { index: index as u32, generation: slot.generation })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &PeerRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (PeerHandle { index: index as u32, generation: slot.generation }, record)
            })
        })
    }

    /// Drops every peer, preserving nothing. Used on group disconnect.
    pub fn clear(&mut self) -> Vec<PeerRecord> {
        let mut removed = Vec::new();
        for slot in &mut self.slots {
            if let Some(record) = slot.record.take() {
                slot.generation = slot.generation.wrapping_add(1);
                removed.push(record);
            }
        }
        self.by_enc_pk.clear();
        self.by_peer_id.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(seed: u8) -> PeerRecord {
        PeerRecord::new([seed; 32], [seed | 0x80; 32], SessionKey::from_bytes([seed; 32]), 1_000)
    }

    #[test]
    fn test_insert_assigns_unique_peer_ids() {
        let mut list = PeerList::new();
        let h1 = list.insert(test_record(1)).unwrap();
        let h2 = list.insert(test_record(2)).unwrap();
        let id1 = list.get(h1).unwrap().peer_id;
        let id2 = list.get(h2).unwrap().peer_id;
        assert_ne!(id1, id2);
        assert_eq!(list.find_by_peer_id(id2), Some(h2));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut list = PeerList::new();
        assert!(list.insert(test_record(1)).is_some());
        assert!(list.insert(test_record(1)).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_stale_handle_fails_after_removal() {
        let mut list = PeerList::new();
        let handle = list.insert(test_record(1)).unwrap();
        assert!(list.remove(handle).is_some());
        assert!(list.get(handle).is_none());
        assert!(list.remove(handle).is_none());

        // Slot reuse hands out a fresh generation.
        let new_handle = list.insert(test_record(2)).unwrap();
        assert_ne!(handle, new_handle);
        assert!(list.get(handle).is_none());
        assert!(list.get(new_handle).is_some());
    }

    #[test]
    fn test_find_by_enc_pk() {
        let mut list = PeerList::new();
        let handle = list.insert(test_record(7)).unwrap();
        assert_eq!(list.find_by_enc_pk(&[7; 32]), Some(handle));
        assert_eq!(list.find_by_enc_pk(&[8; 32]), None);
    }

    #[test]
    fn test_timeout_windows() {
        let mut record = test_record(1);
        assert!(!record.timed_out(1_000 + UNCONFIRMED_PEER_TIMEOUT_MS - 1));
        assert!(record.timed_out(1_000 + UNCONFIRMED_PEER_TIMEOUT_MS));

        record.handshake = HandshakeState::Confirmed;
        assert!(!record.timed_out(1_000 + UNCONFIRMED_PEER_TIMEOUT_MS));
        assert!(record.timed_out(1_000 + CONFIRMED_PEER_TIMEOUT_MS));
    }

    #[test]
    fn test_transport_preference() {
        let mut conn = PeerConnection::new();
        assert_eq!(conn.preferred_transport(10_000), Transport::None);

        conn.tcp_relays.push(TcpRelay {
            public_key: [9; 32],
            ip_port: IpPort::new("192.0.2.9".parse().unwrap(), 443),
        });
        assert_eq!(conn.preferred_transport(10_000), Transport::Tcp);

        conn.ip_port = Some(IpPort::new("192.0.2.1".parse().unwrap(), 33445));
        conn.direct_last_recv_ms = 9_000;
        assert_eq!(conn.preferred_transport(10_000), Transport::Udp);

        // Direct path goes stale, fall back to the relay.
        assert_eq!(conn.preferred_transport(9_000 + UDP_DIRECT_TIMEOUT_MS), Transport::Tcp);
    }

    #[test]
    fn test_relay_list_bounded() {
        let mut conn = PeerConnection::new();
        for seed in 0..5u8 {
            conn.add_relays(&[TcpRelay {
                public_key: [seed; 32],
                ip_port: IpPort::new("192.0.2.1".parse().unwrap(), 443),
            }]);
        }
        assert_eq!(conn.tcp_relays.len(), MAX_ANNOUNCED_TCP_RELAYS);
        // Oldest entries were evicted.
        assert_eq!(conn.tcp_relays[0].public_key, [2; 32]);
    }

    #[test]
    fn test_misbehaving_threshold() {
        let mut record = test_record(1);
        for _ in 0..PROTOCOL_ERROR_LIMIT - 1 {
            assert!(!record.misbehaving("bad signature"));
        }
        assert!(record.misbehaving("bad signature"));
    }

    #[test]
    fn test_clear_empties_roster() {
        let mut list = PeerList::new();
        let handle = list.insert(test_record(1)).unwrap();
        list.insert(test_record(2)).unwrap();
        let removed = list.clear();
        assert_eq!(removed.len(), 2);
        assert!(list.is_empty());
        assert!(list.get(handle).is_none());
    }
}
