//! Onion announce client and responder.
//!
//! Public groups rendezvous through announce records stored on nodes whose
//! DHT keys are close to the chat ID. The responder side answers sealed
//! announce requests: it validates a SHA-256 ping-id challenge bound to the
//! requester's key and source address, stores or refreshes the entry in a
//! bounded table kept sorted by XOR distance to its own key, and returns
//! close-node candidates plus known group-peer announces. The searcher side
//! builds requests, correlates responses through an opaque sendback token
//! and hands discovered peers to the session for invite handshakes.
//!
//! The onion wrapping itself is the transport collaborator's concern; this
//! module sees requests after the last onion layer is peeled and emits
//! responses addressed to an opaque return endpoint.

use super::types::{
    ChatId, IpPort, NodeInfo, TcpRelay, MAX_ANNOUNCED_TCP_RELAYS, MAX_SENT_ANNOUNCES,
    MAX_SENT_NODES, MAX_STORED_ANNOUNCES_PER_CHAT, NONCE_SIZE, ONION_ANNOUNCE_MAX_ENTRIES,
    ONION_ANNOUNCE_TIMEOUT_MS, PING_ID_SIZE, PING_ID_TIMEOUT_MS, PUBLIC_KEY_SIZE, SENDBACK_SIZE,
};
use crate::crypto;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Packet id of an announce request after onion unwrapping.
pub const ANNOUNCE_REQUEST_ID: u8 = 0x84;

/// Packet id of an announce response.
pub const ANNOUNCE_RESPONSE_ID: u8 = 0x85;

/// Packet id of a relayed data request.
pub const DATA_REQUEST_ID: u8 = 0x86;

/// Response status byte values.
pub const ANNOUNCE_STATUS_NOT_STORED: u8 = 0;
pub const ANNOUNCE_STATUS_STORED_OTHER: u8 = 1;
pub const ANNOUNCE_STATUS_STORED_SELF: u8 = 2;

// =============================================================================
// GROUP ANNOUNCE BLOB
// =============================================================================

/// One group-peer presence record:
/// `[chat_id:32][enc_pk:32][sign_pk:32][ip_present:1][ip_port?][relay_count:1][relays]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAnnounce {
    pub chat_id: ChatId,
    pub peer_enc_pk: [u8; PUBLIC_KEY_SIZE],
    pub peer_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub ip_port: Option<IpPort>,
    pub tcp_relays: Vec<TcpRelay>,
}

impl GroupAnnounce {
    /// An announce must offer at least one way to reach the peer.
    pub fn is_routable(&self) -> bool {
        self.ip_port.is_some() || !self.tcp_relays.is_empty()
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.chat_id);
        out.extend_from_slice(&self.peer_enc_pk);
        out.extend_from_slice(&self.peer_sign_pk);
        match self.ip_port {
            Some(ip_port) => {
                out.push(1);
                ip_port.pack(out);
            }
            None => out.push(0),
        }
        let count = self.tcp_relays.len().min(MAX_ANNOUNCED_TCP_RELAYS);
        out.push(count as u8);
        for relay in &self.tcp_relays[..count] {
            relay.pack(out);
        }
    }

    pub fn unpack(data: &[u8]) -> Option<(Self, usize)> {
        let chat_id: ChatId = data.get(..32)?.try_into().ok()?;
        let peer_enc_pk: [u8; PUBLIC_KEY_SIZE] = data.get(32..64)?.try_into().ok()?;
        let peer_sign_pk: [u8; PUBLIC_KEY_SIZE] = data.get(64..96)?.try_into().ok()?;
        let mut offset = 96;
        let ip_port = match *data.get(offset)? {
            0 => {
                offset += 1;
                None
            }
            1 => {
                offset += 1;
                let (ip_port, used) = IpPort::unpack(data.get(offset..)?)?;
                offset += used;
                Some(ip_port)
            }
            _ => return None,
        };
        let relay_count = *data.get(offset)? as usize;
        if relay_count > MAX_ANNOUNCED_TCP_RELAYS {
            return None;
        }
        offset += 1;
        let mut tcp_relays = Vec::with_capacity(relay_count);
        for _ in 0..relay_count {
            let (relay, used) = TcpRelay::unpack(data.get(offset..)?)?;
            tcp_relays.push(relay);
            offset += used;
        }
        Some((Self { chat_id, peer_enc_pk, peer_sign_pk, ip_port, tcp_relays }, offset))
    }
}

// =============================================================================
// XOR DISTANCE
// =============================================================================

/// Returns true when `a` is strictly closer to `base` than `b` in XOR
/// metric, comparing byte by byte from the top.
pub fn closer_to(base: &[u8; PUBLIC_KEY_SIZE], a: &[u8; PUBLIC_KEY_SIZE], b: &[u8; PUBLIC_KEY_SIZE]) -> bool {
    for i in 0..PUBLIC_KEY_SIZE {
        let da = base[i] ^ a[i];
        let db = base[i] ^ b[i];
        if da != db {
            return da < db;
        }
    }
    false
}

// =============================================================================
// RESPONDER
// =============================================================================

#[derive(Debug, Clone)]
struct AnnounceEntry {
    public_key: [u8; PUBLIC_KEY_SIZE],
    data_pk: [u8; PUBLIC_KEY_SIZE],
    ret_addr: IpPort,
    announce_time_ms: u64,
}

#[derive(Debug, Clone)]
struct StoredGroupAnnounce {
    announce: GroupAnnounce,
    stored_ms: u64,
}

/// Responder half: answers announce requests for chat IDs near our DHT key.
pub struct AnnounceResponder {
    dht_secret: x25519_dalek::StaticSecret,
    dht_public: [u8; PUBLIC_KEY_SIZE],
    /// Secret feeding the ping-id hash; never leaves this struct.
    ping_secret: [u8; 32],
    /// Sorted so that the entry least worth keeping sits at index 0:
    /// timed-out entries first, then by descending XOR distance to our key.
    entries: Vec<AnnounceEntry>,
    /// Known group-peer announces, bounded per chat.
    group_announces: HashMap<ChatId, Vec<StoredGroupAnnounce>>,
    /// DHT nodes offered as closer candidates; fed by the host.
    close_nodes: Vec<NodeInfo>,
}

impl AnnounceResponder {
    pub fn new() -> Self {
        let dht_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let dht_public = x25519_dalek::PublicKey::from(&dht_secret).to_bytes();
        let mut ping_secret = [0u8; 32];
        OsRng.fill_bytes(&mut ping_secret);
        Self {
            dht_secret,
            dht_public,
            ping_secret,
            entries: Vec::new(),
            group_announces: HashMap::new(),
            close_nodes: Vec::new(),
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.dht_public
    }

    /// Host-supplied DHT neighbourhood, used for closer-node referrals.
    pub fn set_close_nodes(&mut self, nodes: Vec<NodeInfo>) {
        self.close_nodes = nodes;
    }

    /// `SHA-256(secret ‖ bucket_time ‖ client_pk ‖ source)`; the bucket
    /// granularity bounds how long an issued id stays valid.
    fn ping_id(&self, bucket_time: u64, client_pk: &[u8; PUBLIC_KEY_SIZE], source: &IpPort) -> [u8; PING_ID_SIZE] {
        let mut packed_source = Vec::with_capacity(19);
        source.pack(&mut packed_source);
        let mut hasher = Sha256::new();
        hasher.update(self.ping_secret);
        hasher.update(bucket_time.to_be_bytes());
        hasher.update(client_pk);
        hasher.update(&packed_source);
        hasher.finalize().into()
    }

    fn entry_expired(entry: &AnnounceEntry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.announce_time_ms) >= ONION_ANNOUNCE_TIMEOUT_MS
    }

    fn find_entry(&self, public_key: &[u8; PUBLIC_KEY_SIZE], now_ms: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !Self::entry_expired(e, now_ms) && crypto::pk_equal(&e.public_key, public_key))
    }

    fn sort_entries(&mut self, now_ms: u64) {
        let base = self.dht_public;
        self.entries.sort_by(|a, b| {
            let ta = Self::entry_expired(a, now_ms);
            let tb = Self::entry_expired(b, now_ms);
            match (ta, tb) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => {
                    if closer_to(&base, &a.public_key, &b.public_key) {
                        std::cmp::Ordering::Greater
                    } else if closer_to(&base, &b.public_key, &a.public_key) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Equal
                    }
                }
            }
        });
    }

    /// Stores or refreshes an entry. When the table is full the slot at
    /// index 0 (expired, or the farthest from our key) is replaced iff the
    /// new key is closer. Returns the entry index, or None if not stored.
    fn add_entry(
        &mut self,
        source: IpPort,
        public_key: [u8; PUBLIC_KEY_SIZE],
        data_pk: [u8; PUBLIC_KEY_SIZE],
        now_ms: u64,
    ) -> Option<usize> {
        if let Some(index) = self.find_entry(&public_key, now_ms) {
            let entry = &mut self.entries[index];
            entry.ret_addr = source;
            entry.data_pk = data_pk;
            entry.announce_time_ms = now_ms;
            self.sort_entries(now_ms);
            return self.find_entry(&public_key, now_ms);
        }

        let new_entry = AnnounceEntry { public_key, data_pk, ret_addr: source, announce_time_ms: now_ms };

        if self.entries.len() < ONION_ANNOUNCE_MAX_ENTRIES {
            self.entries.push(new_entry);
        } else {
            let replaceable = Self::entry_expired(&self.entries[0], now_ms)
                || closer_to(&self.dht_public, &public_key, &self.entries[0].public_key);
            if !replaceable {
                return None;
            }
            self.entries[0] = new_entry;
        }
        self.sort_entries(now_ms);
        self.find_entry(&public_key, now_ms)
    }

    /// Stores a group announce, newest first, bounded per chat.
    fn add_group_announce(&mut self, announce: GroupAnnounce, now_ms: u64) {
        let list = self.group_announces.entry(announce.chat_id).or_default();
        list.retain(|stored| {
            stored.announce.peer_enc_pk != announce.peer_enc_pk
                && now_ms.saturating_sub(stored.stored_ms) < ONION_ANNOUNCE_TIMEOUT_MS
        });
        if list.len() >= MAX_STORED_ANNOUNCES_PER_CHAT {
            list.pop();
        }
        list.insert(0, StoredGroupAnnounce { announce, stored_ms: now_ms });
    }

    fn get_group_announces(
        &self,
        chat_id: &ChatId,
        exclude_enc_pk: &[u8; PUBLIC_KEY_SIZE],
        now_ms: u64,
    ) -> Vec<GroupAnnounce> {
        let Some(list) = self.group_announces.get(chat_id) else {
            return Vec::new();
        };
        list.iter()
            .filter(|stored| now_ms.saturating_sub(stored.stored_ms) < ONION_ANNOUNCE_TIMEOUT_MS)
            .filter(|stored| &stored.announce.peer_enc_pk != exclude_enc_pk)
            .take(MAX_SENT_ANNOUNCES)
            .map(|stored| stored.announce.clone())
            .collect()
    }

    fn closest_nodes(&self, target: &[u8; PUBLIC_KEY_SIZE]) -> Vec<NodeInfo> {
        let mut nodes = self.close_nodes.clone();
        nodes.sort_by(|a, b| {
            if closer_to(target, &a.public_key, &b.public_key) {
                std::cmp::Ordering::Less
            } else if closer_to(target, &b.public_key, &a.public_key) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        nodes.truncate(MAX_SENT_NODES);
        nodes
    }

    /// Handles one unwrapped announce request. Returns the response packet
    /// to send back to `source`, or None when the request is dropped.
    /// No error responses are ever produced: a failed check leaks nothing.
    pub fn handle_request(&mut self, source: IpPort, packet: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        if packet.first() != Some(&ANNOUNCE_REQUEST_ID) {
            return None;
        }
        let nonce: [u8; NONCE_SIZE] = packet.get(1..1 + NONCE_SIZE)?.try_into().ok()?;
        let requester_pk: [u8; PUBLIC_KEY_SIZE] =
            packet.get(1 + NONCE_SIZE..1 + NONCE_SIZE + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        let sealed = packet.get(1 + NONCE_SIZE + PUBLIC_KEY_SIZE..)?;

        let shared = crypto::derive_session_key(&self.dht_secret, &requester_pk).ok()?;
        let plain = match crypto::open(&shared, &nonce, sealed) {
            Ok(plain) => plain,
            Err(_) => {
                debug!("announce request from {:?} failed to open", source);
                return None;
            }
        };

        let ping_id: [u8; PING_ID_SIZE] = plain.get(..PING_ID_SIZE)?.try_into().ok()?;
        let search_pk: [u8; PUBLIC_KEY_SIZE] =
            plain.get(PING_ID_SIZE..PING_ID_SIZE + 32)?.try_into().ok()?;
        let data_pk: [u8; PUBLIC_KEY_SIZE] =
            plain.get(PING_ID_SIZE + 32..PING_ID_SIZE + 64)?.try_into().ok()?;
        let sendback: [u8; SENDBACK_SIZE] =
            plain.get(PING_ID_SIZE + 64..PING_ID_SIZE + 64 + SENDBACK_SIZE)?.try_into().ok()?;
        let blob = &plain[PING_ID_SIZE + 64 + SENDBACK_SIZE..];

        // A ping id is accepted for the bucket it was issued in and the one
        // after it, never longer.
        let bucket = now_ms / PING_ID_TIMEOUT_MS;
        let ping_id_current = self.ping_id(bucket, &requester_pk, &source);
        let ping_id_previous = self.ping_id(bucket.saturating_sub(1), &requester_pk, &source);
        let ping_id_valid = ping_id == ping_id_current || ping_id == ping_id_previous;

        // A valid challenge stores the requester; otherwise the request is
        // treated as a pure lookup of the searched key.
        let index = if ping_id_valid {
            self.add_entry(source, requester_pk, data_pk, now_ms)
        } else {
            self.find_entry(&search_pk, now_ms)
        };

        // Store the piggybacked group announce if the entry was accepted.
        if ping_id_valid && !blob.is_empty() {
            match GroupAnnounce::unpack(blob) {
                Some((announce, used)) if used == blob.len() && announce.is_routable() => {
                    self.add_group_announce(announce, now_ms);
                }
                _ => {
                    warn!("malformed group announce blob from {:?}", source);
                    return None;
                }
            }
        }

        // Status byte plus renewed ping id or stored data pk.
        let renewed = self.ping_id(bucket, &requester_pk, &source);
        let mut payload = Vec::with_capacity(2 + PING_ID_SIZE + 128);
        match index {
            Some(i) if crypto::pk_equal(&self.entries[i].public_key, &requester_pk) => {
                if self.entries[i].data_pk == data_pk {
                    payload.push(ANNOUNCE_STATUS_STORED_SELF);
                    payload.extend_from_slice(&renewed);
                } else {
                    payload.push(ANNOUNCE_STATUS_NOT_STORED);
                    payload.extend_from_slice(&renewed);
                }
            }
            Some(i) => {
                payload.push(ANNOUNCE_STATUS_STORED_OTHER);
                payload.extend_from_slice(&self.entries[i].data_pk);
            }
            None => {
                payload.push(ANNOUNCE_STATUS_NOT_STORED);
                payload.extend_from_slice(&renewed);
            }
        }

        let nodes = self.closest_nodes(&search_pk);
        payload.push(nodes.len() as u8);
        for node in &nodes {
            node.pack(&mut payload);
        }

        let announces = self.get_group_announces(&search_pk, &requester_pk, now_ms);
        payload.push(announces.len() as u8);
        for announce in &announces {
            announce.pack(&mut payload);
        }

        let response_nonce = crypto::random_nonce();
        let sealed = crypto::seal(&shared, &response_nonce, &payload);

        let mut response = Vec::with_capacity(1 + SENDBACK_SIZE + NONCE_SIZE + sealed.len());
        response.push(ANNOUNCE_RESPONSE_ID);
        response.extend_from_slice(&sendback);
        response.extend_from_slice(&response_nonce);
        response.extend_from_slice(&sealed);
        Some(response)
    }

    /// Relays a sealed data packet to a stored entry's return address.
    /// Returns `(return_addr, packet_to_forward)`.
    pub fn handle_data_request(&self, packet: &[u8], now_ms: u64) -> Option<(IpPort, Vec<u8>)> {
        if packet.first() != Some(&DATA_REQUEST_ID) {
            return None;
        }
        let target_pk: [u8; PUBLIC_KEY_SIZE] = packet.get(1..33)?.try_into().ok()?;
        let index = self.find_entry(&target_pk, now_ms)?;
        let forwarded = packet.get(33..)?.to_vec();
        Some((self.entries[index].ret_addr, forwarded))
    }

    #[cfg(test)]
    fn entry_count(&self, now_ms: u64) -> usize {
        self.entries.iter().filter(|e| !Self::entry_expired(e, now_ms)).count()
    }
}

impl Default for AnnounceResponder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SEARCHER
// =============================================================================

/// A peer discovered through an announce lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub announce: GroupAnnounce,
}

/// Searcher half: builds announce requests for one chat ID and digests the
/// responses.
pub struct AnnounceSearcher {
    chat_id: ChatId,
    search_secret: x25519_dalek::StaticSecret,
    search_public: [u8; PUBLIC_KEY_SIZE],
    data_public: [u8; PUBLIC_KEY_SIZE],
    /// Ping ids issued to us, per responder key.
    ping_ids: HashMap<[u8; PUBLIC_KEY_SIZE], [u8; PING_ID_SIZE]>,
    /// Outstanding sendback tokens mapped to the queried node.
    pending: HashMap<[u8; SENDBACK_SIZE], [u8; PUBLIC_KEY_SIZE]>,
    /// Candidate nodes to query, closest first.
    candidates: Vec<NodeInfo>,
}

impl AnnounceSearcher {
    pub fn new(chat_id: ChatId, bootstrap: Vec<NodeInfo>) -> Self {
        let search_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let search_public = x25519_dalek::PublicKey::from(&search_secret).to_bytes();
        // The data key receives relayed data packets; a separate keypair so
        // relays never learn the search identity.
        let data_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let data_public = x25519_dalek::PublicKey::from(&data_secret).to_bytes();
        Self {
            chat_id,
            search_secret,
            search_public,
            data_public,
            ping_ids: HashMap::new(),
            pending: HashMap::new(),
            candidates: bootstrap,
        }
    }

    pub fn search_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.search_public
    }

    pub fn add_candidates(&mut self, nodes: &[NodeInfo]) {
        for node in nodes {
            if self.candidates.iter().any(|n| n.public_key == node.public_key) {
                continue;
            }
            self.candidates.push(*node);
        }
        let chat_id = self.chat_id;
        self.candidates.sort_by(|a, b| {
            if closer_to(&chat_id, &a.public_key, &b.public_key) {
                std::cmp::Ordering::Less
            } else if closer_to(&chat_id, &b.public_key, &a.public_key) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        self.candidates.truncate(16);
    }

    /// Builds one round of announce requests to the closest candidates.
    /// `self_announce` is included when publishing our own presence.
    pub fn build_requests(&mut self, self_announce: Option<&GroupAnnounce>) -> Vec<(NodeInfo, Vec<u8>)> {
        let targets: Vec<NodeInfo> = self.candidates.iter().take(MAX_SENT_NODES).copied().collect();
        let mut requests = Vec::with_capacity(targets.len());
        for node in targets {
            let ping_id = self.ping_ids.get(&node.public_key).copied().unwrap_or([0; PING_ID_SIZE]);

            let mut sendback = [0u8; SENDBACK_SIZE];
            OsRng.fill_bytes(&mut sendback);
            self.pending.insert(sendback, node.public_key);

            let mut plain =
                Vec::with_capacity(PING_ID_SIZE + 64 + SENDBACK_SIZE + 128);
            plain.extend_from_slice(&ping_id);
            plain.extend_from_slice(&self.chat_id);
            plain.extend_from_slice(&self.data_public);
            plain.extend_from_slice(&sendback);
            if let Some(announce) = self_announce {
                announce.pack(&mut plain);
            }

            let Ok(shared) = crypto::derive_session_key(&self.search_secret, &node.public_key) else {
                continue;
            };
            let nonce = crypto::random_nonce();
            let sealed = crypto::seal(&shared, &nonce, &plain);

            let mut packet = Vec::with_capacity(1 + NONCE_SIZE + PUBLIC_KEY_SIZE + sealed.len());
            packet.push(ANNOUNCE_REQUEST_ID);
            packet.extend_from_slice(&nonce);
            packet.extend_from_slice(&self.search_public);
            packet.extend_from_slice(&sealed);
            requests.push((node, packet));
        }
        requests
    }

    /// Digests an announce response. Returns discovered group peers; new
    /// node candidates and renewed ping ids are absorbed internally.
    pub fn handle_response(&mut self, packet: &[u8]) -> Vec<DiscoveredPeer> {
        let Some(parsed) = self.parse_response(packet) else {
            debug!("dropping malformed announce response");
            return Vec::new();
        };
        parsed
    }

    fn parse_response(&mut self, packet: &[u8]) -> Option<Vec<DiscoveredPeer>> {
        if packet.first() != Some(&ANNOUNCE_RESPONSE_ID) {
            return None;
        }
        let sendback: [u8; SENDBACK_SIZE] = packet.get(1..1 + SENDBACK_SIZE)?.try_into().ok()?;
        let node_pk = self.pending.remove(&sendback)?;

        let nonce_start = 1 + SENDBACK_SIZE;
        let nonce: [u8; NONCE_SIZE] = packet.get(nonce_start..nonce_start + NONCE_SIZE)?.try_into().ok()?;
        let sealed = packet.get(nonce_start + NONCE_SIZE..)?;

        let shared = crypto::derive_session_key(&self.search_secret, &node_pk).ok()?;
        let plain = crypto::open(&shared, &nonce, sealed).ok()?;

        let status = *plain.first()?;
        let token: [u8; 32] = plain.get(1..33)?.try_into().ok()?;
        match status {
            ANNOUNCE_STATUS_NOT_STORED | ANNOUNCE_STATUS_STORED_SELF => {
                self.ping_ids.insert(node_pk, token);
            }
            ANNOUNCE_STATUS_STORED_OTHER => {
                // Someone else's entry; their data pk is of no use to a
                // group search.
            }
            _ => return None,
        }

        let node_count = *plain.get(33)? as usize;
        if node_count > MAX_SENT_NODES {
            return None;
        }
        let mut offset = 34;
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let (node, used) = NodeInfo::unpack(plain.get(offset..)?)?;
            nodes.push(node);
            offset += used;
        }
        self.add_candidates(&nodes);

        let announce_count = *plain.get(offset)? as usize;
        if announce_count > MAX_SENT_ANNOUNCES {
            return None;
        }
        offset += 1;
        let mut discovered = Vec::with_capacity(announce_count);
        for _ in 0..announce_count {
            let (announce, used) = GroupAnnounce::unpack(plain.get(offset..)?)?;
            offset += used;
            if announce.chat_id == self.chat_id && announce.is_routable() {
                discovered.push(DiscoveredPeer { announce });
            }
        }
        Some(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> IpPort {
        IpPort::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, last)), port)
    }

    fn node(seed: u8) -> NodeInfo {
        NodeInfo { public_key: [seed; 32], ip_port: addr(seed, 33445) }
    }

    fn sample_announce(chat_id: ChatId, seed: u8) -> GroupAnnounce {
        GroupAnnounce {
            chat_id,
            peer_enc_pk: [seed; 32],
            peer_sign_pk: [seed | 0x80; 32],
            ip_port: Some(addr(seed, 33445)),
            tcp_relays: Vec::new(),
        }
    }

    #[test]
    fn test_group_announce_codec() {
        let announce = GroupAnnounce {
            chat_id: [1; 32],
            peer_enc_pk: [2; 32],
            peer_sign_pk: [3; 32],
            ip_port: Some(addr(9, 1234)),
            tcp_relays: vec![TcpRelay { public_key: [4; 32], ip_port: addr(10, 443) }],
        };
        let mut buf = Vec::new();
        announce.pack(&mut buf);
        let (back, used) = GroupAnnounce::unpack(&buf).unwrap();
        assert_eq!(back, announce);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_closer_to() {
        let base = [0u8; 32];
        let near = {
            let mut k = [0u8; 32];
            k[31] = 1;
            k
        };
        let far = [0xff; 32];
        assert!(closer_to(&base, &near, &far));
        assert!(!closer_to(&base, &far, &near));
        assert!(!closer_to(&base, &near, &near));
    }

    /// Full search + announce round trip through a responder.
    #[test]
    fn test_announce_publish_then_discover() {
        let mut responder = AnnounceResponder::new();
        let responder_node = NodeInfo { public_key: *responder.public_key(), ip_port: addr(1, 33445) };
        let chat_id = [7; 32];

        // Publisher announces its presence. First round carries a zero ping
        // id, so it is not stored yet but a fresh ping id comes back.
        let mut publisher = AnnounceSearcher::new(chat_id, vec![responder_node]);
        let announce = sample_announce(chat_id, 42);
        let requests = publisher.build_requests(Some(&announce));
        assert_eq!(requests.len(), 1);
        let response = responder
            .handle_request(addr(42, 5555), &requests[0].1, 1_000)
            .expect("responder must answer");
        assert!(publisher.handle_response(&response).is_empty());

        // Second round carries the issued ping id and is stored.
        let requests = publisher.build_requests(Some(&announce));
        let response = responder.handle_request(addr(42, 5555), &requests[0].1, 2_000).unwrap();
        let _ = publisher.handle_response(&response);
        assert_eq!(responder.entry_count(2_000), 1);

        // A different searcher finds the stored announce.
        let mut seeker = AnnounceSearcher::new(chat_id, vec![responder_node]);
        let requests = seeker.build_requests(None);
        let response = responder.handle_request(addr(50, 6666), &requests[0].1, 3_000).unwrap();
        let discovered = seeker.handle_response(&response);
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].announce, announce);
    }

    #[test]
    fn test_ping_id_window() {
        let mut responder = AnnounceResponder::new();
        let responder_node = NodeInfo { public_key: *responder.public_key(), ip_port: addr(1, 33445) };
        let chat_id = [7; 32];
        let source = addr(42, 5555);

        let mut publisher = AnnounceSearcher::new(chat_id, vec![responder_node]);
        let announce = sample_announce(chat_id, 42);

        // Obtain a ping id at t0.
        let requests = publisher.build_requests(Some(&announce));
        let response = responder.handle_request(source, &requests[0].1, 0).unwrap();
        let _ = publisher.handle_response(&response);

        // One bucket later the id still validates.
        let requests = publisher.build_requests(Some(&announce));
        let response = responder
            .handle_request(source, &requests[0].1, PING_ID_TIMEOUT_MS + 1)
            .unwrap();
        let _ = publisher.handle_response(&response);
        assert_eq!(responder.entry_count(PING_ID_TIMEOUT_MS + 1), 1);

        // Two buckets after issuance an old id no longer validates, so a
        // new announce with it is not stored.
        let mut stale = AnnounceSearcher::new(chat_id, vec![responder_node]);
        let requests = stale.build_requests(Some(&sample_announce(chat_id, 43)));
        let response = responder.handle_request(addr(43, 1), &requests[0].1, 0).unwrap();
        let _ = stale.handle_response(&response);
        // Replay the same ping id far in the future.
        let requests = stale.build_requests(Some(&sample_announce(chat_id, 43)));
        let _ = responder.handle_request(addr(43, 1), &requests[0].1, PING_ID_TIMEOUT_MS * 3);
        let stored = responder.get_group_announces(&chat_id, &[0; 32], PING_ID_TIMEOUT_MS * 3);
        assert!(stored.iter().all(|a| a.peer_enc_pk != [43; 32]));
    }

    #[test]
    fn test_entry_eviction_prefers_closer_keys() {
        let mut responder = AnnounceResponder::new();
        let base = *responder.public_key();

        // Fill the table with keys far from the responder.
        for i in 0..ONION_ANNOUNCE_MAX_ENTRIES {
            let mut pk = [0xffu8; 32];
            pk[30] = (i >> 8) as u8;
            pk[31] = i as u8;
            pk[0] = base[0] ^ 0x80;
            assert!(responder.add_entry(addr(1, 1), pk, [0; 32], 1_000).is_some());
        }
        assert_eq!(responder.entry_count(1_000), ONION_ANNOUNCE_MAX_ENTRIES);

        // A key equal to our own (distance zero) displaces the farthest.
        assert!(responder.add_entry(addr(2, 2), base, [0; 32], 1_000).is_some());

        // A key farther than everything resident is rejected.
        let mut worst = [0u8; 32];
        for i in 0..32 {
            worst[i] = base[i] ^ 0xff;
        }
        assert!(responder.add_entry(addr(3, 3), worst, [0; 32], 1_000).is_none());
    }

    #[test]
    fn test_expired_entries_are_replaced_first() {
        let mut responder = AnnounceResponder::new();
        let pk = [9u8; 32];
        responder.add_entry(addr(1, 1), pk, [0; 32], 0);
        assert_eq!(responder.entry_count(0), 1);
        // After the timeout the entry no longer counts and its slot is free.
        assert_eq!(responder.entry_count(ONION_ANNOUNCE_TIMEOUT_MS), 0);
        assert!(responder.find_entry(&pk, ONION_ANNOUNCE_TIMEOUT_MS).is_none());
    }

    #[test]
    fn test_data_request_relay() {
        let mut responder = AnnounceResponder::new();
        let client_pk = [5; 32];
        let ret = addr(5, 5050);
        responder.add_entry(ret, client_pk, [6; 32], 1_000);

        let mut packet = vec![DATA_REQUEST_ID];
        packet.extend_from_slice(&client_pk);
        packet.extend_from_slice(b"sealed data for the client");

        let (dest, forwarded) = responder.handle_data_request(&packet, 2_000).unwrap();
        assert_eq!(dest, ret);
        assert_eq!(forwarded, b"sealed data for the client");

        // Unknown target: dropped.
        packet[1] ^= 0xff;
        assert!(responder.handle_data_request(&packet, 2_000).is_none());
    }

    #[test]
    fn test_response_correlation_requires_sendback() {
        let mut responder = AnnounceResponder::new();
        let responder_node = NodeInfo { public_key: *responder.public_key(), ip_port: addr(1, 33445) };
        let chat_id = [7; 32];
        let mut searcher = AnnounceSearcher::new(chat_id, vec![responder_node]);

        let requests = searcher.build_requests(None);
        let mut response = responder.handle_request(addr(9, 9), &requests[0].1, 0).unwrap();
        // Corrupt the sendback: the response no longer correlates.
        response[1] ^= 0xff;
        assert!(searcher.handle_response(&response).is_empty());
    }

    #[test]
    fn test_close_node_referrals() {
        let mut responder = AnnounceResponder::new();
        responder.set_close_nodes((0..10u8).map(node).collect());
        let responder_node = NodeInfo { public_key: *responder.public_key(), ip_port: addr(1, 33445) };

        let chat_id = [7; 32];
        let mut searcher = AnnounceSearcher::new(chat_id, vec![responder_node]);
        let requests = searcher.build_requests(None);
        let response = responder.handle_request(addr(9, 9), &requests[0].1, 0).unwrap();
        let _ = searcher.handle_response(&response);

        // The searcher absorbed referred nodes and now queries more of them.
        let requests = searcher.build_requests(None);
        assert!(requests.len() > 1);
        assert!(requests.len() <= MAX_SENT_NODES);
    }
}
