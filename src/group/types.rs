//! Constants and shared types for the group session engine.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** - every queue, table and payload has an
//!    explicit size limit. A peer cannot exhaust memory by flooding the
//!    lossless layer or the announce responder.
//!
//! 2. **Fixed wire constants** - all sizes below are observable on the wire
//!    and must not change without a protocol version bump.
//!
//! 3. **Single-writer engine** - all types here are plain data; the session
//!    tree is mutated only from the host tick loop (one lock around the
//!    whole session if the host is threaded, never inside it).

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub use crate::crypto::{
    HASH_SIZE, MAC_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE,
};

// =============================================================================
// IDENTITY
// =============================================================================

/// Number of bytes in a chat ID. A chat ID is the Ed25519 public key of the
/// group founder's identity and permanently identifies the group.
pub const CHAT_ID_SIZE: usize = 32;

/// A group's permanent cryptographic identity.
pub type ChatId = [u8; CHAT_ID_SIZE];

/// Local handle for a joined group. Not portable across sessions.
pub type GroupId = u32;

/// Local handle for a peer within one session. Not portable; the stable
/// peer identity is the peer's encryption public key.
pub type PeerId = u32;

/// Host-assigned handle for a contact on the external messenger layer.
pub type FriendId = u32;

// =============================================================================
// LENGTH LIMITS (wire-observable)
// =============================================================================

/// Maximum length of a group name.
pub const MAX_GROUP_NAME_LEN: usize = 48;

/// Maximum length of a peer nickname.
pub const MAX_NICK_LEN: usize = 128;

/// Maximum length of a group topic.
pub const MAX_TOPIC_LEN: usize = 512;

/// Maximum length of a group password.
pub const MAX_PASSWORD_LEN: usize = 32;

/// Maximum length of a parting message.
pub const MAX_PART_LEN: usize = 128;

/// Maximum length of a single group message.
pub const MAX_MESSAGE_LEN: usize = 1372;

/// Maximum size of a custom packet payload.
pub const MAX_CUSTOM_PACKET_LEN: usize = 1373;

// =============================================================================
// TIMEOUTS
// =============================================================================
// All intervals in milliseconds; the engine never reads a clock itself,
// the host passes `now_ms` into every entry point.

/// Keepalive interval per confirmed peer.
pub const PING_INTERVAL_MS: u64 = 12_000;

/// A confirmed peer with no received traffic in this window is dropped.
/// 6 ping intervals plus 10 s of slack.
pub const CONFIRMED_PEER_TIMEOUT_MS: u64 = PING_INTERVAL_MS * 6 + 10_000;

/// An unconfirmed peer that never completes the handshake is dropped after
/// one ping interval.
pub const UNCONFIRMED_PEER_TIMEOUT_MS: u64 = PING_INTERVAL_MS;

/// If no direct traffic arrived in this window, the next ping piggybacks
/// our IP/port so peers can re-establish a direct link after a NAT change.
pub const SEND_IP_PORT_INTERVAL_MS: u64 = PING_INTERVAL_MS * 5;

/// A direct path counts as alive if a UDP packet arrived within this window.
pub const UDP_DIRECT_TIMEOUT_MS: u64 = 8_000;

/// Re-send interval for outstanding peer-info and state sync requests.
pub const SYNC_RETRY_INTERVAL_MS: u64 = 5_000;

// =============================================================================
// LOSSLESS LAYER LIMITS
// =============================================================================

/// Maximum depth of the per-peer lossless send queue. `send_lossless`
/// surfaces backpressure once the queue is full.
pub const SEND_QUEUE_MAX: usize = 1024;

/// Maximum number of out-of-order packets buffered per peer ahead of the
/// expected id. Beyond this the packet is dropped and re-requested later.
pub const RECV_BUFFER_MAX: usize = 1024;

/// Minimum spacing between re-send request ACKs, per peer.
pub const ACK_REQUEST_INTERVAL_MS: u64 = 1_000;

/// First retransmit fires after this long; the interval then doubles.
pub const RETRANSMIT_FLOOR_MS: u64 = 500;

/// Retransmit backoff ceiling. Entries are retried forever at this rate
/// while the peer lives; the queue dies with the peer.
pub const RETRANSMIT_CEIL_MS: u64 = 4_000;

// =============================================================================
// ANNOUNCE / RENDEZVOUS LIMITS
// =============================================================================

/// Responder-side announce entries expire after this long.
pub const ONION_ANNOUNCE_TIMEOUT_MS: u64 = 300_000;

/// Ping-id bucket width. A ping id is valid for at most two consecutive
/// buckets after issuance.
pub const PING_ID_TIMEOUT_MS: u64 = ONION_ANNOUNCE_TIMEOUT_MS;

/// Size of the responder's announce entry table.
/// 160 entries x ~120 bytes is negligible; the bound exists so an attacker
/// announcing many keys can only displace entries farther from our DHT key.
pub const ONION_ANNOUNCE_MAX_ENTRIES: usize = 160;

/// Maximum DHT node candidates returned in one announce response.
pub const MAX_SENT_NODES: usize = 4;

/// Maximum group-peer announces returned in one announce response.
pub const MAX_SENT_ANNOUNCES: usize = 4;

/// Stored group announces kept per chat on the responder.
pub const MAX_STORED_ANNOUNCES_PER_CHAT: usize = 16;

/// Opaque caller state echoed back by the announce responder.
pub const SENDBACK_SIZE: usize = 8;

/// Size of the ping-id challenge.
pub const PING_ID_SIZE: usize = 32;

/// How often a connected public group re-publishes its announce record.
pub const ANNOUNCE_PUBLISH_INTERVAL_MS: u64 = 60_000;

/// How often a connecting group re-runs the chat ID search.
pub const ANNOUNCE_SEARCH_INTERVAL_MS: u64 = 10_000;

/// Maximum TCP relays carried per peer in announces and relay packets.
pub const MAX_ANNOUNCED_TCP_RELAYS: usize = 3;

// =============================================================================
// STATE LIST LIMITS
// =============================================================================

/// Maximum moderators in the founder-signed list.
pub const MAX_GROUP_MODERATORS: usize = 128;

/// Maximum concurrent sanctions entries.
pub const MAX_SANCTIONS: usize = 30;

/// Maximum peers described in one sync response.
pub const MAX_SYNC_RESPONSE_PEERS: usize = 32;

// =============================================================================
// PROTOCOL ERROR TOLERANCE
// =============================================================================

/// A peer whose packets repeatedly fail validation is dropped after this
/// many consecutive protocol errors.
pub const PROTOCOL_ERROR_LIMIT: u32 = 8;

// =============================================================================
// STATE ENUMS
// =============================================================================

/// Who may discover and join the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrivacyState {
    /// Discoverable through announce lookups; anyone with the chat ID may join.
    Public = 0x00,
    /// Joinable through friend invites only; nothing is announced.
    Private = 0x01,
}

impl PrivacyState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Public),
            0x01 => Some(Self::Private),
            _ => None,
        }
    }
}

/// Topic permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TopicLock {
    /// Only the founder and moderators may set the topic.
    Enabled = 0x00,
    /// Anyone except observers may set the topic.
    Disabled = 0x01,
}

impl TopicLock {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Enabled),
            0x01 => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Group roles, most to least privileged. A peer's role is never stored;
/// it is derived from the adopted state (see `shared_state::derive_role`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    Founder = 0x00,
    Moderator = 0x01,
    User = 0x02,
    Observer = 0x03,
}

/// User-visible peer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PeerStatus {
    None = 0x00,
    Away = 0x01,
    Busy = 0x02,
}

impl PeerStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::None),
            0x01 => Some(Self::Away),
            0x02 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Per-peer handshake state machine.
///
/// ```text
///                  send INVITE_REQUEST
///      ┌──────┐ ─────────────────────────► ┌──────┐
///      │ None │                            │ Sent │
///      └──┬───┘                            └──┬───┘
///         │ recv INVITE_REQUEST               │ recv INVITE_RESPONSE
///         ▼                                   ▼
///   ┌────────────┐                       ┌──────────┐
///   │ Responding │                       │ Received │
///   └─────┬──────┘                       └────┬─────┘
///         │ recv HS_RESPONSE_ACK              │ send HS_RESPONSE_ACK
///         ▼                                   ▼
///              ┌───────────┐
///              │ Confirmed │ ── PEER_EXIT / timeout ──► removed
///              └───────────┘
/// ```
///
/// Only confirmed peers take part in broadcasts and sync. Unconfirmed peers
/// time out after one ping interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake traffic yet.
    None,
    /// We initiated and sent an invite request.
    Sent,
    /// Our invite request was answered; we owe an HS_RESPONSE_ACK.
    Received,
    /// The peer initiated; we answered and await their HS_RESPONSE_ACK.
    Responding,
    /// Handshake complete; peer participates in the group.
    Confirmed,
}

/// Group-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transport currently carrying a peer's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    None,
    Udp,
    Tcp,
}

/// Join rejection codes sent in `INVITE_RESPONSE_REJECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JoinRejected {
    GroupFull = 0x00,
    InvalidPassword = 0x01,
    InviteFailed = 0x02,
    Invalid = 0x03,
}

impl JoinRejected {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::GroupFull),
            0x01 => Some(Self::InvalidPassword),
            0x02 => Some(Self::InviteFailed),
            0x03 => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Join failure as surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFail {
    NameTaken,
    PeerLimit,
    InvalidPassword,
    Unknown,
}

/// Why a peer left, on the `peer_exit` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// The peer sent PEER_EXIT.
    Quit,
    /// No traffic within the confirmed-peer timeout.
    Timeout,
    /// The peer's connection died without an exit packet.
    Disconnected,
    /// We disconnected from the group ourselves.
    SelfDisconnected,
    /// A moderation event removed the peer.
    Kick,
    /// The peer's state could not be reconciled.
    SyncError,
}

/// Moderation events carried in signed moderation broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModEvent {
    /// Target was kicked from the group.
    Kick = 0x00,
    /// Target was demoted to observer.
    Observer = 0x01,
    /// Target was returned to the user role.
    User = 0x02,
    /// Target was promoted to moderator.
    Mod = 0x03,
}

impl ModEvent {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Kick),
            0x01 => Some(Self::Observer),
            0x02 => Some(Self::User),
            0x03 => Some(Self::Mod),
            _ => None,
        }
    }
}

/// Message flavor for plain and private messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Normal = 0x00,
    Action = 0x01,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Normal),
            0x01 => Some(Self::Action),
            _ => None,
        }
    }
}

/// Lossless acknowledgement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckKind {
    /// The id'd packet was delivered; drop it from the send queue.
    Recv = 0x00,
    /// The id'd packet is missing; retransmit it now.
    Request = 0x01,
}

impl AckKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Recv),
            0x01 => Some(Self::Request),
            _ => None,
        }
    }
}

// =============================================================================
// NETWORK ADDRESSES
// =============================================================================

/// Transport endpoint, packed on the wire as
/// `[family:1][addr:4|16][port:2 BE]` with family 0x04 or 0x06.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Packed size for this address family.
    pub fn packed_len(&self) -> usize {
        match self.ip {
            IpAddr::V4(_) => 1 + 4 + 2,
            IpAddr::V6(_) => 1 + 16 + 2,
        }
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        match self.ip {
            IpAddr::V4(ip) => {
                out.push(0x04);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(0x06);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Returns the address and the number of bytes consumed.
    pub fn unpack(data: &[u8]) -> Option<(Self, usize)> {
        match *data.first()? {
            0x04 => {
                let octets: [u8; 4] = data.get(1..5)?.try_into().ok()?;
                let port = u16::from_be_bytes(data.get(5..7)?.try_into().ok()?);
                Some((Self::new(IpAddr::V4(Ipv4Addr::from(octets)), port), 7))
            }
            0x06 => {
                let octets: [u8; 16] = data.get(1..17)?.try_into().ok()?;
                let port = u16::from_be_bytes(data.get(17..19)?.try_into().ok()?);
                Some((Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port), 19))
            }
            _ => None,
        }
    }
}

/// A DHT node candidate: public key plus endpoint.
/// Packed as `[public_key:32][ip_port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub ip_port: IpPort,
}

impl NodeInfo {
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
        self.ip_port.pack(out);
    }

    pub fn unpack(data: &[u8]) -> Option<(Self, usize)> {
        let public_key: [u8; PUBLIC_KEY_SIZE] = data.get(..PUBLIC_KEY_SIZE)?.try_into().ok()?;
        let (ip_port, used) = IpPort::unpack(&data[PUBLIC_KEY_SIZE..])?;
        Some((Self { public_key, ip_port }, PUBLIC_KEY_SIZE + used))
    }
}

/// A TCP relay a peer can be reached through. Same wire shape as a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRelay {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub ip_port: IpPort,
}

impl TcpRelay {
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
        self.ip_port.pack(out);
    }

    pub fn unpack(data: &[u8]) -> Option<(Self, usize)> {
        let public_key: [u8; PUBLIC_KEY_SIZE] = data.get(..PUBLIC_KEY_SIZE)?.try_into().ok()?;
        let (ip_port, used) = IpPort::unpack(&data[PUBLIC_KEY_SIZE..])?;
        Some((Self { public_key, ip_port }, PUBLIC_KEY_SIZE + used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_port_pack_roundtrip() {
        let v4 = IpPort::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 33445);
        let mut buf = Vec::new();
        v4.pack(&mut buf);
        assert_eq!(buf.len(), v4.packed_len());
        let (back, used) = IpPort::unpack(&buf).unwrap();
        assert_eq!(back, v4);
        assert_eq!(used, buf.len());

        let v6 = IpPort::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
        let mut buf = Vec::new();
        v6.pack(&mut buf);
        let (back, used) = IpPort::unpack(&buf).unwrap();
        assert_eq!(back, v6);
        assert_eq!(used, 19);
    }

    #[test]
    fn test_ip_port_unpack_rejects_garbage() {
        assert!(IpPort::unpack(&[]).is_none());
        assert!(IpPort::unpack(&[0x05, 1, 2, 3, 4, 0, 80]).is_none());
        assert!(IpPort::unpack(&[0x04, 1, 2]).is_none());
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Founder < Role::Moderator);
        assert!(Role::Moderator < Role::User);
        assert!(Role::User < Role::Observer);
    }

    #[test]
    fn test_wire_enum_conversions() {
        for v in 0..=4u8 {
            if let Some(e) = ModEvent::from_u8(v) {
                assert_eq!(e as u8, v);
            } else {
                assert!(v > 3);
            }
        }
        assert_eq!(AckKind::from_u8(0), Some(AckKind::Recv));
        assert_eq!(AckKind::from_u8(1), Some(AckKind::Request));
        assert_eq!(AckKind::from_u8(2), None);
        assert_eq!(PrivacyState::from_u8(1), Some(PrivacyState::Private));
        assert_eq!(TopicLock::from_u8(9), None);
    }

    #[test]
    fn test_confirmed_timeout_relation() {
        // The confirmed timeout must span several missed pings.
        assert!(CONFIRMED_PEER_TIMEOUT_MS > PING_INTERVAL_MS * 4);
        assert_eq!(UNCONFIRMED_PEER_TIMEOUT_MS, PING_INTERVAL_MS);
    }
}
