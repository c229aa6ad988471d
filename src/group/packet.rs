//! Group-channel packet framing and payload codecs.
//!
//! Every on-wire group packet is
//!
//! ```text
//! [ net_type:1 ][ sender_enc_pk:32 ][ nonce:24 ][ seal(shared_key, nonce, plaintext) ]
//! ```
//!
//! where `plaintext` starts with a one-byte packet type, followed for
//! lossless types by a big-endian 64-bit message id, then the body.
//! Packet decoding is a closed enumeration over the type byte; there is no
//! dynamic dispatch anywhere in the path.

use super::types::{
    AckKind, IpPort, TcpRelay, MAC_SIZE, MAX_ANNOUNCED_TCP_RELAYS, MAX_MESSAGE_LEN, MAX_NICK_LEN,
    MAX_PASSWORD_LEN, NONCE_SIZE, PUBLIC_KEY_SIZE,
};
use crate::crypto::{self, CryptoError, SessionKey};

// =============================================================================
// OUTER PACKET IDENTIFIERS
// =============================================================================

/// Outer net-type byte for lossless group packets.
pub const NET_PACKET_GROUP_LOSSLESS: u8 = 0x5b;

/// Outer net-type byte for lossy group packets.
pub const NET_PACKET_GROUP_LOSSY: u8 = 0x5c;

/// Smallest parsable lossy frame: header plus an empty sealed body.
pub const MIN_LOSSY_PACKET_SIZE: usize = 1 + PUBLIC_KEY_SIZE + NONCE_SIZE + MAC_SIZE + 1;

/// Lossless frames additionally carry the 8-byte message id.
pub const MIN_LOSSLESS_PACKET_SIZE: usize = MIN_LOSSY_PACKET_SIZE + 8;

/// Upper bound on any group frame; anything larger is dropped unread.
/// Sized for the largest legal payloads: a full moderator list
/// (128 keys) and a full sync response (32 peers with relays).
pub const MAX_GROUP_PACKET_SIZE: usize = 8192;

// =============================================================================
// GROUP PACKET TYPES
// =============================================================================

/// Group packet types. IDs 0x01-0x03 are lossy, 0xf0-0xff lossless;
/// id 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupPacketType {
    // lossy
    Ping = 0x01,
    MessageAck = 0x02,
    InviteResponseReject = 0x03,

    // lossless
    KeyRotation = 0xf0,
    TcpRelays = 0xf1,
    CustomPacket = 0xf2,
    Broadcast = 0xf3,
    PeerInfoRequest = 0xf4,
    PeerInfoResponse = 0xf5,
    InviteRequest = 0xf6,
    InviteResponse = 0xf7,
    SyncRequest = 0xf8,
    SyncResponse = 0xf9,
    Topic = 0xfa,
    SharedState = 0xfb,
    ModList = 0xfc,
    SanctionsList = 0xfd,
    FriendInvite = 0xfe,
    HsResponseAck = 0xff,
}

impl GroupPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::MessageAck),
            0x03 => Some(Self::InviteResponseReject),
            0xf0 => Some(Self::KeyRotation),
            0xf1 => Some(Self::TcpRelays),
            0xf2 => Some(Self::CustomPacket),
            0xf3 => Some(Self::Broadcast),
            0xf4 => Some(Self::PeerInfoRequest),
            0xf5 => Some(Self::PeerInfoResponse),
            0xf6 => Some(Self::InviteRequest),
            0xf7 => Some(Self::InviteResponse),
            0xf8 => Some(Self::SyncRequest),
            0xf9 => Some(Self::SyncResponse),
            0xfa => Some(Self::Topic),
            0xfb => Some(Self::SharedState),
            0xfc => Some(Self::ModList),
            0xfd => Some(Self::SanctionsList),
            0xfe => Some(Self::FriendInvite),
            0xff => Some(Self::HsResponseAck),
            _ => None,
        }
    }

    pub fn is_lossless(self) -> bool {
        (self as u8) >= 0xf0
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::MessageAck => "message_ack",
            Self::InviteResponseReject => "invite_response_reject",
            Self::KeyRotation => "key_rotation",
            Self::TcpRelays => "tcp_relays",
            Self::CustomPacket => "custom_packet",
            Self::Broadcast => "broadcast",
            Self::PeerInfoRequest => "peer_info_request",
            Self::PeerInfoResponse => "peer_info_response",
            Self::InviteRequest => "invite_request",
            Self::InviteResponse => "invite_response",
            Self::SyncRequest => "sync_request",
            Self::SyncResponse => "sync_response",
            Self::Topic => "topic",
            Self::SharedState => "shared_state",
            Self::ModList => "mod_list",
            Self::SanctionsList => "sanctions_list",
            Self::FriendInvite => "friend_invite",
            Self::HsResponseAck => "hs_response_ack",
        }
    }
}

/// Broadcast sub-types carried inside `Broadcast` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BroadcastKind {
    Status = 0x00,
    Nick = 0x01,
    PlainMessage = 0x02,
    ActionMessage = 0x03,
    PrivateMessage = 0x04,
    PeerExit = 0x05,
    KickPeer = 0x06,
    SetMod = 0x07,
    SetObserver = 0x08,
}

impl BroadcastKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Status),
            0x01 => Some(Self::Nick),
            0x02 => Some(Self::PlainMessage),
            0x03 => Some(Self::ActionMessage),
            0x04 => Some(Self::PrivateMessage),
            0x05 => Some(Self::PeerExit),
            0x06 => Some(Self::KickPeer),
            0x07 => Some(Self::SetMod),
            0x08 => Some(Self::SetObserver),
            _ => None,
        }
    }
}

// =============================================================================
// FRAMING
// =============================================================================

/// Decoded outer frame; the ciphertext is still sealed because the shared
/// key is only known once the sender is looked up in the roster.
pub struct FrameHeader<'a> {
    pub net_type: u8,
    pub sender_enc_pk: [u8; PUBLIC_KEY_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: &'a [u8],
}

/// Decrypted plaintext split into its parts.
pub struct PlainPacket<'a> {
    pub packet_type: GroupPacketType,
    /// Present iff the packet type is lossless.
    pub message_id: Option<u64>,
    pub body: &'a [u8],
}

/// Builds a complete group frame: seals the typed plaintext under a fresh
/// random nonce with the per-peer shared key.
pub fn wrap(
    self_enc_pk: &[u8; PUBLIC_KEY_SIZE],
    shared_key: &SessionKey,
    packet_type: GroupPacketType,
    message_id: Option<u64>,
    body: &[u8],
) -> Vec<u8> {
    // The channel follows the id: custom packets may travel either way,
    // every other type is pinned to its class.
    debug_assert!(
        packet_type == GroupPacketType::CustomPacket
            || packet_type.is_lossless() == message_id.is_some()
    );

    let mut plain = Vec::with_capacity(1 + 8 + body.len());
    plain.push(packet_type as u8);
    if let Some(id) = message_id {
        plain.extend_from_slice(&id.to_be_bytes());
    }
    plain.extend_from_slice(body);

    let nonce = crypto::random_nonce();
    let sealed = crypto::seal(shared_key, &nonce, &plain);

    let net_type = if message_id.is_some() {
        NET_PACKET_GROUP_LOSSLESS
    } else {
        NET_PACKET_GROUP_LOSSY
    };

    let mut packet = Vec::with_capacity(1 + PUBLIC_KEY_SIZE + NONCE_SIZE + sealed.len());
    packet.push(net_type);
    packet.extend_from_slice(self_enc_pk);
    packet.extend_from_slice(&nonce);
    packet.extend_from_slice(&sealed);
    packet
}

/// Splits a raw datagram into its frame parts without decrypting.
pub fn parse_header(packet: &[u8]) -> Option<FrameHeader<'_>> {
    if packet.len() < MIN_LOSSY_PACKET_SIZE || packet.len() > MAX_GROUP_PACKET_SIZE {
        return None;
    }
    let net_type = packet[0];
    if net_type != NET_PACKET_GROUP_LOSSLESS && net_type != NET_PACKET_GROUP_LOSSY {
        return None;
    }
    let sender_enc_pk: [u8; PUBLIC_KEY_SIZE] = packet.get(1..1 + PUBLIC_KEY_SIZE)?.try_into().ok()?;
    let nonce_start = 1 + PUBLIC_KEY_SIZE;
    let nonce: [u8; NONCE_SIZE] = packet.get(nonce_start..nonce_start + NONCE_SIZE)?.try_into().ok()?;
    Some(FrameHeader {
        net_type,
        sender_enc_pk,
        nonce,
        ciphertext: &packet[nonce_start + NONCE_SIZE..],
    })
}

/// Opens a frame's ciphertext and splits the plaintext. The message id is
/// required for lossless net types and forbidden for lossy ones; a mismatch
/// between the outer net type and the inner packet type is rejected.
pub fn open_frame<'a>(
    header: &FrameHeader<'_>,
    shared_key: &SessionKey,
    plain_buf: &'a mut Vec<u8>,
) -> Result<PlainPacket<'a>, CryptoError> {
    *plain_buf = crypto::open(shared_key, &header.nonce, header.ciphertext)?;
    let packet_type = plain_buf
        .first()
        .and_then(|b| GroupPacketType::from_u8(*b))
        .ok_or(CryptoError::Decrypt)?;

    let lossless_frame = header.net_type == NET_PACKET_GROUP_LOSSLESS;
    // Custom packets are the one type allowed on both channels.
    if packet_type != GroupPacketType::CustomPacket && packet_type.is_lossless() != lossless_frame {
        return Err(CryptoError::Decrypt);
    }

    if lossless_frame {
        let id_bytes: [u8; 8] = plain_buf
            .get(1..9)
            .and_then(|s| s.try_into().ok())
            .ok_or(CryptoError::Decrypt)?;
        Ok(PlainPacket {
            packet_type,
            message_id: Some(u64::from_be_bytes(id_bytes)),
            body: &plain_buf[9..],
        })
    } else {
        Ok(PlainPacket {
            packet_type,
            message_id: None,
            body: &plain_buf[1..],
        })
    }
}

// =============================================================================
// SIMPLE PAYLOAD CODECS
// =============================================================================
// Signed state payloads (shared state, mod list, sanctions, topic) live in
// shared_state.rs next to their verification logic.

/// Ping body: `[ip_port_present:1][ip_port?]`.
pub fn pack_ping(announced: Option<&IpPort>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + announced.map_or(0, |a| a.packed_len()));
    match announced {
        Some(ip_port) => {
            out.push(1);
            ip_port.pack(&mut out);
        }
        None => out.push(0),
    }
    out
}

pub fn unpack_ping(body: &[u8]) -> Option<Option<IpPort>> {
    match *body.first()? {
        0 => Some(None),
        1 => {
            let (ip_port, _) = IpPort::unpack(&body[1..])?;
            Some(Some(ip_port))
        }
        _ => None,
    }
}

/// Message ack body: `[kind:1][message_id:8 BE]`.
pub fn pack_message_ack(kind: AckKind, message_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(kind as u8);
    out.extend_from_slice(&message_id.to_be_bytes());
    out
}

pub fn unpack_message_ack(body: &[u8]) -> Option<(AckKind, u64)> {
    if body.len() != 9 {
        return None;
    }
    let kind = AckKind::from_u8(body[0])?;
    let id = u64::from_be_bytes(body[1..9].try_into().ok()?);
    Some((kind, id))
}

/// Key rotation body: `[is_response:1][new_session_pk:32]`.
pub fn pack_key_rotation(is_response: bool, new_pk: &[u8; PUBLIC_KEY_SIZE]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + PUBLIC_KEY_SIZE);
    out.push(u8::from(is_response));
    out.extend_from_slice(new_pk);
    out
}

pub fn unpack_key_rotation(body: &[u8]) -> Option<(bool, [u8; PUBLIC_KEY_SIZE])> {
    if body.len() != 1 + PUBLIC_KEY_SIZE || body[0] > 1 {
        return None;
    }
    let pk: [u8; PUBLIC_KEY_SIZE] = body[1..].try_into().ok()?;
    Some((body[0] == 1, pk))
}

/// TCP relays body: `[count:1][relay...]`.
pub fn pack_tcp_relays(relays: &[TcpRelay]) -> Vec<u8> {
    let count = relays.len().min(MAX_ANNOUNCED_TCP_RELAYS);
    let mut out = vec![count as u8];
    for relay in &relays[..count] {
        relay.pack(&mut out);
    }
    out
}

pub fn unpack_tcp_relays(body: &[u8]) -> Option<Vec<TcpRelay>> {
    let count = *body.first()? as usize;
    if count > MAX_ANNOUNCED_TCP_RELAYS {
        return None;
    }
    let mut relays = Vec::with_capacity(count);
    let mut offset = 1;
    for _ in 0..count {
        let (relay, used) = TcpRelay::unpack(&body[offset..])?;
        relays.push(relay);
        offset += used;
    }
    Some(relays)
}

/// Broadcast body: `[kind:1][timestamp:8 BE][payload]`.
pub fn pack_broadcast(kind: BroadcastKind, timestamp_ms: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn unpack_broadcast(body: &[u8]) -> Option<(BroadcastKind, u64, &[u8])> {
    if body.len() < 9 {
        return None;
    }
    let kind = BroadcastKind::from_u8(body[0])?;
    let timestamp = u64::from_be_bytes(body[1..9].try_into().ok()?);
    Some((kind, timestamp, &body[9..]))
}

/// Peer info response body: `[nick_len:2 BE][nick][status:1]`.
pub fn pack_peer_info(nick: &[u8], status: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + nick.len() + 1);
    out.extend_from_slice(&(nick.len() as u16).to_be_bytes());
    out.extend_from_slice(nick);
    out.push(status);
    out
}

pub fn unpack_peer_info(body: &[u8]) -> Option<(Vec<u8>, u8)> {
    let nick_len = u16::from_be_bytes(body.get(..2)?.try_into().ok()?) as usize;
    if nick_len > MAX_NICK_LEN {
        return None;
    }
    let nick = body.get(2..2 + nick_len)?.to_vec();
    let status = *body.get(2 + nick_len)?;
    if body.len() != 2 + nick_len + 1 {
        return None;
    }
    Some((nick, status))
}

/// Invite request body:
/// `[sign_pk:32][nick_len:2 BE][nick][password_len:2 BE][password]`.
/// The sender's encryption key is already in the frame header; the signing
/// key completes the extended identity and feeds role derivation.
pub fn pack_invite_request(sign_pk: &[u8; PUBLIC_KEY_SIZE], nick: &[u8], password: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PUBLIC_KEY_SIZE + 4 + nick.len() + password.len());
    out.extend_from_slice(sign_pk);
    out.extend_from_slice(&(nick.len() as u16).to_be_bytes());
    out.extend_from_slice(nick);
    out.extend_from_slice(&(password.len() as u16).to_be_bytes());
    out.extend_from_slice(password);
    out
}

pub fn unpack_invite_request(body: &[u8]) -> Option<([u8; PUBLIC_KEY_SIZE], Vec<u8>, Vec<u8>)> {
    let sign_pk: [u8; PUBLIC_KEY_SIZE] = body.get(..PUBLIC_KEY_SIZE)?.try_into().ok()?;
    let mut offset = PUBLIC_KEY_SIZE;
    let nick_len = u16::from_be_bytes(body.get(offset..offset + 2)?.try_into().ok()?) as usize;
    if nick_len == 0 || nick_len > MAX_NICK_LEN {
        return None;
    }
    offset += 2;
    let nick = body.get(offset..offset + nick_len)?.to_vec();
    offset += nick_len;
    let pw_len = u16::from_be_bytes(body.get(offset..offset + 2)?.try_into().ok()?) as usize;
    if pw_len > MAX_PASSWORD_LEN {
        return None;
    }
    offset += 2;
    let password = body.get(offset..offset + pw_len)?.to_vec();
    if body.len() != offset + pw_len {
        return None;
    }
    Some((sign_pk, nick, password))
}

/// Invite response body: `[sign_pk:32]`. Completes the responder's extended
/// identity on the initiator side.
pub fn pack_invite_response(sign_pk: &[u8; PUBLIC_KEY_SIZE]) -> Vec<u8> {
    sign_pk.to_vec()
}

pub fn unpack_invite_response(body: &[u8]) -> Option<[u8; PUBLIC_KEY_SIZE]> {
    body.try_into().ok()
}

/// Sync request body: local versions for each piece of shared state,
/// `[state:4][mods:4][sanctions:4][topic:4]`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncVersions {
    pub state: u32,
    pub mods: u32,
    pub sanctions: u32,
    pub topic: u32,
}

pub fn pack_sync_request(versions: &SyncVersions) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&versions.state.to_be_bytes());
    out.extend_from_slice(&versions.mods.to_be_bytes());
    out.extend_from_slice(&versions.sanctions.to_be_bytes());
    out.extend_from_slice(&versions.topic.to_be_bytes());
    out
}

pub fn unpack_sync_request(body: &[u8]) -> Option<SyncVersions> {
    if body.len() != 16 {
        return None;
    }
    Some(SyncVersions {
        state: u32::from_be_bytes(body[0..4].try_into().ok()?),
        mods: u32::from_be_bytes(body[4..8].try_into().ok()?),
        sanctions: u32::from_be_bytes(body[8..12].try_into().ok()?),
        topic: u32::from_be_bytes(body[12..16].try_into().ok()?),
    })
}

/// One known peer in a sync response:
/// `[enc_pk:32][sign_pk:32][ip_present:1][ip_port?][relay_count:1][relays]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPeerEntry {
    pub enc_pk: [u8; PUBLIC_KEY_SIZE],
    pub sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub ip_port: Option<IpPort>,
    pub tcp_relays: Vec<TcpRelay>,
}

pub fn pack_sync_response(peers: &[SyncPeerEntry]) -> Vec<u8> {
    let mut out = vec![peers.len() as u8];
    for peer in peers {
        out.extend_from_slice(&peer.enc_pk);
        out.extend_from_slice(&peer.sign_pk);
        match peer.ip_port {
            Some(ip_port) => {
                out.push(1);
                ip_port.pack(&mut out);
            }
            None => out.push(0),
        }
        let relay_count = peer.tcp_relays.len().min(MAX_ANNOUNCED_TCP_RELAYS);
        out.push(relay_count as u8);
        for relay in &peer.tcp_relays[..relay_count] {
            relay.pack(&mut out);
        }
    }
    out
}

pub fn unpack_sync_response(body: &[u8]) -> Option<Vec<SyncPeerEntry>> {
    let count = *body.first()? as usize;
    let mut peers = Vec::with_capacity(count);
    let mut offset = 1;
    for _ in 0..count {
        let enc_pk: [u8; PUBLIC_KEY_SIZE] =
            body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let sign_pk: [u8; PUBLIC_KEY_SIZE] =
            body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let ip_port = match *body.get(offset)? {
            0 => {
                offset += 1;
                None
            }
            1 => {
                offset += 1;
                let (ip_port, used) = IpPort::unpack(body.get(offset..)?)?;
                offset += used;
                Some(ip_port)
            }
            _ => return None,
        };
        let relay_count = *body.get(offset)? as usize;
        if relay_count > MAX_ANNOUNCED_TCP_RELAYS {
            return None;
        }
        offset += 1;
        let mut tcp_relays = Vec::with_capacity(relay_count);
        for _ in 0..relay_count {
            let (relay, used) = TcpRelay::unpack(body.get(offset..)?)?;
            tcp_relays.push(relay);
            offset += used;
        }
        peers.push(SyncPeerEntry { enc_pk, sign_pk, ip_port, tcp_relays });
    }
    if offset != body.len() {
        return None;
    }
    Some(peers)
}

/// Private message broadcast payload: `[kind:1][message]`.
pub fn pack_private_message(kind: u8, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + message.len());
    out.push(kind);
    out.extend_from_slice(message);
    out
}

pub fn unpack_private_message(payload: &[u8]) -> Option<(u8, &[u8])> {
    if payload.len() < 2 || payload.len() > 1 + MAX_MESSAGE_LEN {
        return None;
    }
    Some((payload[0], &payload[1..]))
}
