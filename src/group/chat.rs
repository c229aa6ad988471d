//! Per-group state machine: handshake, lossless dispatch, broadcasts,
//! shared-state adoption and moderation.
//!
//! A `Chat` owns its roster, adopted state and self identity. It never
//! touches a socket: outbound frames accumulate in an internal queue which
//! the session manager drains into the transport collaborator, and every
//! user-visible occurrence goes through the event sink passed into each
//! entry point. Handlers run to completion; nothing here suspends.

use super::events::{EventSink, GroupEvent};
use super::lossless::RecvOutcome;
use super::manager::{
    FounderSetError, KickPeerError, ModSetRoleError, SelfNickError, SendMessageError,
    ToggleIgnoreError, TopicSetError,
};
use super::packet::{self, BroadcastKind, GroupPacketType, SyncPeerEntry, SyncVersions};
use super::peer::{PeerHandle, PeerList, PeerRecord};
use super::shared_state::{
    derive_role, ModList, ModerationEvent, SanctionEntry, SanctionsList, SharedState, TopicInfo,
};
use super::types::*;
use crate::crypto::{self, ExtendedKeyPair};
use tracing::{debug, warn};
use zeroize::Zeroize;

/// A frame ready for the transport, with its route already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Udp { dest: IpPort, packet: Vec<u8> },
    TcpRelay { relay: TcpRelay, dest_enc_pk: [u8; PUBLIC_KEY_SIZE], packet: Vec<u8> },
}

/// One joined group.
pub struct Chat {
    pub group_id: GroupId,
    pub chat_id: ChatId,
    /// Fresh per-group extended identity; for the founder its signing key
    /// doubles as the chat ID.
    pub keypair: ExtendedKeyPair,

    pub self_nick: Vec<u8>,
    pub self_status: PeerStatus,
    /// Password supplied on join; replaced by the adopted state's password.
    pub join_password: Vec<u8>,

    pub shared_state: SharedState,
    pub mod_list: ModList,
    pub sanctions: SanctionsList,
    pub topic: TopicInfo,

    pub peers: PeerList,
    pub connection_state: ConnectionState,

    /// Our reachability, advertised in pings, announces and invites.
    pub self_ip_port: Option<IpPort>,
    pub self_tcp_relays: Vec<TcpRelay>,

    pub last_announce_ms: u64,
    pub last_search_ms: u64,

    outbound: Vec<OutboundFrame>,
}

impl Drop for Chat {
    fn drop(&mut self) {
        self.join_password.zeroize();
    }
}

impl Chat {
    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// Founds a new group. The fresh signing public key becomes the chat ID
    /// and the shared state starts at version 1, founder-signed.
    pub fn new_founded(
        group_id: GroupId,
        privacy: PrivacyState,
        group_name: Vec<u8>,
        self_nick: Vec<u8>,
    ) -> Self {
        let keypair = ExtendedKeyPair::generate();
        let chat_id = keypair.sign_public_key();
        let shared_state = SharedState::new_founded(&keypair, group_name, privacy, 512);
        Self {
            group_id,
            chat_id,
            keypair,
            self_nick,
            self_status: PeerStatus::None,
            join_password: Vec::new(),
            shared_state,
            mod_list: ModList::default(),
            sanctions: SanctionsList::default(),
            topic: TopicInfo::default(),
            peers: PeerList::new(),
            connection_state: ConnectionState::Connecting,
            self_ip_port: None,
            self_tcp_relays: Vec::new(),
            last_announce_ms: 0,
            last_search_ms: 0,
            outbound: Vec::new(),
        }
    }

    /// Joins an existing group by chat ID with a fresh per-group identity.
    pub fn new_joining(group_id: GroupId, chat_id: ChatId, self_nick: Vec<u8>, password: Vec<u8>) -> Self {
        Self {
            group_id,
            chat_id,
            keypair: ExtendedKeyPair::generate(),
            self_nick,
            self_status: PeerStatus::None,
            join_password: password,
            shared_state: SharedState::new_joining(chat_id),
            mod_list: ModList::default(),
            sanctions: SanctionsList::default(),
            topic: TopicInfo::default(),
            peers: PeerList::new(),
            connection_state: ConnectionState::Connecting,
            self_ip_port: None,
            self_tcp_relays: Vec::new(),
            last_announce_ms: 0,
            last_search_ms: 0,
            outbound: Vec::new(),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn is_founder(&self) -> bool {
        crypto::pk_equal(&self.keypair.sign_public_key(), &self.chat_id)
    }

    pub fn self_role(&self) -> Role {
        derive_role(&self.keypair.sign_public_key(), &self.chat_id, &self.mod_list, &self.sanctions)
    }

    pub fn peer_role(&self, handle: PeerHandle) -> Option<Role> {
        let peer = self.peers.get(handle)?;
        Some(derive_role(&peer.sign_pk, &self.chat_id, &self.mod_list, &self.sanctions))
    }

    fn sync_versions(&self) -> SyncVersions {
        SyncVersions {
            state: self.shared_state.version,
            mods: self.mod_list.version,
            sanctions: self.sanctions.credentials.version,
            topic: self.topic.version,
        }
    }

    /// Drains the frames queued since the last call.
    pub fn take_outbound(&mut self) -> Vec<OutboundFrame> {
        std::mem::take(&mut self.outbound)
    }

    // =========================================================================
    // WIRE HELPERS
    // =========================================================================

    fn route_to_peer(&mut self, handle: PeerHandle, wire: Vec<u8>, now_ms: u64) {
        let Some(peer) = self.peers.get(handle) else { return };
        let frame = match peer.connection.preferred_transport(now_ms) {
            Transport::Udp => peer.connection.ip_port.map(|dest| OutboundFrame::Udp { dest, packet: wire }),
            Transport::Tcp => peer.connection.tcp_relays.first().map(|relay| OutboundFrame::TcpRelay {
                relay: *relay,
                dest_enc_pk: peer.enc_pk,
                packet: wire,
            }),
            Transport::None => None,
        };
        match frame {
            Some(frame) => self.outbound.push(frame),
            None => debug!("no route to peer {}", crypto::fingerprint(&self.peers.get(handle).map(|p| p.enc_pk).unwrap_or_default())),
        }
    }

    /// Frames, enqueues and emits one lossless packet. Fails when the
    /// peer's send queue is full.
    fn send_lossless_to(
        &mut self,
        handle: PeerHandle,
        packet_type: GroupPacketType,
        body: &[u8],
        now_ms: u64,
    ) -> Result<(), ()> {
        let self_pk = *self.keypair.enc_public_key();
        let wire = {
            let Some(peer) = self.peers.get_mut(handle) else { return Err(()) };
            if peer.send_queue.is_full() {
                return Err(());
            }
            let id = peer.send_queue.next_message_id();
            let wire = packet::wrap(&self_pk, &peer.session_key, packet_type, Some(id), body);
            // Cannot fail: fullness was checked above.
            let _ = peer.send_queue.push(packet_type, wire.clone(), now_ms);
            wire
        };
        self.route_to_peer(handle, wire, now_ms);
        Ok(())
    }

    fn send_lossy_to(&mut self, handle: PeerHandle, packet_type: GroupPacketType, body: &[u8], now_ms: u64) {
        let self_pk = *self.keypair.enc_public_key();
        let Some(peer) = self.peers.get(handle) else { return };
        let wire = packet::wrap(&self_pk, &peer.session_key, packet_type, None, body);
        self.route_to_peer(handle, wire, now_ms);
    }

    /// Sends a lossless packet to every confirmed peer. Returns how many
    /// peers accepted it into their queue.
    fn broadcast_lossless(&mut self, packet_type: GroupPacketType, body: &[u8], now_ms: u64) -> usize {
        let handles: Vec<PeerHandle> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_confirmed())
            .map(|(h, _)| h)
            .collect();
        let mut sent = 0;
        for handle in handles {
            if self.send_lossless_to(handle, packet_type, body, now_ms).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn broadcast_kind(&mut self, kind: BroadcastKind, payload: &[u8], now_ms: u64) -> usize {
        let body = packet::pack_broadcast(kind, now_ms, payload);
        self.broadcast_lossless(GroupPacketType::Broadcast, &body, now_ms)
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    /// Creates an outgoing peer and sends the invite request. No-op when
    /// the peer is already known or is ourselves.
    pub fn initiate_handshake(
        &mut self,
        enc_pk: [u8; PUBLIC_KEY_SIZE],
        sign_pk: [u8; PUBLIC_KEY_SIZE],
        ip_port: Option<IpPort>,
        tcp_relays: &[TcpRelay],
        now_ms: u64,
    ) {
        if crypto::pk_equal(&enc_pk, self.keypair.enc_public_key()) {
            return;
        }
        if self.peers.find_by_enc_pk(&enc_pk).is_some() {
            return;
        }
        let Ok(session_key) = self.keypair.derive_session_key(&enc_pk) else {
            return;
        };
        let mut record = PeerRecord::new(enc_pk, sign_pk, session_key, now_ms);
        record.handshake = HandshakeState::Sent;
        record.connection.ip_port = ip_port;
        record.connection.add_relays(tcp_relays);
        let Some(handle) = self.peers.insert(record) else { return };

        let body = packet::pack_invite_request(
            &self.keypair.sign_public_key(),
            &self.self_nick.clone(),
            &self.join_password.clone(),
        );
        let _ = self.send_lossless_to(handle, GroupPacketType::InviteRequest, &body, now_ms);
    }

    /// Marks a peer confirmed, fires events and kicks off reconciliation.
    fn confirm_peer(&mut self, handle: PeerHandle, now_ms: u64, sink: &mut dyn EventSink) {
        let peer_id = {
            let Some(peer) = self.peers.get_mut(handle) else { return };
            peer.handshake = HandshakeState::Confirmed;
            peer.pending_sync = super::peer::PendingSync::all();
            peer.pending_sync.last_request_ms = now_ms;
            peer.peer_id
        };

        let _ = self.send_lossless_to(handle, GroupPacketType::PeerInfoRequest, &[], now_ms);
        let sync_body = packet::pack_sync_request(&self.sync_versions());
        let _ = self.send_lossless_to(handle, GroupPacketType::SyncRequest, &sync_body, now_ms);
        if !self.self_tcp_relays.is_empty() {
            let relays = packet::pack_tcp_relays(&self.self_tcp_relays.clone());
            let _ = self.send_lossless_to(handle, GroupPacketType::TcpRelays, &relays, now_ms);
        }

        sink.on_event(self.group_id, GroupEvent::PeerJoin { peer_id });
        if self.connection_state != ConnectionState::Connected {
            self.connection_state = ConnectionState::Connected;
            sink.on_event(self.group_id, GroupEvent::SelfJoin);
        }
    }

    /// First contact from an unknown key: only a valid invite request sealed
    /// with the pairwise derived key is admitted. Returns true when the
    /// frame was addressed to this group (it opened under our key).
    fn handle_new_peer_packet(
        &mut self,
        header: &packet::FrameHeader<'_>,
        transport: Transport,
        source: Option<IpPort>,
        now_ms: u64,
        _sink: &mut dyn EventSink,
    ) -> bool {
        let Ok(session_key) = self.keypair.derive_session_key(&header.sender_enc_pk) else {
            return false;
        };
        let mut buf = Vec::new();
        let Ok(plain) = packet::open_frame(header, &session_key, &mut buf) else {
            // Not for this group, or garbage. Either way, silence.
            return false;
        };
        if plain.packet_type != GroupPacketType::InviteRequest || plain.message_id != Some(1) {
            debug!("unknown peer sent {} before handshake", plain.packet_type.name());
            return true;
        }
        let Some((sign_pk, nick, password)) = packet::unpack_invite_request(plain.body) else {
            warn!("malformed invite request from {}", crypto::fingerprint(&header.sender_enc_pk));
            return true;
        };

        // Admission checks. Rejections are lossy and carry only the code.
        let reject = if self.peers.confirmed_count() + 1 >= self.shared_state.peer_limit as usize {
            Some(JoinRejected::GroupFull)
        } else if self.shared_state.has_password() && password != self.shared_state.password {
            Some(JoinRejected::InvalidPassword)
        } else {
            None
        };
        if let Some(code) = reject {
            let wire = packet::wrap(
                self.keypair.enc_public_key(),
                &session_key,
                GroupPacketType::InviteResponseReject,
                None,
                &[code as u8],
            );
            if let Some(dest) = source {
                self.outbound.push(OutboundFrame::Udp { dest, packet: wire });
            }
            return true;
        }

        let mut record = PeerRecord::new(header.sender_enc_pk, sign_pk, session_key, now_ms);
        record.handshake = HandshakeState::Responding;
        record.nick = nick;
        record.connection.ip_port = source;
        record.on_packet_received(transport, now_ms);
        let Some(handle) = self.peers.insert(record) else { return true };

        // Run the invite request through the lossless queue so the ack and
        // ordering behavior match every other lossless packet.
        let outcome = {
            let Some(peer) = self.peers.get_mut(handle) else { return true };
            peer.recv_queue.receive(1, GroupPacketType::InviteRequest, Vec::new())
        };
        if matches!(outcome, RecvOutcome::Deliver(_)) {
            self.send_lossy_to(handle, GroupPacketType::MessageAck, &packet::pack_message_ack(AckKind::Recv, 1), now_ms);
        }

        let response = packet::pack_invite_response(&self.keypair.sign_public_key());
        let _ = self.send_lossless_to(handle, GroupPacketType::InviteResponse, &response, now_ms);
        true
    }

    // =========================================================================
    // INBOUND DISPATCH
    // =========================================================================

    /// Feeds one raw datagram. Returns true when the packet belonged to
    /// this group, so the caller can stop trying other groups.
    pub fn handle_packet(
        &mut self,
        transport: Transport,
        source: Option<IpPort>,
        raw: &[u8],
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) -> bool {
        let Some(header) = packet::parse_header(raw) else {
            debug!("unparsable group frame ({} bytes)", raw.len());
            return false;
        };

        let Some(handle) = self.peers.find_by_enc_pk(&header.sender_enc_pk) else {
            return self.handle_new_peer_packet(&header, transport, source, now_ms, sink);
        };

        // Open with the current key, falling back to the pre-rotation key.
        let mut buf = Vec::new();
        let opened = {
            let Some(peer) = self.peers.get(handle) else { return false };
            let mut opened = packet::open_frame(&header, &peer.session_key, &mut buf)
                .map(|plain| (plain.packet_type, plain.message_id, plain.body.to_vec()));
            if opened.is_err() {
                if let Some(prev) = &peer.prev_session_key {
                    opened = packet::open_frame(&header, prev, &mut buf)
                        .map(|plain| (plain.packet_type, plain.message_id, plain.body.to_vec()));
                }
            }
            opened
        };

        let (packet_type, message_id, body) = match opened {
            Ok(parts) => parts,
            Err(_) => {
                let drop_peer = self
                    .peers
                    .get_mut(handle)
                    .is_some_and(|peer| peer.misbehaving("undecryptable packet"));
                if drop_peer {
                    self.remove_peer(handle, ExitType::SyncError, Vec::new(), now_ms, sink);
                }
                return true;
            }
        };

        if let Some(peer) = self.peers.get_mut(handle) {
            peer.on_packet_received(transport, now_ms);
            if transport == Transport::Udp {
                if let Some(addr) = source {
                    peer.connection.ip_port = Some(addr);
                }
            }
        }

        match message_id {
            Some(id) => self.receive_lossless(handle, id, packet_type, body, now_ms, sink),
            None => self.handle_lossy(handle, packet_type, &body, now_ms, sink),
        }
        true
    }

    fn receive_lossless(
        &mut self,
        handle: PeerHandle,
        message_id: u64,
        packet_type: GroupPacketType,
        body: Vec<u8>,
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) {
        let outcome = {
            let Some(peer) = self.peers.get_mut(handle) else { return };
            peer.recv_queue.receive(message_id, packet_type, body)
        };

        match outcome {
            RecvOutcome::Deliver(run) => {
                for (id, ptype, payload) in run {
                    self.send_lossy_to(
                        handle,
                        GroupPacketType::MessageAck,
                        &packet::pack_message_ack(AckKind::Recv, id),
                        now_ms,
                    );
                    self.deliver_lossless(handle, ptype, &payload, now_ms, sink);
                    // The handler may have removed the peer.
                    if self.peers.get(handle).is_none() {
                        return;
                    }
                }
            }
            RecvOutcome::Buffered => self.request_missing(handle, now_ms),
            RecvOutcome::Duplicate => {
                self.send_lossy_to(
                    handle,
                    GroupPacketType::MessageAck,
                    &packet::pack_message_ack(AckKind::Recv, message_id),
                    now_ms,
                );
            }
            RecvOutcome::Dropped => debug!("lossless packet {} outside window", message_id),
        }
    }

    /// Requests missing ids, at most one burst per peer per second.
    fn request_missing(&mut self, handle: PeerHandle, now_ms: u64) {
        let missing = {
            let Some(peer) = self.peers.get_mut(handle) else { return };
            if !peer.recv_queue.may_send_request(now_ms) {
                return;
            }
            let missing = peer.recv_queue.missing_ids(8);
            if !missing.is_empty() {
                peer.recv_queue.note_request_sent(now_ms);
            }
            missing
        };
        for id in missing {
            self.send_lossy_to(
                handle,
                GroupPacketType::MessageAck,
                &packet::pack_message_ack(AckKind::Request, id),
                now_ms,
            );
        }
    }

    fn handle_lossy(
        &mut self,
        handle: PeerHandle,
        packet_type: GroupPacketType,
        body: &[u8],
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) {
        match packet_type {
            GroupPacketType::Ping => {
                let Some(announced) = packet::unpack_ping(body) else {
                    self.note_misbehavior(handle, "malformed ping", now_ms, sink);
                    return;
                };
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.last_received_ping_ms = now_ms;
                    if let Some(addr) = announced {
                        peer.connection.ip_port = Some(addr);
                    }
                }
            }
            GroupPacketType::MessageAck => {
                let Some((kind, id)) = packet::unpack_message_ack(body) else {
                    self.note_misbehavior(handle, "malformed ack", now_ms, sink);
                    return;
                };
                match kind {
                    AckKind::Recv => {
                        if let Some(peer) = self.peers.get_mut(handle) {
                            peer.send_queue.ack(id);
                        }
                    }
                    AckKind::Request => {
                        let wire = self
                            .peers
                            .get_mut(handle)
                            .and_then(|peer| peer.send_queue.force_retransmit(id, now_ms));
                        if let Some(wire) = wire {
                            self.route_to_peer(handle, wire, now_ms);
                        }
                    }
                }
            }
            GroupPacketType::InviteResponseReject => {
                let fail = body
                    .first()
                    .and_then(|b| JoinRejected::from_u8(*b))
                    .map_or(JoinFail::Unknown, |code| match code {
                        JoinRejected::GroupFull => JoinFail::PeerLimit,
                        JoinRejected::InvalidPassword => JoinFail::InvalidPassword,
                        JoinRejected::InviteFailed | JoinRejected::Invalid => JoinFail::Unknown,
                    });
                sink.on_event(self.group_id, GroupEvent::JoinFail { fail_type: fail });
                self.peers.remove(handle);
            }
            GroupPacketType::CustomPacket => {
                let (peer_id, ignored) = match self.peers.get(handle) {
                    Some(peer) => (peer.peer_id, peer.ignored),
                    None => return,
                };
                if !ignored && !body.is_empty() && body.len() <= MAX_CUSTOM_PACKET_LEN {
                    sink.on_event(self.group_id, GroupEvent::CustomPacket { peer_id, data: body.to_vec() });
                }
            }
            _ => {
                self.note_misbehavior(handle, "lossless type on lossy channel", now_ms, sink);
            }
        }
    }

    fn note_misbehavior(&mut self, handle: PeerHandle, reason: &str, now_ms: u64, sink: &mut dyn EventSink) {
        let drop_peer = self.peers.get_mut(handle).is_some_and(|peer| peer.misbehaving(reason));
        if drop_peer {
            self.remove_peer(handle, ExitType::SyncError, Vec::new(), now_ms, sink);
        }
    }

    // =========================================================================
    // LOSSLESS HANDLERS
    // =========================================================================

    fn deliver_lossless(
        &mut self,
        handle: PeerHandle,
        packet_type: GroupPacketType,
        body: &[u8],
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) {
        match packet_type {
            GroupPacketType::InviteRequest => {
                // Already in the roster: either a crossed handshake (both
                // sides initiated) or a repeat. Repeats never reach here
                // (the receive queue deduplicates); on a cross, both sides
                // answer and confirm through the usual response path.
                let crossed = {
                    let Some(peer) = self.peers.get_mut(handle) else { return };
                    if peer.handshake != HandshakeState::Sent {
                        return;
                    }
                    if let Some((sign_pk, nick, _password)) = packet::unpack_invite_request(body) {
                        peer.sign_pk = sign_pk;
                        peer.nick = nick;
                        true
                    } else {
                        false
                    }
                };
                if crossed {
                    let response = packet::pack_invite_response(&self.keypair.sign_public_key());
                    let _ = self.send_lossless_to(handle, GroupPacketType::InviteResponse, &response, now_ms);
                }
            }
            GroupPacketType::InviteResponse => self.handle_invite_response(handle, body, now_ms, sink),
            GroupPacketType::HsResponseAck => self.handle_hs_response_ack(handle, now_ms, sink),
            GroupPacketType::KeyRotation => self.handle_key_rotation(handle, body, now_ms, sink),
            GroupPacketType::TcpRelays => {
                let Some(relays) = packet::unpack_tcp_relays(body) else {
                    self.note_misbehavior(handle, "malformed tcp relays", now_ms, sink);
                    return;
                };
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.connection.add_relays(&relays);
                }
            }
            GroupPacketType::CustomPacket => {
                let (peer_id, ignored) = match self.peers.get(handle) {
                    Some(peer) => (peer.peer_id, peer.ignored),
                    None => return,
                };
                if !ignored && !body.is_empty() && body.len() <= MAX_CUSTOM_PACKET_LEN {
                    sink.on_event(self.group_id, GroupEvent::CustomPacket { peer_id, data: body.to_vec() });
                }
            }
            GroupPacketType::Broadcast => self.handle_broadcast(handle, body, now_ms, sink),
            GroupPacketType::PeerInfoRequest => {
                let body = packet::pack_peer_info(&self.self_nick.clone(), self.self_status as u8);
                let _ = self.send_lossless_to(handle, GroupPacketType::PeerInfoResponse, &body, now_ms);
            }
            GroupPacketType::PeerInfoResponse => self.handle_peer_info_response(handle, body, now_ms, sink),
            GroupPacketType::SyncRequest => self.handle_sync_request(handle, body, now_ms, sink),
            GroupPacketType::SyncResponse => self.handle_sync_response(handle, body, now_ms, sink),
            GroupPacketType::Topic => self.handle_topic(handle, body, now_ms, sink),
            GroupPacketType::SharedState => self.handle_shared_state(handle, body, now_ms, sink),
            GroupPacketType::ModList => self.handle_mod_list(handle, body, now_ms, sink),
            GroupPacketType::SanctionsList => self.handle_sanctions_list(handle, body, now_ms, sink),
            GroupPacketType::FriendInvite => {
                // Friend invites travel the messenger channel; in-group
                // copies are dropped.
                warn!("unexpected friend invite on group channel");
            }
            GroupPacketType::Ping | GroupPacketType::MessageAck | GroupPacketType::InviteResponseReject => {
                self.note_misbehavior(handle, "lossy type on lossless channel", now_ms, sink);
            }
        }
    }

    fn handle_invite_response(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(sign_pk) = packet::unpack_invite_response(body) else {
            self.note_misbehavior(handle, "malformed invite response", now_ms, sink);
            return;
        };
        let proceed = {
            let Some(peer) = self.peers.get_mut(handle) else { return };
            if peer.handshake == HandshakeState::Sent {
                peer.sign_pk = sign_pk;
                peer.handshake = HandshakeState::Received;
                true
            } else {
                false
            }
        };
        if !proceed {
            return;
        }
        let _ = self.send_lossless_to(handle, GroupPacketType::HsResponseAck, &[], now_ms);
        self.confirm_peer(handle, now_ms, sink);
    }

    fn handle_hs_response_ack(&mut self, handle: PeerHandle, now_ms: u64, sink: &mut dyn EventSink) {
        let proceed = self
            .peers
            .get(handle)
            .is_some_and(|peer| peer.handshake == HandshakeState::Responding);
        if proceed {
            self.confirm_peer(handle, now_ms, sink);
        }
    }

    /// A peer rotated the pairwise key: the packet carries a fresh
    /// ephemeral public key and the new session key is
    /// `kdf(x25519(our_static_sk, their_ephemeral_pk))`. The initiator
    /// derived the same key from its ephemeral secret and our static key
    /// when it sent the request, so no reply is needed; the previous key
    /// stays usable for packets already in flight.
    fn handle_key_rotation(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some((_is_response, ephemeral_pk)) = packet::unpack_key_rotation(body) else {
            self.note_misbehavior(handle, "malformed key rotation", now_ms, sink);
            return;
        };
        let Ok(new_key) = self.keypair.derive_session_key(&ephemeral_pk) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(handle) {
            let prev = std::mem::replace(&mut peer.session_key, new_key);
            peer.prev_session_key = Some(prev);
        }
    }

    fn handle_peer_info_response(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some((nick, status_byte)) = packet::unpack_peer_info(body) else {
            self.note_misbehavior(handle, "malformed peer info", now_ms, sink);
            return;
        };
        let Some(status) = PeerStatus::from_u8(status_byte) else {
            self.note_misbehavior(handle, "invalid peer status", now_ms, sink);
            return;
        };
        let Some(peer) = self.peers.get_mut(handle) else { return };
        let first_info = peer.pending_sync.peer_info;
        let nick_changed = peer.nick != nick;
        let status_changed = peer.status != status;
        peer.nick = nick.clone();
        peer.status = status;
        peer.pending_sync.peer_info = false;
        let peer_id = peer.peer_id;

        // Only changes after the initial exchange are user-visible.
        if !first_info {
            if nick_changed {
                sink.on_event(self.group_id, GroupEvent::NickChange { peer_id, nick });
            }
            if status_changed {
                sink.on_event(self.group_id, GroupEvent::StatusChange { peer_id, status });
            }
        }
    }

    fn handle_sync_request(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(theirs) = packet::unpack_sync_request(body) else {
            self.note_misbehavior(handle, "malformed sync request", now_ms, sink);
            return;
        };
        let ours = self.sync_versions();

        if ours.state > theirs.state && self.shared_state.version > 0 {
            let body = self.shared_state.pack_packet();
            let _ = self.send_lossless_to(handle, GroupPacketType::SharedState, &body, now_ms);
        }
        if ours.mods > theirs.mods {
            let body = self.mod_list.pack();
            let _ = self.send_lossless_to(handle, GroupPacketType::ModList, &body, now_ms);
        }
        if ours.sanctions > theirs.sanctions {
            let body = self.sanctions.pack();
            let _ = self.send_lossless_to(handle, GroupPacketType::SanctionsList, &body, now_ms);
        }
        if ours.topic > theirs.topic {
            let body = self.topic.pack();
            let _ = self.send_lossless_to(handle, GroupPacketType::Topic, &body, now_ms);
        }

        // Tell the requester who else is here so it can mesh.
        let requester_pk = self.peers.get(handle).map(|p| p.enc_pk);
        let entries: Vec<SyncPeerEntry> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_confirmed() && Some(p.enc_pk) != requester_pk)
            .take(MAX_SYNC_RESPONSE_PEERS)
            .map(|(_, p)| SyncPeerEntry {
                enc_pk: p.enc_pk,
                sign_pk: p.sign_pk,
                ip_port: p.connection.ip_port,
                tcp_relays: p.connection.tcp_relays.clone(),
            })
            .collect();
        let body = packet::pack_sync_response(&entries);
        let _ = self.send_lossless_to(handle, GroupPacketType::SyncResponse, &body, now_ms);
    }

    fn handle_sync_response(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(entries) = packet::unpack_sync_response(body) else {
            self.note_misbehavior(handle, "malformed sync response", now_ms, sink);
            return;
        };
        if let Some(peer) = self.peers.get_mut(handle) {
            peer.pending_sync.state = false;
        }
        for entry in entries {
            self.initiate_handshake(entry.enc_pk, entry.sign_pk, entry.ip_port, &entry.tcp_relays, now_ms);
        }
    }

    // =========================================================================
    // STATE ADOPTION
    // =========================================================================

    fn handle_shared_state(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(incoming) = SharedState::unpack_packet(body) else {
            self.note_misbehavior(handle, "malformed shared state", now_ms, sink);
            return;
        };
        if incoming.chat_id != self.chat_id || incoming.founder_sign_pk != self.chat_id {
            self.note_misbehavior(handle, "shared state for wrong chat", now_ms, sink);
            return;
        }
        if !incoming.verify() {
            self.note_misbehavior(handle, "shared state signature invalid", now_ms, sink);
            return;
        }
        if incoming.version < self.shared_state.version {
            warn!(
                "stale shared state v{} < v{}",
                incoming.version, self.shared_state.version
            );
            return;
        }
        if incoming.version == self.shared_state.version {
            if incoming != self.shared_state && self.shared_state.version > 0 {
                self.note_misbehavior(handle, "conflicting shared state at equal version", now_ms, sink);
            }
            return;
        }

        let old = std::mem::replace(&mut self.shared_state, incoming);
        let new = self.shared_state.clone();
        let group_id = self.group_id;
        if old.privacy != new.privacy {
            sink.on_event(group_id, GroupEvent::PrivacyStateChange { privacy: new.privacy });
        }
        if old.peer_limit != new.peer_limit {
            sink.on_event(group_id, GroupEvent::PeerLimitChange { peer_limit: new.peer_limit });
        }
        if old.password_hash != new.password_hash {
            sink.on_event(group_id, GroupEvent::PasswordChange { password: new.password.clone() });
        }
        if old.topic_lock != new.topic_lock {
            sink.on_event(group_id, GroupEvent::TopicLockChange { topic_lock: new.topic_lock });
        }
        if old.group_name != new.group_name {
            sink.on_event(group_id, GroupEvent::GroupNameChange { group_name: new.group_name.clone() });
        }

        // The mod list hash moved: our copy is stale, ask the sender.
        if new.mod_list_hash != self.mod_list.hash() {
            let body = packet::pack_sync_request(&self.sync_versions());
            let _ = self.send_lossless_to(handle, GroupPacketType::SyncRequest, &body, now_ms);
        }
    }

    fn handle_mod_list(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(incoming) = ModList::unpack(body) else {
            self.note_misbehavior(handle, "malformed mod list", now_ms, sink);
            return;
        };
        if !incoming.verify(&self.chat_id) {
            self.note_misbehavior(handle, "mod list signature invalid", now_ms, sink);
            return;
        }
        if incoming.version <= self.mod_list.version && self.mod_list.version > 0 {
            return;
        }
        self.mod_list = incoming;
    }

    fn handle_sanctions_list(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(incoming) = SanctionsList::unpack(body) else {
            self.note_misbehavior(handle, "malformed sanctions list", now_ms, sink);
            return;
        };
        if !incoming.verify(&self.chat_id) {
            self.note_misbehavior(handle, "sanctions list verification failed", now_ms, sink);
            return;
        }
        // The credential issuer must hold moderator authority.
        let issuer_role = derive_role(
            &incoming.credentials.issuer_sign_pk,
            &self.chat_id,
            &self.mod_list,
            &self.sanctions,
        );
        if !incoming.entries.is_empty() && issuer_role > Role::Moderator {
            self.note_misbehavior(handle, "sanctions credentials from non-moderator", now_ms, sink);
            return;
        }
        if incoming.credentials.version <= self.sanctions.credentials.version
            && self.sanctions.credentials.version > 0
        {
            return;
        }
        self.sanctions = incoming;
    }

    fn handle_topic(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some(incoming) = TopicInfo::unpack(body) else {
            self.note_misbehavior(handle, "malformed topic", now_ms, sink);
            return;
        };
        if !incoming.verify(&self.chat_id) {
            self.note_misbehavior(handle, "topic signature invalid", now_ms, sink);
            return;
        }
        let setter_role = derive_role(&incoming.setter_sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);
        let allowed = match self.shared_state.topic_lock {
            TopicLock::Enabled => setter_role <= Role::Moderator,
            TopicLock::Disabled => setter_role < Role::Observer,
        };
        if !allowed {
            self.note_misbehavior(handle, "topic setter lacks permission", now_ms, sink);
            return;
        }
        if incoming.version < self.topic.version {
            return;
        }
        if incoming.version == self.topic.version {
            if incoming.topic != self.topic.topic && self.topic.version > 0 {
                warn!("conflicting topic at equal version");
            }
            return;
        }
        let setter_peer_id = self
            .peers
            .iter()
            .find(|(_, p)| p.sign_pk == incoming.setter_sign_pk)
            .map(|(_, p)| p.peer_id);
        self.topic = incoming;
        sink.on_event(
            self.group_id,
            GroupEvent::TopicChange { peer_id: setter_peer_id, topic: self.topic.topic.clone() },
        );
    }

    // =========================================================================
    // BROADCAST HANDLERS
    // =========================================================================

    fn handle_broadcast(&mut self, handle: PeerHandle, body: &[u8], now_ms: u64, sink: &mut dyn EventSink) {
        let Some((kind, _timestamp, payload)) = packet::unpack_broadcast(body) else {
            self.note_misbehavior(handle, "malformed broadcast", now_ms, sink);
            return;
        };
        let Some(peer) = self.peers.get(handle) else { return };
        if !peer.is_confirmed() {
            self.note_misbehavior(handle, "broadcast before confirmation", now_ms, sink);
            return;
        }
        let peer_id = peer.peer_id;
        let ignored = peer.ignored;
        let sender_role = derive_role(&peer.sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);

        match kind {
            BroadcastKind::Status => {
                let Some(status) = payload.first().and_then(|b| PeerStatus::from_u8(*b)) else {
                    self.note_misbehavior(handle, "invalid status broadcast", now_ms, sink);
                    return;
                };
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.status = status;
                }
                sink.on_event(self.group_id, GroupEvent::StatusChange { peer_id, status });
            }
            BroadcastKind::Nick => {
                if payload.is_empty() || payload.len() > MAX_NICK_LEN {
                    self.note_misbehavior(handle, "invalid nick broadcast", now_ms, sink);
                    return;
                }
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.nick = payload.to_vec();
                }
                sink.on_event(self.group_id, GroupEvent::NickChange { peer_id, nick: payload.to_vec() });
            }
            BroadcastKind::PlainMessage | BroadcastKind::ActionMessage => {
                if payload.is_empty() || payload.len() > MAX_MESSAGE_LEN {
                    self.note_misbehavior(handle, "invalid message length", now_ms, sink);
                    return;
                }
                if sender_role == Role::Observer {
                    self.note_misbehavior(handle, "observer sent a message", now_ms, sink);
                    return;
                }
                if ignored {
                    return;
                }
                let kind = if kind == BroadcastKind::PlainMessage {
                    MessageKind::Normal
                } else {
                    MessageKind::Action
                };
                sink.on_event(
                    self.group_id,
                    GroupEvent::Message { peer_id, kind, message: payload.to_vec() },
                );
            }
            BroadcastKind::PrivateMessage => {
                let Some((kind_byte, message)) = packet::unpack_private_message(payload) else {
                    self.note_misbehavior(handle, "malformed private message", now_ms, sink);
                    return;
                };
                let Some(kind) = MessageKind::from_u8(kind_byte) else {
                    self.note_misbehavior(handle, "invalid private message kind", now_ms, sink);
                    return;
                };
                if sender_role == Role::Observer {
                    self.note_misbehavior(handle, "observer sent a private message", now_ms, sink);
                    return;
                }
                if ignored {
                    return;
                }
                sink.on_event(
                    self.group_id,
                    GroupEvent::PrivateMessage { peer_id, kind, message: message.to_vec() },
                );
            }
            BroadcastKind::PeerExit => {
                if payload.len() > MAX_PART_LEN {
                    self.note_misbehavior(handle, "part message too long", now_ms, sink);
                    return;
                }
                self.remove_peer(handle, ExitType::Quit, payload.to_vec(), now_ms, sink);
            }
            BroadcastKind::KickPeer | BroadcastKind::SetMod | BroadcastKind::SetObserver => {
                self.handle_moderation_broadcast(handle, kind, payload, now_ms, sink);
            }
        }
    }

    fn handle_moderation_broadcast(
        &mut self,
        handle: PeerHandle,
        kind: BroadcastKind,
        payload: &[u8],
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) {
        let Some(event) = ModerationEvent::unpack(payload) else {
            self.note_misbehavior(handle, "malformed moderation event", now_ms, sink);
            return;
        };
        if !event.verify(&self.chat_id) {
            self.note_misbehavior(handle, "moderation event signature invalid", now_ms, sink);
            return;
        }
        // The broadcast kind and the signed event kind must agree.
        let consistent = matches!(
            (kind, event.event),
            (BroadcastKind::KickPeer, ModEvent::Kick)
                | (BroadcastKind::SetMod, ModEvent::Mod | ModEvent::User)
                | (BroadcastKind::SetObserver, ModEvent::Observer | ModEvent::User)
        );
        if !consistent {
            self.note_misbehavior(handle, "moderation event kind mismatch", now_ms, sink);
            return;
        }

        // Authority: the issuer must outrank the target at the time the
        // event is applied. Mod promotions and demotions are founder-only.
        let issuer_role = derive_role(&event.issuer_sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);
        let target_role = derive_role(&event.target_sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);
        let authorized = match kind {
            BroadcastKind::SetMod => issuer_role == Role::Founder && target_role != Role::Founder,
            _ => issuer_role <= Role::Moderator && issuer_role < target_role,
        };
        if !authorized {
            self.note_misbehavior(handle, "moderation event without authority", now_ms, sink);
            return;
        }

        if event.event == ModEvent::Kick {
            if crypto::pk_equal(&event.target_sign_pk, &self.keypair.sign_public_key()) {
                // We were kicked: the group winds down locally.
                sink.on_event(self.group_id, GroupEvent::Moderation { peer_id: None, event: ModEvent::Kick });
                self.peers.clear();
                self.connection_state = ConnectionState::Disconnected;
                return;
            }
            let target = self
                .peers
                .iter()
                .find(|(_, p)| p.sign_pk == event.target_sign_pk)
                .map(|(h, _)| h);
            if let Some(target_handle) = target {
                self.remove_peer(target_handle, ExitType::Kick, Vec::new(), now_ms, sink);
            }
            return;
        }

        // Role changes themselves arrive via the signed lists; the
        // broadcast is the user-visible notification.
        let target_peer_id = self
            .peers
            .iter()
            .find(|(_, p)| p.sign_pk == event.target_sign_pk)
            .map(|(_, p)| p.peer_id)
            .or_else(|| {
                crypto::pk_equal(&event.target_sign_pk, &self.keypair.sign_public_key()).then_some(0)
            });
        sink.on_event(
            self.group_id,
            GroupEvent::Moderation { peer_id: target_peer_id, event: event.event },
        );
    }

    // =========================================================================
    // PEER REMOVAL AND TICK
    // =========================================================================

    /// Removes a peer and fires `peer_exit` (once) if it was confirmed.
    pub fn remove_peer(
        &mut self,
        handle: PeerHandle,
        exit_type: ExitType,
        part_message: Vec<u8>,
        _now_ms: u64,
        sink: &mut dyn EventSink,
    ) {
        let Some(record) = self.peers.remove(handle) else { return };
        if record.handshake == HandshakeState::Confirmed {
            sink.on_event(
                self.group_id,
                GroupEvent::PeerExit {
                    peer_id: record.peer_id,
                    exit_type,
                    nick: record.nick,
                    part_message,
                },
            );
        }
        if self.peers.is_empty() && self.connection_state == ConnectionState::Connected {
            // All peers lost: fall back to rendezvous and keep trying.
            self.connection_state = ConnectionState::Connecting;
        }
    }

    /// Periodic work: prune dead peers, keepalives, sync retries and
    /// lossless retransmissions.
    pub fn tick(&mut self, now_ms: u64, sink: &mut dyn EventSink) {
        // Prune silent peers.
        for handle in self.peers.handles() {
            let expired = self.peers.get(handle).is_some_and(|p| p.timed_out(now_ms));
            if expired {
                self.remove_peer(handle, ExitType::Timeout, Vec::new(), now_ms, sink);
            }
        }

        for handle in self.peers.handles() {
            let Some(peer) = self.peers.get(handle) else { continue };
            if !peer.is_confirmed() {
                continue;
            }

            // Keepalive, with a piggybacked address when the direct path
            // has been quiet long enough to suspect a NAT rebind.
            if now_ms.saturating_sub(peer.last_sent_ping_ms) >= PING_INTERVAL_MS {
                let announce_addr = self.self_ip_port.filter(|_| {
                    now_ms.saturating_sub(peer.connection.direct_last_recv_ms)
                        >= SEND_IP_PORT_INTERVAL_MS
                });
                let body = packet::pack_ping(announce_addr.as_ref());
                self.send_lossy_to(handle, GroupPacketType::Ping, &body, now_ms);
                if let Some(peer) = self.peers.get_mut(handle) {
                    peer.last_sent_ping_ms = now_ms;
                    if announce_addr.is_some() {
                        peer.last_sent_ip_port_ms = now_ms;
                    }
                }
            }

            // Re-request outstanding reconciliation state.
            let needs_sync = self.peers.get(handle).is_some_and(|p| {
                !p.pending_sync.is_done()
                    && now_ms.saturating_sub(p.pending_sync.last_request_ms) >= SYNC_RETRY_INTERVAL_MS
            });
            if needs_sync {
                let versions = self.sync_versions();
                let (want_info, want_state) = {
                    let Some(peer) = self.peers.get_mut(handle) else { continue };
                    peer.pending_sync.last_request_ms = now_ms;
                    (peer.pending_sync.peer_info, peer.pending_sync.state)
                };
                if want_info {
                    let _ = self.send_lossless_to(handle, GroupPacketType::PeerInfoRequest, &[], now_ms);
                }
                if want_state {
                    let body = packet::pack_sync_request(&versions);
                    let _ = self.send_lossless_to(handle, GroupPacketType::SyncRequest, &body, now_ms);
                }
            }

            // Lossless retransmissions.
            let due = match self.peers.get_mut(handle) {
                Some(peer) => peer.send_queue.due_retransmits(now_ms),
                None => continue,
            };
            for wire in due {
                self.route_to_peer(handle, wire, now_ms);
            }
        }
    }

    // =========================================================================
    // LOCAL OPERATIONS
    // =========================================================================

    pub fn send_message(&mut self, kind: MessageKind, message: &[u8], now_ms: u64) -> Result<(), SendMessageError> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(SendMessageError::TooLong);
        }
        if message.is_empty() {
            return Err(SendMessageError::Empty);
        }
        if self.self_role() == Role::Observer {
            return Err(SendMessageError::Permissions);
        }
        if self.connection_state != ConnectionState::Connected {
            return Err(SendMessageError::Disconnected);
        }
        let broadcast_kind = match kind {
            MessageKind::Normal => BroadcastKind::PlainMessage,
            MessageKind::Action => BroadcastKind::ActionMessage,
        };
        if self.broadcast_kind(broadcast_kind, message, now_ms) == 0 {
            return Err(SendMessageError::FailSend);
        }
        Ok(())
    }

    pub fn send_private_message(
        &mut self,
        peer_id: PeerId,
        kind: MessageKind,
        message: &[u8],
        now_ms: u64,
    ) -> Result<(), SendMessageError> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(SendMessageError::TooLong);
        }
        if message.is_empty() {
            return Err(SendMessageError::Empty);
        }
        if self.connection_state != ConnectionState::Connected {
            return Err(SendMessageError::Disconnected);
        }
        let Some(handle) = self.peers.find_by_peer_id(peer_id) else {
            return Err(SendMessageError::PeerNotFound);
        };
        if self.self_role() == Role::Observer {
            return Err(SendMessageError::Permissions);
        }
        // Surface backpressure distinctly: the queue dropping a packet is
        // retryable, a missing route is not.
        if self.peers.get(handle).is_some_and(|peer| peer.send_queue.is_full()) {
            return Err(SendMessageError::SendQ);
        }
        let payload = packet::pack_private_message(kind as u8, message);
        let body = packet::pack_broadcast(BroadcastKind::PrivateMessage, now_ms, &payload);
        self.send_lossless_to(handle, GroupPacketType::Broadcast, &body, now_ms)
            .map_err(|_| SendMessageError::FailSend)
    }

    pub fn send_custom_packet(&mut self, lossless: bool, data: &[u8], now_ms: u64) -> Result<(), SendMessageError> {
        if data.len() > MAX_CUSTOM_PACKET_LEN {
            return Err(SendMessageError::TooLong);
        }
        if data.is_empty() {
            return Err(SendMessageError::Empty);
        }
        if self.self_role() == Role::Observer {
            return Err(SendMessageError::Permissions);
        }
        if self.connection_state != ConnectionState::Connected {
            return Err(SendMessageError::Disconnected);
        }
        let handles: Vec<PeerHandle> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_confirmed())
            .map(|(h, _)| h)
            .collect();
        if handles.is_empty() {
            return Err(SendMessageError::FailSend);
        }
        let mut sent = 0;
        for handle in handles {
            if lossless {
                if self.send_lossless_to(handle, GroupPacketType::CustomPacket, data, now_ms).is_ok() {
                    sent += 1;
                }
            } else {
                self.send_lossy_to(handle, GroupPacketType::CustomPacket, data, now_ms);
                sent += 1;
            }
        }
        if sent == 0 {
            return Err(SendMessageError::FailSend);
        }
        Ok(())
    }

    pub fn set_topic(&mut self, topic: &[u8], now_ms: u64) -> Result<(), TopicSetError> {
        if topic.len() > MAX_TOPIC_LEN {
            return Err(TopicSetError::TooLong);
        }
        let role = self.self_role();
        let allowed = match self.shared_state.topic_lock {
            TopicLock::Enabled => role <= Role::Moderator,
            TopicLock::Disabled => role < Role::Observer,
        };
        if !allowed {
            return Err(TopicSetError::Permissions);
        }
        if self.connection_state == ConnectionState::Disconnected {
            return Err(TopicSetError::Disconnected);
        }
        let info = TopicInfo::new_signed(&self.keypair, &self.chat_id, self.topic.version + 1, topic.to_vec());
        let body = info.pack();
        self.topic = info;
        self.broadcast_lossless(GroupPacketType::Topic, &body, now_ms);
        Ok(())
    }

    pub fn set_self_nick(&mut self, nick: &[u8], now_ms: u64) -> Result<(), SelfNickError> {
        if nick.len() > MAX_NICK_LEN {
            return Err(SelfNickError::TooLong);
        }
        if nick.is_empty() {
            return Err(SelfNickError::Empty);
        }
        if self.peers.iter().any(|(_, p)| p.nick == nick) {
            return Err(SelfNickError::NameTaken);
        }
        self.self_nick = nick.to_vec();
        self.broadcast_kind(BroadcastKind::Nick, nick, now_ms);
        Ok(())
    }

    pub fn set_self_status(&mut self, status: PeerStatus, now_ms: u64) {
        self.self_status = status;
        self.broadcast_kind(BroadcastKind::Status, &[status as u8], now_ms);
    }

    pub fn toggle_ignore(&mut self, peer_id: PeerId, ignore: bool) -> Result<(), ToggleIgnoreError> {
        if peer_id == 0 {
            return Err(ToggleIgnoreError::IgnoreSelf);
        }
        let Some(handle) = self.peers.find_by_peer_id(peer_id) else {
            return Err(ToggleIgnoreError::PeerNotFound);
        };
        if let Some(peer) = self.peers.get_mut(handle) {
            peer.ignored = ignore;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Founder operations: each bumps the shared-state version, re-signs
    // and redistributes.
    // ------------------------------------------------------------------

    fn founder_update(&mut self, now_ms: u64) {
        let keypair_sign_pk = self.keypair.sign_public_key();
        debug_assert!(crypto::pk_equal(&keypair_sign_pk, &self.chat_id));
        self.shared_state.mod_list_hash = self.mod_list.hash();
        let keypair = &self.keypair;
        self.shared_state.bump_and_resign(keypair);
        let body = self.shared_state.pack_packet();
        self.broadcast_lossless(GroupPacketType::SharedState, &body, now_ms);
    }

    pub fn founder_set_password(&mut self, password: &[u8], now_ms: u64) -> Result<(), FounderSetError> {
        if !self.is_founder() {
            return Err(FounderSetError::Permissions);
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(FounderSetError::TooLong);
        }
        self.shared_state.set_password(password);
        self.founder_update(now_ms);
        Ok(())
    }

    pub fn founder_set_privacy_state(&mut self, privacy: PrivacyState, now_ms: u64) -> Result<(), FounderSetError> {
        if !self.is_founder() {
            return Err(FounderSetError::Permissions);
        }
        if self.shared_state.privacy == privacy {
            return Ok(());
        }
        self.shared_state.privacy = privacy;
        self.founder_update(now_ms);
        Ok(())
    }

    pub fn founder_set_peer_limit(&mut self, peer_limit: u32, now_ms: u64) -> Result<(), FounderSetError> {
        if !self.is_founder() {
            return Err(FounderSetError::Permissions);
        }
        self.shared_state.peer_limit = peer_limit;
        self.founder_update(now_ms);
        Ok(())
    }

    pub fn founder_set_topic_lock(&mut self, topic_lock: TopicLock, now_ms: u64) -> Result<(), FounderSetError> {
        if !self.is_founder() {
            return Err(FounderSetError::Permissions);
        }
        if self.shared_state.topic_lock == topic_lock {
            return Ok(());
        }
        self.shared_state.topic_lock = topic_lock;
        self.founder_update(now_ms);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Moderation
    // ------------------------------------------------------------------

    pub fn set_peer_role(&mut self, peer_id: PeerId, role: Role, now_ms: u64) -> Result<(), ModSetRoleError> {
        if peer_id == 0 {
            return Err(ModSetRoleError::SelfTarget);
        }
        let Some(handle) = self.peers.find_by_peer_id(peer_id) else {
            return Err(ModSetRoleError::PeerNotFound);
        };
        let Some(target_sign_pk) = self.peers.get(handle).map(|p| p.sign_pk) else {
            return Err(ModSetRoleError::PeerNotFound);
        };
        let self_role = self.self_role();
        let target_role = derive_role(&target_sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);
        if role == Role::Founder || target_role == Role::Founder || role == target_role {
            return Err(ModSetRoleError::Assignment);
        }

        match role {
            Role::Moderator => {
                if self_role != Role::Founder {
                    return Err(ModSetRoleError::Permissions);
                }
                // An observer must be cleared from the sanctions list first.
                if target_role == Role::Observer {
                    self.clear_sanction(&target_sign_pk, now_ms);
                }
                if !self.mod_list.set_mod(&self.keypair, &self.chat_id, target_sign_pk, true) {
                    return Err(ModSetRoleError::FailAction);
                }
                let body = self.mod_list.pack();
                self.broadcast_lossless(GroupPacketType::ModList, &body, now_ms);
                self.founder_update(now_ms);
                self.broadcast_mod_event(target_sign_pk, ModEvent::Mod, BroadcastKind::SetMod, now_ms);
            }
            Role::Observer => {
                if self_role > Role::Moderator || self_role >= target_role {
                    return Err(ModSetRoleError::Permissions);
                }
                if target_role == Role::Moderator {
                    // Only the founder may demote a moderator.
                    if self_role != Role::Founder {
                        return Err(ModSetRoleError::Permissions);
                    }
                    self.mod_list.set_mod(&self.keypair, &self.chat_id, target_sign_pk, false);
                    let body = self.mod_list.pack();
                    self.broadcast_lossless(GroupPacketType::ModList, &body, now_ms);
                    self.founder_update(now_ms);
                }
                if self.sanctions.entries.len() >= MAX_SANCTIONS {
                    return Err(ModSetRoleError::FailAction);
                }
                self.sanctions.entries.push(SanctionEntry::new(
                    &self.keypair,
                    &self.chat_id,
                    target_sign_pk,
                    now_ms,
                ));
                self.sanctions.reissue_credentials(&self.keypair, &self.chat_id);
                let body = self.sanctions.pack();
                self.broadcast_lossless(GroupPacketType::SanctionsList, &body, now_ms);
                self.broadcast_mod_event(target_sign_pk, ModEvent::Observer, BroadcastKind::SetObserver, now_ms);
            }
            Role::User => {
                if self_role > Role::Moderator || self_role >= target_role {
                    return Err(ModSetRoleError::Permissions);
                }
                match target_role {
                    Role::Moderator => {
                        if self_role != Role::Founder {
                            return Err(ModSetRoleError::Permissions);
                        }
                        self.mod_list.set_mod(&self.keypair, &self.chat_id, target_sign_pk, false);
                        let body = self.mod_list.pack();
                        self.broadcast_lossless(GroupPacketType::ModList, &body, now_ms);
                        self.founder_update(now_ms);
                        self.broadcast_mod_event(target_sign_pk, ModEvent::User, BroadcastKind::SetMod, now_ms);
                    }
                    Role::Observer => {
                        self.clear_sanction(&target_sign_pk, now_ms);
                        self.broadcast_mod_event(target_sign_pk, ModEvent::User, BroadcastKind::SetObserver, now_ms);
                    }
                    _ => return Err(ModSetRoleError::Assignment),
                }
            }
            Role::Founder => unreachable!("rejected above"),
        }
        Ok(())
    }

    fn clear_sanction(&mut self, target_sign_pk: &[u8; PUBLIC_KEY_SIZE], now_ms: u64) {
        let before = self.sanctions.entries.len();
        self.sanctions.entries.retain(|e| &e.target_sign_pk != target_sign_pk);
        if self.sanctions.entries.len() != before {
            self.sanctions.reissue_credentials(&self.keypair, &self.chat_id);
            let body = self.sanctions.pack();
            self.broadcast_lossless(GroupPacketType::SanctionsList, &body, now_ms);
        }
    }

    fn broadcast_mod_event(
        &mut self,
        target_sign_pk: [u8; PUBLIC_KEY_SIZE],
        event: ModEvent,
        kind: BroadcastKind,
        now_ms: u64,
    ) {
        let version = match event {
            ModEvent::Kick => self.shared_state.version,
            ModEvent::Mod | ModEvent::User => self.mod_list.version,
            ModEvent::Observer => self.sanctions.credentials.version,
        };
        let signed = ModerationEvent::new_signed(&self.keypair, &self.chat_id, version, target_sign_pk, event);
        self.broadcast_kind(kind, &signed.pack(), now_ms);
    }

    /// Kicks a peer: broadcasts the signed event and removes the peer
    /// locally without firing `peer_exit` for the caller.
    pub fn kick_peer(&mut self, peer_id: PeerId, now_ms: u64) -> Result<(), KickPeerError> {
        if peer_id == 0 {
            return Err(KickPeerError::SelfTarget);
        }
        let Some(handle) = self.peers.find_by_peer_id(peer_id) else {
            return Err(KickPeerError::PeerNotFound);
        };
        let Some(target_sign_pk) = self.peers.get(handle).map(|p| p.sign_pk) else {
            return Err(KickPeerError::PeerNotFound);
        };
        let self_role = self.self_role();
        let target_role = derive_role(&target_sign_pk, &self.chat_id, &self.mod_list, &self.sanctions);
        if self_role > Role::Moderator || self_role >= target_role {
            return Err(KickPeerError::Permissions);
        }
        self.broadcast_mod_event(target_sign_pk, ModEvent::Kick, BroadcastKind::KickPeer, now_ms);
        self.peers.remove(handle);
        Ok(())
    }

    /// Broadcasts a parting message. The caller deletes the group after.
    pub fn announce_exit(&mut self, part_message: &[u8], now_ms: u64) {
        self.broadcast_kind(BroadcastKind::PeerExit, part_message, now_ms);
    }

    /// Drops every peer while keeping self identity and adopted state.
    pub fn disconnect(&mut self, sink: &mut dyn EventSink) {
        let removed = self.peers.clear();
        for record in removed {
            if record.handshake == HandshakeState::Confirmed {
                sink.on_event(
                    self.group_id,
                    GroupEvent::PeerExit {
                        peer_id: record.peer_id,
                        exit_type: ExitType::SelfDisconnected,
                        nick: record.nick,
                        part_message: Vec::new(),
                    },
                );
            }
        }
        self.connection_state = ConnectionState::Disconnected;
    }

    /// Rotates the session key with one peer. A fresh ephemeral keypair
    /// produces the new key on both sides: we derive it from the ephemeral
    /// secret and the peer's static key, the peer from its static secret
    /// and the ephemeral public key carried in the packet.
    pub fn rotate_key(&mut self, peer_id: PeerId, now_ms: u64) -> bool {
        let Some(handle) = self.peers.find_by_peer_id(peer_id) else {
            return false;
        };
        let ephemeral_secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_pk = x25519_dalek::PublicKey::from(&ephemeral_secret).to_bytes();
        let new_key = {
            let Some(peer) = self.peers.get(handle) else { return false };
            match crypto::derive_session_key(&ephemeral_secret, &peer.enc_pk) {
                Ok(key) => key,
                Err(_) => return false,
            }
        };

        // The rotation request still travels under the old key.
        let body = packet::pack_key_rotation(false, &ephemeral_pk);
        if self.send_lossless_to(handle, GroupPacketType::KeyRotation, &body, now_ms).is_err() {
            return false;
        }
        if let Some(peer) = self.peers.get_mut(handle) {
            let prev = std::mem::replace(&mut peer.session_key, new_key);
            peer.prev_session_key = Some(prev);
        }
        true
    }
}
