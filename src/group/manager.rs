//! The session manager: owns every joined group, drives the periodic tick
//! and fans inbound traffic out to the right group.
//!
//! The engine is a single-writer tree. All calls, including `tick`, must
//! come from one thread; a host that wants concurrent access wraps the
//! whole session in its own lock. I/O happens only through the transport
//! collaborator and events only through the event sink, both injected at
//! construction.

use super::announce::{AnnounceResponder, AnnounceSearcher, GroupAnnounce};
use super::chat::{Chat, OutboundFrame};
use super::events::{EventSink, GroupEvent};
use super::invite::{InviteAcceptError, InviteFriendError, InviteMessage};
use super::shared_state::{ModList, SanctionsList, SharedState, TopicInfo};
use super::types::*;
use crate::crypto::ExtendedKeyPair;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

// =============================================================================
// COLLABORATOR INTERFACES
// =============================================================================

/// Outbound I/O surface, implemented by the host. All methods must be
/// non-blocking; `false` means the packet was not accepted and the caller
/// may retry later (lossless traffic retries on its own).
pub trait GroupTransport {
    fn send_udp(&mut self, dest: IpPort, packet: &[u8]) -> bool;
    fn send_tcp_relay(&mut self, relay: &TcpRelay, dest_enc_pk: &[u8; PUBLIC_KEY_SIZE], packet: &[u8]) -> bool;
    fn send_onion(&mut self, dest: &NodeInfo, packet: &[u8]) -> bool;
    fn send_onion_response(&mut self, dest: IpPort, packet: &[u8]) -> bool;
    fn send_friend(&mut self, friend_id: FriendId, data: &[u8]) -> bool;
}

/// Host-supplied session parameters.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Our own reachable address, advertised to peers when known.
    pub self_ip_port: Option<IpPort>,
    /// TCP relays we are reachable through.
    pub self_tcp_relays: Vec<TcpRelay>,
    /// Initial DHT nodes for announce lookups.
    pub bootstrap_nodes: Vec<NodeInfo>,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupNewError {
    #[error("name too long")]
    TooLong,
    #[error("name is empty")]
    Empty,
    #[error("group instance failed to initialize")]
    Init,
    #[error("group state failed to initialize")]
    State,
    #[error("announce setup failed")]
    Announce,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupJoinError {
    #[error("group instance failed to initialize")]
    Init,
    #[error("bad chat id or group already joined")]
    BadChatId,
    #[error("nickname is empty")]
    Empty,
    #[error("nickname too long")]
    TooLong,
    #[error("password too long")]
    Password,
    #[error("core failure while initiating the group")]
    Core,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupLeaveError {
    #[error("group not found")]
    GroupNotFound,
    #[error("part message too long")]
    TooLong,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("group not found")]
    GroupNotFound,
    #[error("core failure while initiating the group")]
    Core,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendMessageError {
    #[error("group not found")]
    GroupNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("message too long")]
    TooLong,
    #[error("message is empty")]
    Empty,
    #[error("insufficient permissions")]
    Permissions,
    #[error("packet failed to send")]
    FailSend,
    #[error("group is disconnected")]
    Disconnected,
    #[error("send queue is full")]
    SendQ,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopicSetError {
    #[error("group not found")]
    GroupNotFound,
    #[error("topic too long")]
    TooLong,
    #[error("insufficient permissions")]
    Permissions,
    #[error("packet failed to send")]
    FailSend,
    #[error("group is disconnected")]
    Disconnected,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FounderSetError {
    #[error("group not found")]
    GroupNotFound,
    #[error("insufficient permissions")]
    Permissions,
    #[error("value too long")]
    TooLong,
    #[error("group is disconnected")]
    Disconnected,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ModSetRoleError {
    #[error("group not found")]
    GroupNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("insufficient permissions")]
    Permissions,
    #[error("invalid role assignment")]
    Assignment,
    #[error("role change failed")]
    FailAction,
    #[error("cannot change own role")]
    SelfTarget,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KickPeerError {
    #[error("group not found")]
    GroupNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("insufficient permissions")]
    Permissions,
    #[error("cannot kick self")]
    SelfTarget,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ToggleIgnoreError {
    #[error("group not found")]
    GroupNotFound,
    #[error("peer not found")]
    PeerNotFound,
    #[error("cannot ignore self")]
    IgnoreSelf,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelfNickError {
    #[error("group not found")]
    GroupNotFound,
    #[error("nickname too long")]
    TooLong,
    #[error("nickname is empty")]
    Empty,
    #[error("nickname already taken")]
    NameTaken,
}

// =============================================================================
// SAVED GROUPS
// =============================================================================

/// Snapshot of a group for reconnect across restarts. Serialization of the
/// surrounding save file is the host's concern; this is just the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedGroup {
    pub chat_id: ChatId,
    pub enc_secret: [u8; SECRET_KEY_SIZE],
    pub sign_secret: [u8; SECRET_KEY_SIZE],
    pub self_nick: Vec<u8>,
    pub join_password: Vec<u8>,
    pub shared_state_packet: Vec<u8>,
    pub mod_list_packet: Vec<u8>,
    pub sanctions_packet: Vec<u8>,
    pub topic_packet: Vec<u8>,
    /// Whether the group should auto-connect on load.
    pub connected: bool,
}

impl Drop for SavedGroup {
    fn drop(&mut self) {
        self.enc_secret.zeroize();
        self.sign_secret.zeroize();
        self.join_password.zeroize();
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// The group session engine root.
pub struct GroupSession {
    config: SessionConfig,
    transport: Box<dyn GroupTransport>,
    sink: Box<dyn EventSink>,
    chats: HashMap<GroupId, Chat>,
    searchers: HashMap<GroupId, AnnounceSearcher>,
    responder: AnnounceResponder,
    /// Friends we invited, and to which group.
    pending_invites: HashMap<FriendId, GroupId>,
    /// Invites we accepted, awaiting the confirmation.
    pending_joins: HashMap<FriendId, GroupId>,
    next_group_id: GroupId,
}

impl GroupSession {
    pub fn new(config: SessionConfig, transport: Box<dyn GroupTransport>, sink: Box<dyn EventSink>) -> Self {
        Self {
            config,
            transport,
            sink,
            chats: HashMap::new(),
            searchers: HashMap::new(),
            responder: AnnounceResponder::new(),
            pending_invites: HashMap::new(),
            pending_joins: HashMap::new(),
            next_group_id: 0,
        }
    }

    fn alloc_group_id(&mut self) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        id
    }

    fn install_chat(&mut self, mut chat: Chat) -> GroupId {
        chat.self_ip_port = self.config.self_ip_port;
        chat.self_tcp_relays = self.config.self_tcp_relays.clone();
        let group_id = chat.group_id;
        if chat.shared_state.privacy == PrivacyState::Public {
            self.searchers
                .insert(group_id, AnnounceSearcher::new(chat.chat_id, self.config.bootstrap_nodes.clone()));
        }
        self.chats.insert(group_id, chat);
        group_id
    }

    fn pump(&mut self, group_id: GroupId) {
        let Some(chat) = self.chats.get_mut(&group_id) else { return };
        for frame in chat.take_outbound() {
            match frame {
                OutboundFrame::Udp { dest, packet } => {
                    if !self.transport.send_udp(dest, &packet) {
                        debug!("udp send to {:?} refused", dest);
                    }
                }
                OutboundFrame::TcpRelay { relay, dest_enc_pk, packet } => {
                    if !self.transport.send_tcp_relay(&relay, &dest_enc_pk, &packet) {
                        debug!("tcp relay send refused");
                    }
                }
            }
        }
    }

    // =========================================================================
    // LIFECYCLE API
    // =========================================================================

    /// Creates a new group; the caller becomes its founder.
    pub fn create_group(
        &mut self,
        privacy: PrivacyState,
        group_name: &[u8],
        self_nick: &[u8],
    ) -> Result<GroupId, GroupNewError> {
        if group_name.len() > MAX_GROUP_NAME_LEN || self_nick.len() > MAX_NICK_LEN {
            return Err(GroupNewError::TooLong);
        }
        if group_name.is_empty() || self_nick.is_empty() {
            return Err(GroupNewError::Empty);
        }
        let group_id = self.alloc_group_id();
        let chat = Chat::new_founded(group_id, privacy, group_name.to_vec(), self_nick.to_vec());
        if !chat.shared_state.verify() {
            return Err(GroupNewError::State);
        }
        Ok(self.install_chat(chat))
    }

    /// Joins a group by chat ID, discovering peers through announces.
    pub fn join_group(
        &mut self,
        chat_id: ChatId,
        self_nick: &[u8],
        password: &[u8],
    ) -> Result<GroupId, GroupJoinError> {
        if self_nick.is_empty() {
            return Err(GroupJoinError::Empty);
        }
        if self_nick.len() > MAX_NICK_LEN {
            return Err(GroupJoinError::TooLong);
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(GroupJoinError::Password);
        }
        if self.chats.values().any(|chat| chat.chat_id == chat_id) {
            return Err(GroupJoinError::BadChatId);
        }
        let group_id = self.alloc_group_id();
        let chat = Chat::new_joining(group_id, chat_id, self_nick.to_vec(), password.to_vec());
        Ok(self.install_chat(chat))
    }

    /// Leaves a group, broadcasting an optional parting message, and
    /// deletes all local state including keys and roles.
    pub fn leave_group(&mut self, group_id: GroupId, part_message: &[u8]) -> Result<(), GroupLeaveError> {
        if part_message.len() > MAX_PART_LEN {
            return Err(GroupLeaveError::TooLong);
        }
        {
            let chat = self.chats.get_mut(&group_id).ok_or(GroupLeaveError::GroupNotFound)?;
            // Best effort: peers that miss it will time the record out.
            chat.announce_exit(part_message, 0);
        }
        self.pump(group_id);
        self.chats.remove(&group_id);
        self.searchers.remove(&group_id);
        self.pending_invites.retain(|_, gid| *gid != group_id);
        self.pending_joins.retain(|_, gid| *gid != group_id);
        Ok(())
    }

    /// Drops all peers but keeps self identity and adopted state.
    pub fn disconnect(&mut self, group_id: GroupId) -> Result<(), ReconnectError> {
        let chat = self.chats.get_mut(&group_id).ok_or(ReconnectError::GroupNotFound)?;
        chat.disconnect(self.sink.as_mut());
        Ok(())
    }

    /// Drops all peers and re-runs rendezvous with the same identity.
    pub fn reconnect(&mut self, group_id: GroupId) -> Result<(), ReconnectError> {
        let chat = self.chats.get_mut(&group_id).ok_or(ReconnectError::GroupNotFound)?;
        chat.disconnect(self.sink.as_mut());
        chat.connection_state = ConnectionState::Connecting;
        chat.last_search_ms = 0;
        chat.last_announce_ms = 0;
        Ok(())
    }

    /// Packs a group for persistence.
    pub fn save_group(&self, group_id: GroupId) -> Option<SavedGroup> {
        let chat = self.chats.get(&group_id)?;
        Some(SavedGroup {
            chat_id: chat.chat_id,
            enc_secret: chat.keypair.enc_secret_bytes(),
            sign_secret: chat.keypair.sign_secret_bytes(),
            self_nick: chat.self_nick.clone(),
            join_password: chat.join_password.clone(),
            shared_state_packet: if chat.shared_state.version > 0 {
                chat.shared_state.pack_packet()
            } else {
                Vec::new()
            },
            mod_list_packet: chat.mod_list.pack(),
            sanctions_packet: chat.sanctions.pack(),
            topic_packet: chat.topic.pack(),
            connected: chat.connection_state != ConnectionState::Disconnected,
        })
    }

    /// Restores a previously saved group and, if it was connected when
    /// saved, starts reconnecting.
    pub fn load_group(&mut self, saved: &SavedGroup) -> Result<GroupId, GroupJoinError> {
        if self.chats.values().any(|chat| chat.chat_id == saved.chat_id) {
            return Err(GroupJoinError::BadChatId);
        }
        let group_id = self.alloc_group_id();
        let mut chat = Chat::new_joining(
            group_id,
            saved.chat_id,
            saved.self_nick.clone(),
            saved.join_password.clone(),
        );
        chat.keypair = ExtendedKeyPair::from_bytes(saved.enc_secret, saved.sign_secret);
        if !saved.shared_state_packet.is_empty() {
            match SharedState::unpack_packet(&saved.shared_state_packet) {
                Some(state) if state.verify() && state.chat_id == saved.chat_id => {
                    chat.shared_state = state;
                }
                _ => return Err(GroupJoinError::Core),
            }
        }
        if let Some(mods) = ModList::unpack(&saved.mod_list_packet) {
            if mods.verify(&saved.chat_id) || mods.mods.is_empty() {
                chat.mod_list = mods;
            }
        }
        if let Some(sanctions) = SanctionsList::unpack(&saved.sanctions_packet) {
            if sanctions.verify(&saved.chat_id) {
                chat.sanctions = sanctions;
            }
        }
        if let Some(topic) = TopicInfo::unpack(&saved.topic_packet) {
            if topic.verify(&saved.chat_id) || topic.version == 0 {
                chat.topic = topic;
            }
        }
        chat.connection_state = if saved.connected {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        };
        Ok(self.install_chat(chat))
    }

    // =========================================================================
    // INVITES
    // =========================================================================

    /// Invites a friend to a group over the messenger channel.
    pub fn invite_friend(&mut self, group_id: GroupId, friend_id: FriendId) -> Result<(), InviteFriendError> {
        let chat = self.chats.get(&group_id).ok_or(InviteFriendError::GroupNotFound)?;
        if chat.connection_state == ConnectionState::Disconnected {
            return Err(InviteFriendError::Disconnected);
        }
        let invite = InviteMessage::Invite {
            chat_id: chat.chat_id,
            group_name: chat.shared_state.group_name.clone(),
        };
        if !self.transport.send_friend(friend_id, &invite.encode()) {
            return Err(InviteFriendError::FailSend);
        }
        self.pending_invites.insert(friend_id, group_id);
        Ok(())
    }

    /// Accepts a friend's invite: creates the group and answers over the
    /// friend channel. The connection itself starts when the confirmation
    /// arrives.
    pub fn accept_invite(
        &mut self,
        friend_id: FriendId,
        invite_data: &[u8],
        self_nick: &[u8],
        password: &[u8],
    ) -> Result<GroupId, InviteAcceptError> {
        let Some(InviteMessage::Invite { chat_id, .. }) = InviteMessage::decode(invite_data) else {
            return Err(InviteAcceptError::BadInvite);
        };
        if self_nick.is_empty() {
            return Err(InviteAcceptError::Empty);
        }
        if self_nick.len() > MAX_NICK_LEN {
            return Err(InviteAcceptError::TooLong);
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(InviteAcceptError::Password);
        }
        if self.chats.values().any(|chat| chat.chat_id == chat_id) {
            return Err(InviteAcceptError::InitFailed);
        }

        let group_id = self.alloc_group_id();
        let chat = Chat::new_joining(group_id, chat_id, self_nick.to_vec(), password.to_vec());
        let accepted = InviteMessage::InviteAccepted {
            chat_id,
            invitee_enc_pk: *chat.keypair.enc_public_key(),
            invitee_sign_pk: chat.keypair.sign_public_key(),
            nick: self_nick.to_vec(),
        };
        if !self.transport.send_friend(friend_id, &accepted.encode()) {
            return Err(InviteAcceptError::FailSend);
        }
        let group_id = self.install_chat(chat);
        self.pending_joins.insert(friend_id, group_id);
        Ok(group_id)
    }

    /// Feeds an inbound messenger-channel payload from a friend.
    pub fn handle_friend_message(&mut self, friend_id: FriendId, data: &[u8], now_ms: u64) {
        let Some(message) = InviteMessage::decode(data) else {
            debug!("undecodable friend payload from {}", friend_id);
            return;
        };
        match message {
            InviteMessage::Invite { group_name, .. } => {
                self.sink.on_event(
                    GroupId::MAX,
                    GroupEvent::Invite { friend_id, group_name, invite_data: data.to_vec() },
                );
            }
            InviteMessage::InviteAccepted { chat_id, .. } => {
                // Inviter side: answer with our connection info.
                let Some(&group_id) = self.pending_invites.get(&friend_id) else {
                    debug!("unsolicited invite accept from {}", friend_id);
                    return;
                };
                let Some(chat) = self.chats.get(&group_id) else { return };
                if chat.chat_id != chat_id {
                    warn!("invite accept names a different chat");
                    return;
                }
                let confirmation = InviteMessage::InviteConfirmation {
                    chat_id,
                    inviter_enc_pk: *chat.keypair.enc_public_key(),
                    inviter_sign_pk: chat.keypair.sign_public_key(),
                    ip_port: self.config.self_ip_port,
                    tcp_relays: self.config.self_tcp_relays.clone(),
                };
                if self.transport.send_friend(friend_id, &confirmation.encode()) {
                    self.pending_invites.remove(&friend_id);
                }
            }
            InviteMessage::InviteConfirmation { chat_id, inviter_enc_pk, inviter_sign_pk, ip_port, tcp_relays } => {
                // Invitee side: we can now reach the inviter directly.
                let Some(&group_id) = self.pending_joins.get(&friend_id) else {
                    debug!("unsolicited invite confirmation from {}", friend_id);
                    return;
                };
                let Some(chat) = self.chats.get_mut(&group_id) else { return };
                if chat.chat_id != chat_id {
                    warn!("invite confirmation names a different chat");
                    return;
                }
                chat.initiate_handshake(inviter_enc_pk, inviter_sign_pk, ip_port, &tcp_relays, now_ms);
                self.pending_joins.remove(&friend_id);
                self.pump(group_id);
            }
        }
    }

    // =========================================================================
    // INBOUND PACKETS
    // =========================================================================

    /// Feeds a UDP datagram. Routing is by sender key: per-group identities
    /// are fresh, so a key identifies at most one (group, peer) pair; a
    /// first-contact handshake is admitted by whichever group's pairwise
    /// key opens the frame.
    pub fn handle_udp_packet(&mut self, source: IpPort, packet: &[u8], now_ms: u64) {
        self.dispatch_group_packet(Transport::Udp, Some(source), packet, now_ms);
    }

    /// Feeds a packet that arrived through a TCP relay.
    pub fn handle_tcp_packet(&mut self, packet: &[u8], now_ms: u64) {
        self.dispatch_group_packet(Transport::Tcp, None, packet, now_ms);
    }

    fn dispatch_group_packet(&mut self, transport: Transport, source: Option<IpPort>, packet: &[u8], now_ms: u64) {
        let group_ids: Vec<GroupId> = self.chats.keys().copied().collect();
        for group_id in group_ids {
            let handled = {
                let Some(chat) = self.chats.get_mut(&group_id) else { continue };
                chat.handle_packet(transport, source, packet, now_ms, self.sink.as_mut())
            };
            self.pump(group_id);
            if handled {
                return;
            }
        }
        debug!("group packet matched no chat");
    }

    /// Feeds an inbound announce request (responder role).
    pub fn handle_announce_request(&mut self, source: IpPort, packet: &[u8], now_ms: u64) {
        if let Some(response) = self.responder.handle_request(source, packet, now_ms) {
            self.transport.send_onion_response(source, &response);
        }
    }

    /// Feeds an inbound onion data request (responder relay role).
    pub fn handle_onion_data_request(&mut self, packet: &[u8], now_ms: u64) {
        if let Some((dest, forwarded)) = self.responder.handle_data_request(packet, now_ms) {
            self.transport.send_onion_response(dest, &forwarded);
        }
    }

    /// Feeds an announce response from the onion transport.
    pub fn handle_onion_response(&mut self, packet: &[u8], now_ms: u64) {
        let group_ids: Vec<GroupId> = self.searchers.keys().copied().collect();
        for group_id in group_ids {
            let discovered = {
                let Some(searcher) = self.searchers.get_mut(&group_id) else { continue };
                searcher.handle_response(packet)
            };
            if discovered.is_empty() {
                continue;
            }
            if let Some(chat) = self.chats.get_mut(&group_id) {
                for peer in discovered {
                    chat.initiate_handshake(
                        peer.announce.peer_enc_pk,
                        peer.announce.peer_sign_pk,
                        peer.announce.ip_port,
                        &peer.announce.tcp_relays,
                        now_ms,
                    );
                }
            }
            self.pump(group_id);
            return;
        }
    }

    /// Hands the host's view of the DHT neighbourhood to the responder.
    pub fn set_close_nodes(&mut self, nodes: Vec<NodeInfo>) {
        self.responder.set_close_nodes(nodes);
    }

    /// The key other nodes address announce requests to.
    pub fn announce_public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.responder.public_key()
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Drives timers: peer pruning, keepalives, retransmits, sync retries
    /// and the announce loop. Call once per host event-loop iteration.
    pub fn tick(&mut self, now_ms: u64) {
        let group_ids: Vec<GroupId> = self.chats.keys().copied().collect();
        for group_id in group_ids {
            {
                let Some(chat) = self.chats.get_mut(&group_id) else { continue };
                chat.tick(now_ms, self.sink.as_mut());
            }
            self.announce_tick(group_id, now_ms);
            self.pump(group_id);
        }
    }

    fn announce_tick(&mut self, group_id: GroupId, now_ms: u64) {
        let (privacy, state, self_announce, due_search, due_publish) = {
            let Some(chat) = self.chats.get_mut(&group_id) else { return };
            let due_search = now_ms.saturating_sub(chat.last_search_ms) >= ANNOUNCE_SEARCH_INTERVAL_MS;
            let due_publish = now_ms.saturating_sub(chat.last_announce_ms) >= ANNOUNCE_PUBLISH_INTERVAL_MS;
            let announce = GroupAnnounce {
                chat_id: chat.chat_id,
                peer_enc_pk: *chat.keypair.enc_public_key(),
                peer_sign_pk: chat.keypair.sign_public_key(),
                ip_port: chat.self_ip_port,
                tcp_relays: chat.self_tcp_relays.clone(),
            };
            (chat.shared_state.privacy, chat.connection_state, announce, due_search, due_publish)
        };

        if privacy != PrivacyState::Public || state == ConnectionState::Disconnected {
            return;
        }

        let requests = match state {
            ConnectionState::Connecting if due_search => {
                if let Some(chat) = self.chats.get_mut(&group_id) {
                    chat.last_search_ms = now_ms;
                }
                let announce = self_announce.is_routable().then_some(&self_announce);
                match self.searchers.get_mut(&group_id) {
                    Some(searcher) => searcher.build_requests(announce),
                    None => Vec::new(),
                }
            }
            ConnectionState::Connected if due_publish => {
                if let Some(chat) = self.chats.get_mut(&group_id) {
                    chat.last_announce_ms = now_ms;
                }
                let announce = self_announce.is_routable().then_some(&self_announce);
                match self.searchers.get_mut(&group_id) {
                    Some(searcher) => searcher.build_requests(announce),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        };

        for (node, packet) in requests {
            if !self.transport.send_onion(&node, &packet) {
                debug!("onion send refused");
            }
        }
    }

    // =========================================================================
    // MESSAGING AND STATE API
    // =========================================================================

    fn chat_mut(&mut self, group_id: GroupId) -> Option<&mut Chat> {
        self.chats.get_mut(&group_id)
    }

    pub fn send_message(&mut self, group_id: GroupId, kind: MessageKind, message: &[u8], now_ms: u64) -> Result<(), SendMessageError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(SendMessageError::GroupNotFound)?
            .send_message(kind, message, now_ms);
        self.pump(group_id);
        result
    }

    pub fn send_private_message(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        kind: MessageKind,
        message: &[u8],
        now_ms: u64,
    ) -> Result<(), SendMessageError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(SendMessageError::GroupNotFound)?
            .send_private_message(peer_id, kind, message, now_ms);
        self.pump(group_id);
        result
    }

    pub fn send_custom_packet(&mut self, group_id: GroupId, lossless: bool, data: &[u8], now_ms: u64) -> Result<(), SendMessageError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(SendMessageError::GroupNotFound)?
            .send_custom_packet(lossless, data, now_ms);
        self.pump(group_id);
        result
    }

    pub fn set_topic(&mut self, group_id: GroupId, topic: &[u8], now_ms: u64) -> Result<(), TopicSetError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(TopicSetError::GroupNotFound)?
            .set_topic(topic, now_ms);
        self.pump(group_id);
        result
    }

    pub fn set_self_nick(&mut self, group_id: GroupId, nick: &[u8], now_ms: u64) -> Result<(), SelfNickError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(SelfNickError::GroupNotFound)?
            .set_self_nick(nick, now_ms);
        self.pump(group_id);
        result
    }

    pub fn set_self_status(&mut self, group_id: GroupId, status: PeerStatus, now_ms: u64) -> Result<(), SendMessageError> {
        self.chat_mut(group_id)
            .ok_or(SendMessageError::GroupNotFound)?
            .set_self_status(status, now_ms);
        self.pump(group_id);
        Ok(())
    }

    pub fn toggle_ignore(&mut self, group_id: GroupId, peer_id: PeerId, ignore: bool) -> Result<(), ToggleIgnoreError> {
        self.chat_mut(group_id)
            .ok_or(ToggleIgnoreError::GroupNotFound)?
            .toggle_ignore(peer_id, ignore)
    }

    pub fn founder_set_password(&mut self, group_id: GroupId, password: &[u8], now_ms: u64) -> Result<(), FounderSetError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(FounderSetError::GroupNotFound)?
            .founder_set_password(password, now_ms);
        self.pump(group_id);
        result
    }

    pub fn founder_set_privacy_state(&mut self, group_id: GroupId, privacy: PrivacyState, now_ms: u64) -> Result<(), FounderSetError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(FounderSetError::GroupNotFound)?
            .founder_set_privacy_state(privacy, now_ms);
        // The announce loop follows the privacy state.
        if result.is_ok() {
            let chat_id = self.chats.get(&group_id).map(|c| c.chat_id);
            match (privacy, chat_id) {
                (PrivacyState::Public, Some(chat_id)) => {
                    self.searchers
                        .entry(group_id)
                        .or_insert_with(|| AnnounceSearcher::new(chat_id, self.config.bootstrap_nodes.clone()));
                }
                (PrivacyState::Private, _) => {
                    self.searchers.remove(&group_id);
                }
                _ => {}
            }
        }
        self.pump(group_id);
        result
    }

    pub fn founder_set_peer_limit(&mut self, group_id: GroupId, peer_limit: u32, now_ms: u64) -> Result<(), FounderSetError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(FounderSetError::GroupNotFound)?
            .founder_set_peer_limit(peer_limit, now_ms);
        self.pump(group_id);
        result
    }

    pub fn founder_set_topic_lock(&mut self, group_id: GroupId, topic_lock: TopicLock, now_ms: u64) -> Result<(), FounderSetError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(FounderSetError::GroupNotFound)?
            .founder_set_topic_lock(topic_lock, now_ms);
        self.pump(group_id);
        result
    }

    pub fn set_peer_role(&mut self, group_id: GroupId, peer_id: PeerId, role: Role, now_ms: u64) -> Result<(), ModSetRoleError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(ModSetRoleError::GroupNotFound)?
            .set_peer_role(peer_id, role, now_ms);
        self.pump(group_id);
        result
    }

    pub fn kick_peer(&mut self, group_id: GroupId, peer_id: PeerId, now_ms: u64) -> Result<(), KickPeerError> {
        let result = self
            .chat_mut(group_id)
            .ok_or(KickPeerError::GroupNotFound)?
            .kick_peer(peer_id, now_ms);
        self.pump(group_id);
        result
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn group_count(&self) -> usize {
        self.chats.len()
    }

    pub fn is_connected(&self, group_id: GroupId) -> Option<bool> {
        self.chats
            .get(&group_id)
            .map(|chat| chat.connection_state != ConnectionState::Disconnected)
    }

    pub fn chat_id(&self, group_id: GroupId) -> Option<ChatId> {
        self.chats.get(&group_id).map(|chat| chat.chat_id)
    }

    pub fn group_name(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.chats.get(&group_id).map(|chat| chat.shared_state.group_name.clone())
    }

    pub fn topic(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.chats.get(&group_id).map(|chat| chat.topic.topic.clone())
    }

    pub fn password(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.chats.get(&group_id).map(|chat| chat.shared_state.password.clone())
    }

    pub fn privacy_state(&self, group_id: GroupId) -> Option<PrivacyState> {
        self.chats.get(&group_id).map(|chat| chat.shared_state.privacy)
    }

    pub fn peer_limit(&self, group_id: GroupId) -> Option<u32> {
        self.chats.get(&group_id).map(|chat| chat.shared_state.peer_limit)
    }

    pub fn topic_lock(&self, group_id: GroupId) -> Option<TopicLock> {
        self.chats.get(&group_id).map(|chat| chat.shared_state.topic_lock)
    }

    pub fn self_role(&self, group_id: GroupId) -> Option<Role> {
        self.chats.get(&group_id).map(|chat| chat.self_role())
    }

    pub fn self_nick(&self, group_id: GroupId) -> Option<Vec<u8>> {
        self.chats.get(&group_id).map(|chat| chat.self_nick.clone())
    }

    pub fn self_status(&self, group_id: GroupId) -> Option<PeerStatus> {
        self.chats.get(&group_id).map(|chat| chat.self_status)
    }

    /// Our own peer id is always zero within a group.
    pub fn self_peer_id(&self) -> PeerId {
        0
    }

    pub fn self_public_key(&self, group_id: GroupId) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.chats.get(&group_id).map(|chat| *chat.keypair.enc_public_key())
    }

    pub fn peer_count(&self, group_id: GroupId) -> Option<usize> {
        self.chats.get(&group_id).map(|chat| chat.peers.confirmed_count())
    }

    pub fn peer_nick(&self, group_id: GroupId, peer_id: PeerId) -> Option<Vec<u8>> {
        let chat = self.chats.get(&group_id)?;
        let handle = chat.peers.find_by_peer_id(peer_id)?;
        chat.peers.get(handle).map(|peer| peer.nick.clone())
    }

    pub fn peer_status(&self, group_id: GroupId, peer_id: PeerId) -> Option<PeerStatus> {
        let chat = self.chats.get(&group_id)?;
        let handle = chat.peers.find_by_peer_id(peer_id)?;
        chat.peers.get(handle).map(|peer| peer.status)
    }

    pub fn peer_role(&self, group_id: GroupId, peer_id: PeerId) -> Option<Role> {
        let chat = self.chats.get(&group_id)?;
        let handle = chat.peers.find_by_peer_id(peer_id)?;
        chat.peer_role(handle)
    }

    pub fn peer_public_key(&self, group_id: GroupId, peer_id: PeerId) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let chat = self.chats.get(&group_id)?;
        let handle = chat.peers.find_by_peer_id(peer_id)?;
        chat.peers.get(handle).map(|peer| peer.enc_pk)
    }

    /// 2 for a direct UDP path, 1 for a relayed path, None for unknown ids.
    pub fn peer_connection_status(&self, group_id: GroupId, peer_id: PeerId, now_ms: u64) -> Option<u8> {
        let chat = self.chats.get(&group_id)?;
        let handle = chat.peers.find_by_peer_id(peer_id)?;
        let peer = chat.peers.get(handle)?;
        Some(match peer.connection.preferred_transport(now_ms) {
            Transport::Udp => 2,
            Transport::Tcp => 1,
            Transport::None => 0,
        })
    }
}
