//! User-visible events and the per-session event sink.
//!
//! The engine pushes every user-visible occurrence through one `EventSink`
//! passed at session construction. Tests inject a recording sink; hosts
//! typically translate events into their own callback or channel layer.

use super::types::{
    ExitType, GroupId, JoinFail, MessageKind, ModEvent, PeerId, PeerStatus, PrivacyState,
    TopicLock,
};

/// Everything the engine reports to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A friend sent us a group invite (decoded, not yet accepted).
    Invite { friend_id: u32, group_name: Vec<u8>, invite_data: Vec<u8> },

    /// We are connected to the group: the first peer confirmed.
    SelfJoin,

    /// A peer completed the handshake.
    PeerJoin { peer_id: PeerId },

    /// A peer left, timed out, or was removed.
    PeerExit { peer_id: PeerId, exit_type: ExitType, nick: Vec<u8>, part_message: Vec<u8> },

    /// Our join attempt was rejected by the group.
    JoinFail { fail_type: JoinFail },

    /// A group message addressed to everyone.
    Message { peer_id: PeerId, kind: MessageKind, message: Vec<u8> },

    /// A message addressed to us alone.
    PrivateMessage { peer_id: PeerId, kind: MessageKind, message: Vec<u8> },

    /// An application-defined packet.
    CustomPacket { peer_id: PeerId, data: Vec<u8> },

    /// A peer changed their nickname.
    NickChange { peer_id: PeerId, nick: Vec<u8> },

    /// A peer changed their status.
    StatusChange { peer_id: PeerId, status: PeerStatus },

    /// The topic changed.
    TopicChange { peer_id: Option<PeerId>, topic: Vec<u8> },

    /// A moderation event was applied. `peer_id` is the target when the
    /// target is still present in the roster.
    Moderation { peer_id: Option<PeerId>, event: ModEvent },

    // Shared-state field changes, emitted per differing field on adoption.
    PrivacyStateChange { privacy: PrivacyState },
    PeerLimitChange { peer_limit: u32 },
    PasswordChange { password: Vec<u8> },
    TopicLockChange { topic_lock: TopicLock },
    GroupNameChange { group_name: Vec<u8> },
}

/// Host-provided receiver for engine events.
pub trait EventSink {
    fn on_event(&mut self, group_id: GroupId, event: GroupEvent);
}

/// Sink that drops everything. Useful for tools that only drive the wire.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _group_id: GroupId, _event: GroupEvent) {}
}
