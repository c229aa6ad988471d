//! Group session engine: membership, shared state, lossless messaging,
//! announce rendezvous and the friend-invite handshake.

pub mod announce;
pub mod chat;
pub mod events;
pub mod invite;
pub mod lossless;
pub mod manager;
pub mod packet;
pub mod peer;
pub mod shared_state;
pub mod types;

// Re-exports
pub use announce::{AnnounceResponder, AnnounceSearcher, GroupAnnounce};
pub use chat::Chat;
pub use events::{EventSink, GroupEvent};
pub use invite::{InviteMessage, InviteAcceptError, InviteFriendError};
pub use lossless::{SendQueue, RecvQueue, RecvOutcome};
pub use manager::{
    GroupSession, GroupTransport, SessionConfig, SavedGroup,
    GroupNewError, GroupJoinError, GroupLeaveError, SendMessageError, TopicSetError,
    ModSetRoleError, FounderSetError, ToggleIgnoreError, KickPeerError, ReconnectError,
};
pub use peer::{PeerHandle, PeerList, PeerRecord};
pub use shared_state::{ModList, SanctionsList, SharedState, TopicInfo};
pub use types::*;
