pub mod crypto;
pub mod group;

pub use crypto::{ExtendedKeyPair, ExtendedPublicKey, SessionKey};
pub use group::{
    EventSink, GroupEvent, GroupSession, GroupTransport, SessionConfig,
    ChatId, GroupId, IpPort, NodeInfo, PeerId, TcpRelay,
    PrivacyState, Role, PeerStatus, TopicLock, ExitType, JoinFail, ModEvent, MessageKind,
};
