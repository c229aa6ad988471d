//! Friend-channel group invites.
//!
//! Three messages travel over the external messenger layer:
//!
//! 1. `Invite` from the inviter: chat ID and group name.
//! 2. `InviteAccepted` from the invitee: its per-group keys and nickname.
//! 3. `InviteConfirmation` from the inviter: reachability (direct address
//!    and TCP relays).
//!
//! After step 3 the invitee opens a direct connection to the inviter and
//! the normal group handshake runs inside the group packet channel. Blobs
//! are encoded with postcard; the friend channel is already authenticated
//! and encrypted by the messenger, so no framing or sealing happens here.

use super::types::{ChatId, IpPort, TcpRelay, MAX_GROUP_NAME_LEN, MAX_NICK_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InviteFriendError {
    #[error("group not found")]
    GroupNotFound,
    #[error("friend channel refused the invite packet")]
    FailSend,
    #[error("group is disconnected")]
    Disconnected,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InviteAcceptError {
    #[error("malformed invite data")]
    BadInvite,
    #[error("group instance failed to initialize")]
    InitFailed,
    #[error("nickname too long")]
    TooLong,
    #[error("nickname is empty")]
    Empty,
    #[error("password too long")]
    Password,
    #[error("friend channel refused the accept packet")]
    FailSend,
}

/// Messenger-level invite messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteMessage {
    /// Step 1, inviter -> invitee.
    Invite { chat_id: ChatId, group_name: Vec<u8> },
    /// Step 2, invitee -> inviter.
    InviteAccepted {
        chat_id: ChatId,
        invitee_enc_pk: [u8; 32],
        invitee_sign_pk: [u8; 32],
        nick: Vec<u8>,
    },
    /// Step 3, inviter -> invitee.
    InviteConfirmation {
        chat_id: ChatId,
        inviter_enc_pk: [u8; 32],
        inviter_sign_pk: [u8; 32],
        ip_port: Option<IpPort>,
        tcp_relays: Vec<TcpRelay>,
    },
}

impl InviteMessage {
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Decodes and applies structural bounds. Anything oversized or
    /// trailing is rejected.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let message: Self = postcard::from_bytes(data).ok()?;
        match &message {
            InviteMessage::Invite { group_name, .. } if group_name.len() > MAX_GROUP_NAME_LEN => None,
            InviteMessage::InviteAccepted { nick, .. } if nick.len() > MAX_NICK_LEN => None,
            InviteMessage::InviteConfirmation { ip_port, tcp_relays, .. }
                if ip_port.is_none() && tcp_relays.is_empty() =>
            {
                // A confirmation that offers no route is useless.
                None
            }
            _ => Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_invite_roundtrip() {
        let invite = InviteMessage::Invite { chat_id: [7; 32], group_name: b"Utah Data Center".to_vec() };
        assert_eq!(InviteMessage::decode(&invite.encode()), Some(invite));
    }

    #[test]
    fn test_accept_roundtrip() {
        let accepted = InviteMessage::InviteAccepted {
            chat_id: [7; 32],
            invitee_enc_pk: [1; 32],
            invitee_sign_pk: [2; 32],
            nick: b"Victor".to_vec(),
        };
        assert_eq!(InviteMessage::decode(&accepted.encode()), Some(accepted));
    }

    #[test]
    fn test_confirmation_requires_a_route() {
        let confirmation = InviteMessage::InviteConfirmation {
            chat_id: [7; 32],
            inviter_enc_pk: [1; 32],
            inviter_sign_pk: [2; 32],
            ip_port: None,
            tcp_relays: Vec::new(),
        };
        assert_eq!(InviteMessage::decode(&confirmation.encode()), None);

        let routable = InviteMessage::InviteConfirmation {
            chat_id: [7; 32],
            inviter_enc_pk: [1; 32],
            inviter_sign_pk: [2; 32],
            ip_port: Some(IpPort::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 33445)),
            tcp_relays: Vec::new(),
        };
        assert!(InviteMessage::decode(&routable.encode()).is_some());
    }

    #[test]
    fn test_decode_rejects_garbage_and_oversize() {
        assert_eq!(InviteMessage::decode(b"not postcard at all"), None);

        let oversized = InviteMessage::Invite { chat_id: [7; 32], group_name: vec![b'x'; 64] };
        assert_eq!(InviteMessage::decode(&oversized.encode()), None);
    }
}
