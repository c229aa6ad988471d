//! Founder-signed shared state, moderator list, sanctions and topic.
//!
//! Only the founder's signature makes group configuration authoritative;
//! the verification key for shared state and the moderator list is the chat
//! ID itself. Sanctions are issued by moderators and are individually
//! verifiable; a founder-signed credentials block versions the list as a
//! whole. A peer's role is never stored or gossiped: it is derived from the
//! adopted state, so adopting new state is the only way a role can change.

use super::types::{
    ChatId, ModEvent, PrivacyState, Role, TopicLock, MAX_GROUP_MODERATORS, MAX_GROUP_NAME_LEN,
    MAX_PASSWORD_LEN, MAX_SANCTIONS, MAX_TOPIC_LEN, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::crypto::{self, ExtendedKeyPair, HASH_SIZE};
use zeroize::Zeroize;

// =============================================================================
// SHARED STATE
// =============================================================================

/// Founder-signed group configuration.
///
/// The signed wire layout is fixed:
///
/// ```text
/// [ version:4 ][ founder_sign_pk:32 ][ chat_id:32 ][ privacy_state:1 ]
/// [ peer_limit:4 ][ password_hash:32 ][ mod_list_hash:32 ]
/// [ group_name_len:2 ][ group_name:L ][ topic_lock:1 ][ maintainer_sign_pk:32 ]
/// ```
///
/// followed by a 64-byte founder signature. The packet body then carries
/// `[password_len:2][password:32]`; the trailing password travels inside the
/// sealed channel and is accepted only if its SHA-256 equals the signed
/// `password_hash`, anchoring it to the founder signature without changing
/// the signed layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    pub version: u32,
    pub founder_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub chat_id: ChatId,
    pub privacy: PrivacyState,
    pub peer_limit: u32,
    pub password_hash: [u8; HASH_SIZE],
    pub mod_list_hash: [u8; HASH_SIZE],
    pub group_name: Vec<u8>,
    pub topic_lock: TopicLock,
    pub maintainer_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
    /// Cleartext password, never part of the signed payload.
    pub password: Vec<u8>,
}

impl Drop for SharedState {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl SharedState {
    /// Initial state for a freshly founded group, version 1, signed.
    pub fn new_founded(
        founder: &ExtendedKeyPair,
        group_name: Vec<u8>,
        privacy: PrivacyState,
        peer_limit: u32,
    ) -> Self {
        let founder_sign_pk = founder.sign_public_key();
        let mut state = Self {
            version: 1,
            founder_sign_pk,
            chat_id: founder_sign_pk,
            privacy,
            peer_limit,
            password_hash: [0; HASH_SIZE],
            mod_list_hash: [0; HASH_SIZE],
            group_name,
            topic_lock: TopicLock::Enabled,
            maintainer_sign_pk: founder_sign_pk,
            signature: [0; SIGNATURE_SIZE],
            password: Vec::new(),
        };
        state.resign(founder);
        state
    }

    /// Empty placeholder adopted before the first sync with the group.
    pub fn new_joining(chat_id: ChatId) -> Self {
        Self {
            version: 0,
            founder_sign_pk: chat_id,
            chat_id,
            privacy: PrivacyState::Public,
            peer_limit: u32::MAX,
            password_hash: [0; HASH_SIZE],
            mod_list_hash: [0; HASH_SIZE],
            group_name: Vec::new(),
            topic_lock: TopicLock::Enabled,
            maintainer_sign_pk: chat_id,
            signature: [0; SIGNATURE_SIZE],
            password: Vec::new(),
        }
    }

    pub fn has_password(&self) -> bool {
        self.password_hash != [0; HASH_SIZE]
    }

    /// Sets the password fields; the caller bumps the version and re-signs.
    pub fn set_password(&mut self, password: &[u8]) {
        self.password = password.to_vec();
        self.password_hash = if password.is_empty() {
            [0; HASH_SIZE]
        } else {
            crypto::sha256(password)
        };
    }

    /// The signed portion of the wire layout.
    pub fn pack_signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(140 + self.group_name.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.founder_sign_pk);
        out.extend_from_slice(&self.chat_id);
        out.push(self.privacy as u8);
        out.extend_from_slice(&self.peer_limit.to_be_bytes());
        out.extend_from_slice(&self.password_hash);
        out.extend_from_slice(&self.mod_list_hash);
        out.extend_from_slice(&(self.group_name.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.group_name);
        out.push(self.topic_lock as u8);
        out.extend_from_slice(&self.maintainer_sign_pk);
        out
    }

    /// Bumps the version and re-signs with the founder key.
    pub fn bump_and_resign(&mut self, founder: &ExtendedKeyPair) {
        self.version += 1;
        self.maintainer_sign_pk = founder.sign_public_key();
        self.resign(founder);
    }

    fn resign(&mut self, founder: &ExtendedKeyPair) {
        self.signature = founder.sign(&self.pack_signed_payload());
    }

    /// Verifies the founder signature under the chat ID.
    pub fn verify(&self) -> bool {
        crypto::verify(&self.chat_id, &self.pack_signed_payload(), &self.signature)
    }

    /// Full packet body: signed payload, signature, sealed password trailer.
    pub fn pack_packet(&self) -> Vec<u8> {
        let mut out = self.pack_signed_payload();
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.password.len() as u16).to_be_bytes());
        let mut padded = [0u8; MAX_PASSWORD_LEN];
        padded[..self.password.len()].copy_from_slice(&self.password);
        out.extend_from_slice(&padded);
        out
    }

    /// Parses a packet body. Checks structure and the password trailer
    /// against the signed hash; the signature is verified separately so the
    /// caller can distinguish malformed from forged.
    pub fn unpack_packet(body: &[u8]) -> Option<Self> {
        let version = u32::from_be_bytes(body.get(..4)?.try_into().ok()?);
        let mut offset = 4;
        let founder_sign_pk: [u8; PUBLIC_KEY_SIZE] =
            body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let chat_id: ChatId = body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let privacy = PrivacyState::from_u8(*body.get(offset)?)?;
        offset += 1;
        let peer_limit = u32::from_be_bytes(body.get(offset..offset + 4)?.try_into().ok()?);
        offset += 4;
        let password_hash: [u8; HASH_SIZE] = body.get(offset..offset + HASH_SIZE)?.try_into().ok()?;
        offset += HASH_SIZE;
        let mod_list_hash: [u8; HASH_SIZE] = body.get(offset..offset + HASH_SIZE)?.try_into().ok()?;
        offset += HASH_SIZE;
        let name_len = u16::from_be_bytes(body.get(offset..offset + 2)?.try_into().ok()?) as usize;
        if name_len > MAX_GROUP_NAME_LEN {
            return None;
        }
        offset += 2;
        let group_name = body.get(offset..offset + name_len)?.to_vec();
        offset += name_len;
        let topic_lock = TopicLock::from_u8(*body.get(offset)?)?;
        offset += 1;
        let maintainer_sign_pk: [u8; PUBLIC_KEY_SIZE] =
            body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let signature: [u8; SIGNATURE_SIZE] =
            body.get(offset..offset + SIGNATURE_SIZE)?.try_into().ok()?;
        offset += SIGNATURE_SIZE;
        let pw_len = u16::from_be_bytes(body.get(offset..offset + 2)?.try_into().ok()?) as usize;
        if pw_len > MAX_PASSWORD_LEN {
            return None;
        }
        offset += 2;
        let padded = body.get(offset..offset + MAX_PASSWORD_LEN)?;
        if body.len() != offset + MAX_PASSWORD_LEN {
            return None;
        }
        let password = padded[..pw_len].to_vec();

        // The trailing password must match the signed hash.
        if pw_len == 0 {
            if password_hash != [0; HASH_SIZE] {
                return None;
            }
        } else if crypto::sha256(&password) != password_hash {
            return None;
        }

        Some(Self {
            version,
            founder_sign_pk,
            chat_id,
            privacy,
            peer_limit,
            password_hash,
            mod_list_hash,
            group_name,
            topic_lock,
            maintainer_sign_pk,
            signature,
            password,
        })
    }
}

// =============================================================================
// MODERATOR LIST
// =============================================================================

/// Ordered set of moderator signing keys, signed by the founder as a block.
///
/// Wire body: `[version:4][count:2][sign_pk...][signature:64]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModList {
    pub version: u32,
    pub mods: Vec<[u8; PUBLIC_KEY_SIZE]>,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for ModList {
    fn default() -> Self {
        Self { version: 0, mods: Vec::new(), signature: [0; SIGNATURE_SIZE] }
    }
}

impl ModList {
    pub fn contains(&self, sign_pk: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.mods.iter().any(|pk| pk == sign_pk)
    }

    /// SHA-256 over the packed key block, pinned into the shared state.
    pub fn hash(&self) -> [u8; HASH_SIZE] {
        if self.mods.is_empty() {
            return [0; HASH_SIZE];
        }
        let mut packed = Vec::with_capacity(self.mods.len() * PUBLIC_KEY_SIZE);
        for pk in &self.mods {
            packed.extend_from_slice(pk);
        }
        crypto::sha256(&packed)
    }

    fn sign_data(&self, chat_id: &ChatId) -> Vec<u8> {
        let mut data = Vec::with_capacity(CHAT_ID_AND_VERSION + self.mods.len() * PUBLIC_KEY_SIZE);
        data.extend_from_slice(chat_id);
        data.extend_from_slice(&self.version.to_be_bytes());
        for pk in &self.mods {
            data.extend_from_slice(pk);
        }
        data
    }

    /// Adds or removes a moderator, bumps the version and re-signs.
    /// Founder-only; the caller enforces the role.
    pub fn set_mod(
        &mut self,
        founder: &ExtendedKeyPair,
        chat_id: &ChatId,
        target_sign_pk: [u8; PUBLIC_KEY_SIZE],
        promote: bool,
    ) -> bool {
        let changed = if promote {
            if self.contains(&target_sign_pk) || self.mods.len() >= MAX_GROUP_MODERATORS {
                false
            } else {
                self.mods.push(target_sign_pk);
                true
            }
        } else {
            let before = self.mods.len();
            self.mods.retain(|pk| pk != &target_sign_pk);
            self.mods.len() != before
        };
        if changed {
            self.version += 1;
            self.signature = founder.sign(&self.sign_data(chat_id));
        }
        changed
    }

    pub fn resign(&mut self, founder: &ExtendedKeyPair, chat_id: &ChatId) {
        self.signature = founder.sign(&self.sign_data(chat_id));
    }

    pub fn verify(&self, chat_id: &ChatId) -> bool {
        crypto::verify(chat_id, &self.sign_data(chat_id), &self.signature)
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.mods.len() * PUBLIC_KEY_SIZE + SIGNATURE_SIZE);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.mods.len() as u16).to_be_bytes());
        for pk in &self.mods {
            out.extend_from_slice(pk);
        }
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unpack(body: &[u8]) -> Option<Self> {
        let version = u32::from_be_bytes(body.get(..4)?.try_into().ok()?);
        let count = u16::from_be_bytes(body.get(4..6)?.try_into().ok()?) as usize;
        if count > MAX_GROUP_MODERATORS {
            return None;
        }
        let mut offset = 6;
        let mut mods = Vec::with_capacity(count);
        for _ in 0..count {
            let pk: [u8; PUBLIC_KEY_SIZE] =
                body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
            mods.push(pk);
            offset += PUBLIC_KEY_SIZE;
        }
        let signature: [u8; SIGNATURE_SIZE] =
            body.get(offset..offset + SIGNATURE_SIZE)?.try_into().ok()?;
        if body.len() != offset + SIGNATURE_SIZE {
            return None;
        }
        Some(Self { version, mods, signature })
    }
}

const CHAT_ID_AND_VERSION: usize = PUBLIC_KEY_SIZE + 4;

// =============================================================================
// SANCTIONS
// =============================================================================

/// One observer demotion, individually signed by its issuer.
///
/// Wire: `[target_sign_pk:32][issuer_sign_pk:32][timestamp:8][signature:64]`.
/// The chat ID is appended to the signed data (not the wire) so a sanction
/// cannot be replayed into another group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanctionEntry {
    pub target_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub issuer_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub timestamp_ms: u64,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SanctionEntry {
    pub fn new(
        issuer: &ExtendedKeyPair,
        chat_id: &ChatId,
        target_sign_pk: [u8; PUBLIC_KEY_SIZE],
        timestamp_ms: u64,
    ) -> Self {
        let issuer_sign_pk = issuer.sign_public_key();
        let mut entry = Self { target_sign_pk, issuer_sign_pk, timestamp_ms, signature: [0; 64] };
        entry.signature = issuer.sign(&entry.sign_data(chat_id));
        entry
    }

    fn sign_data(&self, chat_id: &ChatId) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 * PUBLIC_KEY_SIZE + 8 + PUBLIC_KEY_SIZE);
        data.extend_from_slice(&self.target_sign_pk);
        data.extend_from_slice(&self.issuer_sign_pk);
        data.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        data.extend_from_slice(chat_id);
        data
    }

    pub fn verify(&self, chat_id: &ChatId) -> bool {
        crypto::verify(&self.issuer_sign_pk, &self.sign_data(chat_id), &self.signature)
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.target_sign_pk);
        out.extend_from_slice(&self.issuer_sign_pk);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.signature);
    }

    fn unpack(data: &[u8]) -> Option<(Self, usize)> {
        let target_sign_pk: [u8; PUBLIC_KEY_SIZE] = data.get(..32)?.try_into().ok()?;
        let issuer_sign_pk: [u8; PUBLIC_KEY_SIZE] = data.get(32..64)?.try_into().ok()?;
        let timestamp_ms = u64::from_be_bytes(data.get(64..72)?.try_into().ok()?);
        let signature: [u8; SIGNATURE_SIZE] = data.get(72..136)?.try_into().ok()?;
        Some((Self { target_sign_pk, issuer_sign_pk, timestamp_ms, signature }, 136))
    }
}

/// Founder-rooted credentials binding a sanctions list to a version.
///
/// Wire: `[version:4][hash:32][issuer_sign_pk:32][signature:64]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanctionsCredentials {
    pub version: u32,
    pub hash: [u8; HASH_SIZE],
    pub issuer_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for SanctionsCredentials {
    fn default() -> Self {
        Self {
            version: 0,
            hash: [0; HASH_SIZE],
            issuer_sign_pk: [0; PUBLIC_KEY_SIZE],
            signature: [0; SIGNATURE_SIZE],
        }
    }
}

/// The sanctions list plus its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SanctionsList {
    pub entries: Vec<SanctionEntry>,
    pub credentials: SanctionsCredentials,
}

impl SanctionsList {
    pub fn is_observer(&self, sign_pk: &[u8; PUBLIC_KEY_SIZE]) -> bool {
        self.entries.iter().any(|entry| &entry.target_sign_pk == sign_pk)
    }

    pub fn hash(&self) -> [u8; HASH_SIZE] {
        if self.entries.is_empty() {
            return [0; HASH_SIZE];
        }
        let mut packed = Vec::with_capacity(self.entries.len() * 136);
        for entry in &self.entries {
            entry.pack(&mut packed);
        }
        crypto::sha256(&packed)
    }

    fn credentials_sign_data(version: u32, hash: &[u8; HASH_SIZE], chat_id: &ChatId) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + HASH_SIZE + PUBLIC_KEY_SIZE);
        data.extend_from_slice(&version.to_be_bytes());
        data.extend_from_slice(hash);
        data.extend_from_slice(chat_id);
        data
    }

    /// Re-issues credentials after a mutation. The issuer must be a
    /// moderator or the founder; the caller enforces the role.
    pub fn reissue_credentials(&mut self, issuer: &ExtendedKeyPair, chat_id: &ChatId) {
        let version = self.credentials.version + 1;
        let hash = self.hash();
        self.credentials = SanctionsCredentials {
            version,
            hash,
            issuer_sign_pk: issuer.sign_public_key(),
            signature: issuer.sign(&Self::credentials_sign_data(version, &hash, chat_id)),
        };
    }

    /// Verifies every entry signature and the credentials block. The
    /// credential issuer's authority is checked by the caller against the
    /// adopted moderator list.
    pub fn verify(&self, chat_id: &ChatId) -> bool {
        if !self.entries.iter().all(|entry| entry.verify(chat_id)) {
            return false;
        }
        if self.credentials.version == 0 && self.entries.is_empty() {
            // Pristine list needs no credentials.
            return true;
        }
        if self.credentials.hash != self.hash() {
            return false;
        }
        crypto::verify(
            &self.credentials.issuer_sign_pk,
            &Self::credentials_sign_data(self.credentials.version, &self.credentials.hash, chat_id),
            &self.credentials.signature,
        )
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.entries.len() * 136 + 132);
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries {
            entry.pack(&mut out);
        }
        out.extend_from_slice(&self.credentials.version.to_be_bytes());
        out.extend_from_slice(&self.credentials.hash);
        out.extend_from_slice(&self.credentials.issuer_sign_pk);
        out.extend_from_slice(&self.credentials.signature);
        out
    }

    pub fn unpack(body: &[u8]) -> Option<Self> {
        let count = u16::from_be_bytes(body.get(..2)?.try_into().ok()?) as usize;
        if count > MAX_SANCTIONS {
            return None;
        }
        let mut offset = 2;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (entry, used) = SanctionEntry::unpack(body.get(offset..)?)?;
            entries.push(entry);
            offset += used;
        }
        let version = u32::from_be_bytes(body.get(offset..offset + 4)?.try_into().ok()?);
        offset += 4;
        let hash: [u8; HASH_SIZE] = body.get(offset..offset + HASH_SIZE)?.try_into().ok()?;
        offset += HASH_SIZE;
        let issuer_sign_pk: [u8; PUBLIC_KEY_SIZE] =
            body.get(offset..offset + PUBLIC_KEY_SIZE)?.try_into().ok()?;
        offset += PUBLIC_KEY_SIZE;
        let signature: [u8; SIGNATURE_SIZE] =
            body.get(offset..offset + SIGNATURE_SIZE)?.try_into().ok()?;
        if body.len() != offset + SIGNATURE_SIZE {
            return None;
        }
        Some(Self {
            entries,
            credentials: SanctionsCredentials { version, hash, issuer_sign_pk, signature },
        })
    }
}

// =============================================================================
// TOPIC
// =============================================================================

/// The group topic, signed by its setter.
///
/// Wire: `[version:4][setter_sign_pk:32][topic_len:2][topic][signature:64]`.
/// The signature covers `[version:4][topic][chat_id:32]` so a topic cannot
/// be replayed across versions or groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub version: u32,
    pub topic: Vec<u8>,
    pub setter_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for TopicInfo {
    fn default() -> Self {
        Self {
            version: 0,
            topic: Vec::new(),
            setter_sign_pk: [0; PUBLIC_KEY_SIZE],
            signature: [0; SIGNATURE_SIZE],
        }
    }
}

impl TopicInfo {
    pub fn new_signed(
        setter: &ExtendedKeyPair,
        chat_id: &ChatId,
        version: u32,
        topic: Vec<u8>,
    ) -> Self {
        let mut info = Self {
            version,
            topic,
            setter_sign_pk: setter.sign_public_key(),
            signature: [0; SIGNATURE_SIZE],
        };
        info.signature = setter.sign(&info.sign_data(chat_id));
        info
    }

    fn sign_data(&self, chat_id: &ChatId) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.topic.len() + PUBLIC_KEY_SIZE);
        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(&self.topic);
        data.extend_from_slice(chat_id);
        data
    }

    pub fn verify(&self, chat_id: &ChatId) -> bool {
        crypto::verify(&self.setter_sign_pk, &self.sign_data(chat_id), &self.signature)
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + PUBLIC_KEY_SIZE + 2 + self.topic.len() + SIGNATURE_SIZE);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.setter_sign_pk);
        out.extend_from_slice(&(self.topic.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.topic);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unpack(body: &[u8]) -> Option<Self> {
        let version = u32::from_be_bytes(body.get(..4)?.try_into().ok()?);
        let setter_sign_pk: [u8; PUBLIC_KEY_SIZE] = body.get(4..36)?.try_into().ok()?;
        let topic_len = u16::from_be_bytes(body.get(36..38)?.try_into().ok()?) as usize;
        if topic_len > MAX_TOPIC_LEN {
            return None;
        }
        let topic = body.get(38..38 + topic_len)?.to_vec();
        let offset = 38 + topic_len;
        let signature: [u8; SIGNATURE_SIZE] =
            body.get(offset..offset + SIGNATURE_SIZE)?.try_into().ok()?;
        if body.len() != offset + SIGNATURE_SIZE {
            return None;
        }
        Some(Self { version, topic, setter_sign_pk, signature })
    }
}

// =============================================================================
// MODERATION EVENTS
// =============================================================================

/// A signed moderation event, broadcast when a peer is kicked, demoted or
/// promoted.
///
/// Wire: `[version:4][target_sign_pk:32][event:1][issuer_sign_pk:32][signature:64]`.
/// The chat ID is appended to the signed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModerationEvent {
    pub version: u32,
    pub target_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub event: ModEvent,
    pub issuer_sign_pk: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl ModerationEvent {
    pub fn new_signed(
        issuer: &ExtendedKeyPair,
        chat_id: &ChatId,
        version: u32,
        target_sign_pk: [u8; PUBLIC_KEY_SIZE],
        event: ModEvent,
    ) -> Self {
        let mut ev = Self {
            version,
            target_sign_pk,
            event,
            issuer_sign_pk: issuer.sign_public_key(),
            signature: [0; SIGNATURE_SIZE],
        };
        ev.signature = issuer.sign(&ev.sign_data(chat_id));
        ev
    }

    fn sign_data(&self, chat_id: &ChatId) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 2 * PUBLIC_KEY_SIZE + 1 + PUBLIC_KEY_SIZE);
        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(&self.target_sign_pk);
        data.push(self.event as u8);
        data.extend_from_slice(&self.issuer_sign_pk);
        data.extend_from_slice(chat_id);
        data
    }

    pub fn verify(&self, chat_id: &ChatId) -> bool {
        crypto::verify(&self.issuer_sign_pk, &self.sign_data(chat_id), &self.signature)
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + PUBLIC_KEY_SIZE + 1 + PUBLIC_KEY_SIZE + SIGNATURE_SIZE);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.target_sign_pk);
        out.push(self.event as u8);
        out.extend_from_slice(&self.issuer_sign_pk);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn unpack(body: &[u8]) -> Option<Self> {
        if body.len() != 4 + 32 + 1 + 32 + SIGNATURE_SIZE {
            return None;
        }
        let version = u32::from_be_bytes(body[..4].try_into().ok()?);
        let target_sign_pk: [u8; PUBLIC_KEY_SIZE] = body[4..36].try_into().ok()?;
        let event = ModEvent::from_u8(body[36])?;
        let issuer_sign_pk: [u8; PUBLIC_KEY_SIZE] = body[37..69].try_into().ok()?;
        let signature: [u8; SIGNATURE_SIZE] = body[69..133].try_into().ok()?;
        Some(Self { version, target_sign_pk, event, issuer_sign_pk, signature })
    }
}

// =============================================================================
// ROLE DERIVATION
// =============================================================================

/// Derives a peer's effective role from the adopted state. Pure function:
/// toggling any input deterministically changes the output.
pub fn derive_role(
    sign_pk: &[u8; PUBLIC_KEY_SIZE],
    chat_id: &ChatId,
    mods: &ModList,
    sanctions: &SanctionsList,
) -> Role {
    if crypto::pk_equal(sign_pk, chat_id) {
        Role::Founder
    } else if mods.contains(sign_pk) {
        Role::Moderator
    } else if sanctions.is_observer(sign_pk) {
        Role::Observer
    } else {
        Role::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn founder() -> ExtendedKeyPair {
        ExtendedKeyPair::generate()
    }

    #[test]
    fn test_shared_state_sign_verify_roundtrip() {
        let fk = founder();
        let state = SharedState::new_founded(&fk, b"Utah Data Center".to_vec(), PrivacyState::Private, 100);
        assert_eq!(state.version, 1);
        assert!(state.verify());

        let body = state.pack_packet();
        let parsed = SharedState::unpack_packet(&body).unwrap();
        assert_eq!(parsed, state);
        assert!(parsed.verify());
    }

    #[test]
    fn test_shared_state_rejects_forged_signature() {
        let fk = founder();
        let mut state = SharedState::new_founded(&fk, b"group".to_vec(), PrivacyState::Public, 50);
        state.peer_limit = 9999;
        // Payload changed after signing: verification must fail.
        assert!(!state.verify());

        // A non-founder cannot produce a valid signature.
        let imposter = founder();
        state.signature = imposter.sign(&state.pack_signed_payload());
        assert!(!state.verify());
    }

    #[test]
    fn test_shared_state_password_trailer_must_match_hash() {
        let fk = founder();
        let mut state = SharedState::new_founded(&fk, b"group".to_vec(), PrivacyState::Private, 50);
        state.set_password(b"hunter2");
        state.bump_and_resign(&fk);

        let parsed = SharedState::unpack_packet(&state.pack_packet()).unwrap();
        assert_eq!(parsed.password, b"hunter2");

        // Tamper with the trailing password only: structure check fails.
        let mut body = state.pack_packet();
        let len = body.len();
        body[len - 1] ^= 0x01;
        let tampered_pw_pos = len - MAX_PASSWORD_LEN;
        body[tampered_pw_pos] ^= 0x01;
        assert!(SharedState::unpack_packet(&body).is_none());
    }

    #[test]
    fn test_mod_list_set_and_verify() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let moderator = founder();
        let mod_pk = moderator.sign_public_key();

        let mut mods = ModList::default();
        assert!(mods.set_mod(&fk, &chat_id, mod_pk, true));
        assert_eq!(mods.version, 1);
        assert!(mods.contains(&mod_pk));
        assert!(mods.verify(&chat_id));

        // Promoting twice is a no-op.
        assert!(!mods.set_mod(&fk, &chat_id, mod_pk, true));

        let parsed = ModList::unpack(&mods.pack()).unwrap();
        assert_eq!(parsed, mods);
        assert!(parsed.verify(&chat_id));

        // Demotion bumps the version again.
        assert!(mods.set_mod(&fk, &chat_id, mod_pk, false));
        assert_eq!(mods.version, 2);
        assert!(!mods.contains(&mod_pk));
    }

    #[test]
    fn test_mod_list_signature_bound_to_chat() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let mut mods = ModList::default();
        mods.set_mod(&fk, &chat_id, founder().sign_public_key(), true);

        let other_chat = founder().sign_public_key();
        assert!(!mods.verify(&other_chat));
    }

    #[test]
    fn test_sanctions_roundtrip_and_verification() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let moderator = founder();
        let target = founder().sign_public_key();

        let mut sanctions = SanctionsList::default();
        sanctions.entries.push(SanctionEntry::new(&moderator, &chat_id, target, 5_000));
        sanctions.reissue_credentials(&moderator, &chat_id);

        assert!(sanctions.is_observer(&target));
        assert!(sanctions.verify(&chat_id));

        let parsed = SanctionsList::unpack(&sanctions.pack()).unwrap();
        assert_eq!(parsed, sanctions);
        assert!(parsed.verify(&chat_id));

        // A tampered entry fails entry verification.
        let mut bad = sanctions.clone();
        bad.entries[0].timestamp_ms += 1;
        assert!(!bad.verify(&chat_id));

        // Stale credentials hash fails.
        let mut stale = sanctions.clone();
        stale.entries.clear();
        assert!(!stale.verify(&chat_id));
    }

    #[test]
    fn test_topic_sign_verify() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let topic = TopicInfo::new_signed(&fk, &chat_id, 3, b"talks at eleven".to_vec());
        assert!(topic.verify(&chat_id));

        let parsed = TopicInfo::unpack(&topic.pack()).unwrap();
        assert_eq!(parsed, topic);

        // Replaying under another chat fails.
        assert!(!topic.verify(&founder().sign_public_key()));

        // Version is covered by the signature.
        let mut bumped = topic.clone();
        bumped.version = 4;
        assert!(!bumped.verify(&chat_id));
    }

    #[test]
    fn test_moderation_event_roundtrip() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let target = founder().sign_public_key();

        let event = ModerationEvent::new_signed(&fk, &chat_id, 2, target, ModEvent::Kick);
        assert!(event.verify(&chat_id));
        let parsed = ModerationEvent::unpack(&event.pack()).unwrap();
        assert_eq!(parsed, event);
        assert!(ModerationEvent::unpack(&event.pack()[..100]).is_none());
    }

    #[test]
    fn test_role_derivation() {
        let fk = founder();
        let chat_id = fk.sign_public_key();
        let moderator = founder().sign_public_key();
        let observer = founder().sign_public_key();
        let user = founder().sign_public_key();

        let mut mods = ModList::default();
        mods.set_mod(&fk, &chat_id, moderator, true);
        let mut sanctions = SanctionsList::default();
        let issuer = founder();
        sanctions.entries.push(SanctionEntry::new(&issuer, &chat_id, observer, 0));

        assert_eq!(derive_role(&chat_id, &chat_id, &mods, &sanctions), Role::Founder);
        assert_eq!(derive_role(&moderator, &chat_id, &mods, &sanctions), Role::Moderator);
        assert_eq!(derive_role(&observer, &chat_id, &mods, &sanctions), Role::Observer);
        assert_eq!(derive_role(&user, &chat_id, &mods, &sanctions), Role::User);

        // The moderator list shadows a sanction on the same key.
        sanctions.entries.push(SanctionEntry::new(&issuer, &chat_id, moderator, 0));
        assert_eq!(derive_role(&moderator, &chat_id, &mods, &sanctions), Role::Moderator);
    }
}
