//! Key material and primitive operations for the group session engine.
//!
//! Every participant carries an extended key: an X25519 encryption keypair
//! used for AEAD framing and session-key agreement, plus an Ed25519 signing
//! keypair used for state authority (shared state, moderation, topics).
//! A group's chat ID is the founder's Ed25519 public key.
//!
//! All secret material is zeroized on drop. Session keys are derived via
//! X25519 followed by HKDF-SHA256 so that a leaked transport key never
//! equals the raw DH output.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;
pub const NONCE_SIZE: usize = 24;
pub const MAC_SIZE: usize = 16;
pub const HASH_SIZE: usize = 32;
pub const SHARED_KEY_SIZE: usize = 32;

/// Domain separator for session-key expansion.
const SESSION_KEY_INFO: &[u8] = b"huddle group session key v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("key derivation failed")]
    Kdf,
}

/// Public half of an extended key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    pub enc: [u8; PUBLIC_KEY_SIZE],
    pub sign: [u8; PUBLIC_KEY_SIZE],
}

/// X25519 encryption keypair plus Ed25519 signing keypair.
///
/// For the group founder the signing public key doubles as the chat ID.
pub struct ExtendedKeyPair {
    enc_secret: x25519_dalek::StaticSecret,
    enc_public: [u8; PUBLIC_KEY_SIZE],
    sign: SigningKey,
}

impl ExtendedKeyPair {
    pub fn generate() -> Self {
        let enc_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let enc_public = x25519_dalek::PublicKey::from(&enc_secret).to_bytes();
        let sign = SigningKey::generate(&mut OsRng);
        Self { enc_secret, enc_public, sign }
    }

    pub fn from_bytes(enc_secret: [u8; SECRET_KEY_SIZE], sign_secret: [u8; SECRET_KEY_SIZE]) -> Self {
        let enc_secret = x25519_dalek::StaticSecret::from(enc_secret);
        let enc_public = x25519_dalek::PublicKey::from(&enc_secret).to_bytes();
        let sign = SigningKey::from_bytes(&sign_secret);
        Self { enc_secret, enc_public, sign }
    }

    pub fn public(&self) -> ExtendedPublicKey {
        ExtendedPublicKey {
            enc: self.enc_public,
            sign: self.sign.verifying_key().to_bytes(),
        }
    }

    pub fn enc_public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.enc_public
    }

    pub fn sign_public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.sign.verifying_key().to_bytes()
    }

    pub fn enc_secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.enc_secret.to_bytes()
    }

    pub fn sign_secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.sign.to_bytes()
    }

    /// Signs `message` with the Ed25519 half.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.sign.sign(message).to_bytes()
    }

    /// Derives the symmetric session key shared with `peer_enc_pk`.
    pub fn derive_session_key(&self, peer_enc_pk: &[u8; PUBLIC_KEY_SIZE]) -> Result<SessionKey, CryptoError> {
        derive_session_key(&self.enc_secret, peer_enc_pk)
    }
}

/// Symmetric key shared with one peer, scrubbed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SHARED_KEY_SIZE]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.0
    }

    #[cfg(test)]
    pub fn from_bytes(bytes: [u8; SHARED_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// X25519 agreement followed by HKDF-SHA256 expansion.
///
/// Both sides derive the same key: the DH output is symmetric and the info
/// string is fixed.
pub fn derive_session_key(
    our_secret: &x25519_dalek::StaticSecret,
    peer_enc_pk: &[u8; PUBLIC_KEY_SIZE],
) -> Result<SessionKey, CryptoError> {
    let peer_public = x25519_dalek::PublicKey::from(*peer_enc_pk);
    let shared = our_secret.diffie_hellman(&peer_public);
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; SHARED_KEY_SIZE];
    hk.expand(SESSION_KEY_INFO, &mut okm).map_err(|_| CryptoError::Kdf)?;
    Ok(SessionKey(okm))
}

/// Seals `plaintext` under `key` and `nonce`. Output is ciphertext plus a
/// 16-byte MAC.
pub fn seal(key: &SessionKey, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    // XChaCha20-Poly1305 encryption cannot fail for any plaintext length we
    // produce; the aead error type carries no detail either way.
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .unwrap_or_default()
}

/// Opens a sealed box. Fails on MAC mismatch or truncated input.
pub fn open(key: &SessionKey, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < MAC_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

pub fn verify(public_key: &[u8; PUBLIC_KEY_SIZE], message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    let vk = match VerifyingKey::from_bytes(public_key) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(signature);
    vk.verify_strict(message, &sig).is_ok()
}

pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

/// Constant-time comparison for keys and other fixed-size identifiers.
pub fn pk_equal(a: &[u8; PUBLIC_KEY_SIZE], b: &[u8; PUBLIC_KEY_SIZE]) -> bool {
    a.ct_eq(b).into()
}

pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Short fingerprint for log lines.
pub fn fingerprint(pk: &[u8; PUBLIC_KEY_SIZE]) -> String {
    hex::encode(&pk[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_keypair_roundtrip() {
        let kp = ExtendedKeyPair::generate();
        let restored = ExtendedKeyPair::from_bytes(kp.enc_secret_bytes(), kp.sign_secret_bytes());
        assert_eq!(kp.public(), restored.public());
    }

    #[test]
    fn test_session_key_agreement() {
        let alice = ExtendedKeyPair::generate();
        let bob = ExtendedKeyPair::generate();

        let k1 = alice.derive_session_key(bob.enc_public_key()).unwrap();
        let k2 = bob.derive_session_key(alice.enc_public_key()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let eve = ExtendedKeyPair::generate();
        let k3 = eve.derive_session_key(alice.enc_public_key()).unwrap();
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let alice = ExtendedKeyPair::generate();
        let bob = ExtendedKeyPair::generate();
        let key = alice.derive_session_key(bob.enc_public_key()).unwrap();

        let nonce = random_nonce();
        let sealed = seal(&key, &nonce, b"sealed payload");
        assert_eq!(sealed.len(), b"sealed payload".len() + MAC_SIZE);

        let opened = open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"sealed payload");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let alice = ExtendedKeyPair::generate();
        let bob = ExtendedKeyPair::generate();
        let key = alice.derive_session_key(bob.enc_public_key()).unwrap();

        let nonce = random_nonce();
        let mut sealed = seal(&key, &nonce, b"payload");
        sealed[0] ^= 0x01;
        assert_eq!(open(&key, &nonce, &sealed), Err(CryptoError::Decrypt));

        // Wrong key fails too
        let other = ExtendedKeyPair::generate();
        let wrong = other.derive_session_key(bob.enc_public_key()).unwrap();
        let sealed = seal(&key, &nonce, b"payload");
        assert_eq!(open(&wrong, &nonce, &sealed), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_sign_verify() {
        let kp = ExtendedKeyPair::generate();
        let sig = kp.sign(b"state v3");
        assert!(verify(&kp.sign_public_key(), b"state v3", &sig));
        assert!(!verify(&kp.sign_public_key(), b"state v4", &sig));

        let other = ExtendedKeyPair::generate();
        assert!(!verify(&other.sign_public_key(), b"state v3", &sig));
    }

    #[test]
    fn test_pk_equal() {
        let a = ExtendedKeyPair::generate().public().enc;
        let mut b = a;
        assert!(pk_equal(&a, &b));
        b[31] ^= 0xff;
        assert!(!pk_equal(&a, &b));
    }
}
