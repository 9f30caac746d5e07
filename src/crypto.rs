//! Password-derived room-name and symmetric-key derivation, and the AES-GCM
//! frame sealing used by the encrypting transport.
//!
//! Grounded on `examples/other_examples/398581c2_Kimjaechol-MoA_new__src-memory-sync.rs.rs`'s
//! `derive_key`/`encrypt_deltas`/`decrypt_payload` shape.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const PRODUCT_TAG: &str = "sync-engine";
const ROOM_NAME_INFO: &[u8] = b"sync-engine:room-name";
const ENCRYPTION_KEY_INFO: &[u8] = b"sync-engine:encryption-key";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("frame too short to contain a nonce")]
    FrameTooShort,
    #[error("frame failed authentication")]
    AuthenticationFailed,
}

/// Derive the relay-visible room name: a hex-encoded PBKDF2-HMAC-SHA256 digest
/// over the password, salted with a string that mixes in the room id's own
/// length so two room ids that happen to be prefixes of one another never
/// collide on the salt.
pub fn derive_room_name(
    room_id: &str,
    password: &str,
    iterations: u32,
) -> Result<String, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    if room_id.is_empty() {
        return Err(CryptoError::EmptyRoomId);
    }
    let salt = salt_template(room_id);
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        &domain_separated_password(password, ROOM_NAME_INFO),
        salt.as_bytes(),
        iterations,
        &mut out,
    );
    Ok(hex::encode(out))
}

/// Derive the AES-GCM 256-bit encryption key from the same inputs, using a
/// distinct domain-separation suffix so the room name and the encryption key
/// are independent even though they share a KDF and salt template.
pub fn derive_encryption_key(
    room_id: &str,
    password: &str,
    iterations: u32,
) -> Result<[u8; 32], CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::EmptyPassword);
    }
    if room_id.is_empty() {
        return Err(CryptoError::EmptyRoomId);
    }
    let salt = salt_template(room_id);
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        &domain_separated_password(password, ENCRYPTION_KEY_INFO),
        salt.as_bytes(),
        iterations,
        &mut out,
    );
    Ok(out)
}

fn salt_template(room_id: &str) -> String {
    format!("{PRODUCT_TAG}:{}:{room_id}", room_id.len())
}

fn domain_separated_password(password: &str, info: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(password.len() + info.len());
    bytes.extend_from_slice(password.as_bytes());
    bytes.extend_from_slice(info);
    bytes
}

/// Seal a plaintext frame: random 12-byte nonce, AES-256-GCM ciphertext+tag,
/// laid out as `nonce || ciphertext`.
pub fn seal_frame(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption over a freshly generated nonce cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Open a sealed frame. Fails closed: any authentication failure or malformed
/// framing returns an error rather than partial or garbage plaintext.
pub fn open_frame(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < NONCE_LEN {
        return Err(CryptoError::FrameTooShort);
    }
    let (nonce_bytes, ciphertext) = frame.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_is_deterministic_across_calls() {
        let a = derive_room_name("room-1", "correct-horse", 210_000).unwrap();
        let b = derive_room_name("room-1", "correct-horse", 210_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn room_name_differs_for_different_passwords() {
        let a = derive_room_name("room-1", "password-a", 210_000).unwrap();
        let b = derive_room_name("room-1", "password-b", 210_000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn room_name_differs_for_different_room_ids() {
        let a = derive_room_name("room-1", "same-password", 210_000).unwrap();
        let b = derive_room_name("room-2", "same-password", 210_000).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            derive_room_name("room-1", "", 210_000),
            Err(CryptoError::EmptyPassword)
        ));
        assert!(matches!(
            derive_encryption_key("room-1", "", 210_000),
            Err(CryptoError::EmptyPassword)
        ));
    }

    #[test]
    fn seal_and_open_frame_round_trips() {
        let key = derive_encryption_key("room-1", "correct-horse", 1000).unwrap();
        let sealed = seal_frame(&key, b"hello peer");
        let opened = open_frame(&key, &sealed).unwrap();
        assert_eq!(opened, b"hello peer");
    }

    #[test]
    fn corrupt_frame_fails_closed() {
        let key = derive_encryption_key("room-1", "correct-horse", 1000).unwrap();
        let mut sealed = seal_frame(&key, b"hello peer");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            open_frame(&key, &sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let key_a = derive_encryption_key("room-1", "password-a", 1000).unwrap();
        let key_b = derive_encryption_key("room-1", "password-b", 1000).unwrap();
        let sealed = seal_frame(&key_a, b"hello peer");
        assert!(open_frame(&key_b, &sealed).is_err());
    }
}
