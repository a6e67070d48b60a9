//! Symmetric message encryption for Palisade.
//!
//! Both ends of a conversation derive the same AES-128-GCM key from a shared
//! OTP secret: SHA-256 of the secret's UTF-8 bytes, truncated to the first
//! 16 bytes. Every encryption draws a fresh random 12-byte nonce, and the
//! wire form is `base64(nonce || ciphertext)` where the ciphertext carries
//! the 16-byte GCM tag at its tail.
//!
//! This boundary is the only place plaintext and ciphertext meet — callers
//! hand in plaintext and pass the returned envelope around as an opaque
//! string.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Authentication failed: wrong key, or tampered nonce/ciphertext/tag.
    #[error("decryption failed: authentication error")]
    Authentication,

    /// The envelope is not structurally valid ciphertext.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The decrypted bytes are not valid UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Derives the AES-128 key from a shared OTP secret.
///
/// SHA-256 over the secret's UTF-8 bytes, truncated to [`KEY_SIZE`] bytes.
/// Deterministic: both peers derive the identical key from the same secret.
#[must_use]
pub fn derive_key(otp_secret: &str) -> [u8; KEY_SIZE] {
    let digest = Sha256::digest(otp_secret.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

/// Encrypts a plaintext string under the key derived from `otp_secret`.
///
/// Returns `base64(nonce || ciphertext)`. The nonce is freshly random per
/// call, so encrypting the same plaintext twice yields different envelopes.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptionFailed`] if the AEAD operation fails.
pub fn encrypt(plaintext: &str, otp_secret: &str) -> Result<String, CryptoError> {
    let mut key = derive_key(otp_secret);
    let cipher = Aes128Gcm::new(&key.into());
    key.zeroize();

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut envelope = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Decrypts a `base64(nonce || ciphertext)` envelope.
///
/// # Errors
///
/// - [`CryptoError::InvalidPayload`] if the envelope is not base64 or too
///   short to contain a nonce and tag.
/// - [`CryptoError::Authentication`] if the key is wrong or any byte of the
///   envelope was altered.
/// - [`CryptoError::InvalidUtf8`] if the plaintext is not valid UTF-8.
pub fn decrypt(envelope: &str, otp_secret: &str) -> Result<String, CryptoError> {
    let raw = BASE64
        .decode(envelope)
        .map_err(|e| CryptoError::InvalidPayload(format!("not base64: {e}")))?;
    if raw.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidPayload(format!(
            "envelope too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let mut key = derive_key(otp_secret);
    let cipher = Aes128Gcm::new(&key.into());
    key.zeroize();

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Authentication)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}
