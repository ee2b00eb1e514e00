//! Local symmetric crypto for Warden artifacts.
//!
//! - AES-256-GCM sealing for the credential cache (confidential + authenticated).
//! - HMAC-SHA256 tags for the state and watermark records (authenticated only,
//!   kept human-readable on disk).
//!
//! Keys come from the per-installation secret; see [`crate::client::secret`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use rand::rngs::OsRng;
use rand::TryRngCore;

use ring::hmac;

use crate::errors::{LicenseError, LicenseResult};

/// AES-256 / HMAC key size in bytes.
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Generate a new random 256-bit key from the OS RNG.
pub fn generate_key() -> LicenseResult<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| LicenseError::EncryptionError(format!("OS RNG unavailable: {e}")))?;
    Ok(key)
}

/// Seal `plaintext` with AES-256-GCM, binding `aad` into the tag.
///
/// Output format:
///   [nonce (12 bytes)] || [ciphertext+tag]
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE], aad: &[u8]) -> LicenseResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| LicenseError::EncryptionError(format!("OS RNG unavailable: {e}")))?;

    let mut ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| LicenseError::EncryptionError(format!("encryption failed: {e}")))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.append(&mut ciphertext);
    Ok(output)
}

/// Open bytes produced by [`seal`] with the same key and `aad`.
pub fn open(sealed: &[u8], key: &[u8; KEY_SIZE], aad: &[u8]) -> LicenseResult<Vec<u8>> {
    if sealed.len() <= NONCE_SIZE {
        return Err(LicenseError::DecryptionError(
            "ciphertext too short".to_string(),
        ));
    }

    let (nonce_bytes, ct) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ct, aad })
        .map_err(|e| LicenseError::DecryptionError(format!("decryption failed: {e}")))
}

/// [`seal`] and Base64-encode.
pub fn seal_to_base64(plaintext: &[u8], key: &[u8; KEY_SIZE], aad: &[u8]) -> LicenseResult<String> {
    Ok(B64.encode(seal(plaintext, key, aad)?))
}

/// Decode Base64 and [`open`].
pub fn open_from_base64(sealed_b64: &str, key: &[u8; KEY_SIZE], aad: &[u8]) -> LicenseResult<Vec<u8>> {
    let decoded = B64
        .decode(sealed_b64.trim())
        .map_err(|e| LicenseError::DecryptionError(format!("base64 decode failed: {e}")))?;
    open(&decoded, key, aad)
}

/// HMAC-SHA256 of `data`, hex-encoded.
pub fn mac_hex(key: &[u8; KEY_SIZE], data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hex::encode(hmac::sign(&key, data).as_ref())
}

/// Constant-time check of a hex MAC produced by [`mac_hex`].
///
/// Only the lowercase encoding [`mac_hex`] emits is accepted.
pub fn verify_mac_hex(key: &[u8; KEY_SIZE], data: &[u8], tag_hex: &str) -> bool {
    if tag_hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return false;
    }
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, data, &tag).is_ok()
}

/// Derive an independent sub-key for one purpose from a root secret.
pub fn derive_key(root: &[u8; KEY_SIZE], label: &[u8]) -> [u8; KEY_SIZE] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, root);
    let tag = hmac::sign(&key, label);
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(tag.as_ref());
    out
}
