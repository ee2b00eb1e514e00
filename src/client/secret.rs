use crate::client::storage::{StorageDir, StorageKey};
use crate::encryption::{derive_key, generate_key, KEY_SIZE};
use crate::errors::LicenseResult;

use std::fmt;

/// Per-installation secret authenticating local license artifacts.
///
/// Generated once from the OS RNG, stored next to the artifacts it protects,
/// never sent anywhere. Losing or replacing it invalidates every artifact,
/// which the store then treats as absent.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; KEY_SIZE]);

impl Secret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Sub-key for one artifact, so MAC and cipher keys never coincide.
    pub fn derive(&self, label: &[u8]) -> [u8; KEY_SIZE] {
        derive_key(&self.0, label)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Load the installation secret, or generate + store a new one.
///
/// A secret file of the wrong size is replaced; anything it authenticated
/// stops verifying, which forces a fresh online validation.
pub fn get_or_create_secret(storage: &StorageDir) -> LicenseResult<Secret> {
    if let Some(existing) = storage.read(StorageKey::Secret)? {
        if let Ok(bytes) = <[u8; KEY_SIZE]>::try_from(existing.as_slice()) {
            log::debug!("Loaded existing installation secret.");
            return Ok(Secret(bytes));
        }
        log::warn!(
            "Installation secret has {} bytes (expected {}); regenerating.",
            existing.len(),
            KEY_SIZE
        );
    }

    let fresh = generate_key()?;
    storage.write_atomic(StorageKey::Secret, &fresh)?;
    log::info!("Generated and stored new installation secret.");
    Ok(Secret(fresh))
}
