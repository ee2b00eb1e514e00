//! Sealed copy of the last verified credential's claims.
//!
//! Grace decisions need the edition, feature list and expiry of the
//! credential that last validated online. They are kept in `credential.enc`:
//!
//! 1. **AES-256-GCM** with a key derived from the installation secret, so the
//!    file cannot be read or edited in place.
//! 2. **Link binding**: the entry carries the chain value of the state link it
//!    was written with. An entry from another link is ignored, so an old cache
//!    cannot be paired with a newer state record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::state::LocalState;
use crate::client::storage::{StorageDir, StorageKey};
use crate::client::verifier::Credential;
use crate::encryption::{open_from_base64, seal_to_base64, KEY_SIZE};
use crate::errors::{LicenseError, LicenseResult};

const CACHE_AAD: &[u8] = b"warden/credential/v1";

/// Entitlements remembered from the last successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCredential {
    /// Hex chain value of the state link this entry belongs to.
    pub chain: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,

    pub features: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_limit: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Local time of the validation that produced this entry.
    pub validated_at: DateTime<Utc>,
}

impl CachedCredential {
    pub fn from_credential(credential: &Credential, state: &LocalState) -> Self {
        Self {
            chain: hex::encode(state.chain),
            edition: credential.edition.clone(),
            features: credential.features.clone(),
            customer: credential.customer.clone(),
            machine_limit: credential.machine_limit,
            license_id: credential.license_id.clone(),
            issued_at: credential.issued_at,
            expires_at: credential.expires_at,
            validated_at: state.last_good,
        }
    }

    /// `true` once `now` has reached the credential's `exp`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn belongs_to(&self, state: &LocalState) -> bool {
        self.chain == hex::encode(state.chain)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Reads and writes `credential.enc`.
pub struct CredentialCache {
    storage: StorageDir,
    key: [u8; KEY_SIZE],
}

impl CredentialCache {
    pub fn new(storage: StorageDir, key: [u8; KEY_SIZE]) -> Self {
        Self { storage, key }
    }

    pub fn save(&self, entry: &CachedCredential) -> LicenseResult<()> {
        let json = serde_json::to_vec(entry)?;
        let sealed = seal_to_base64(&json, &self.key, CACHE_AAD)?;
        self.storage
            .write_atomic(StorageKey::Credential, sealed.as_bytes())
    }

    /// Decrypt the cache. `Ok(None)` when there is none.
    pub fn load(&self) -> LicenseResult<Option<CachedCredential>> {
        let Some(raw) = self.storage.read(StorageKey::Credential)? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&raw)
            .map_err(|_| LicenseError::DecryptionError("cache is not text".to_string()))?;
        let plain = open_from_base64(text, &self.key, CACHE_AAD)?;
        let entry = serde_json::from_slice(&plain).map_err(|e| {
            LicenseError::DecryptionError(format!("failed to deserialize cache: {e}"))
        })?;
        Ok(Some(entry))
    }

    /// Cache entry for `state`, or `None` if missing, unreadable or from another link.
    pub fn load_for(&self, state: &LocalState) -> Option<CachedCredential> {
        match self.load() {
            Ok(Some(entry)) if entry.belongs_to(state) => Some(entry),
            Ok(Some(_)) => {
                log::warn!("Credential cache belongs to a different state link; ignoring");
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Credential cache unusable: {}", e);
                None
            }
        }
    }
}
