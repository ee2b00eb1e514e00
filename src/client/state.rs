//! Tamper-evident record of the last successful online validation.
//!
//! ## Record
//!
//! `state.json` holds one link of a hash chain:
//!
//! ```text
//! chain[n] = SHA-256(chain[n-1] ‖ timestamp[n] (i64 BE) ‖ fingerprint)
//! chain[0] = SHA-256("warden/chain-seed/v1")
//! ```
//!
//! together with the counter `n`, `chain[n-1]`, the executable fingerprint and
//! an HMAC-SHA256 over all of it under a key derived from the installation
//! secret. A record is accepted only if the MAC verifies, the fingerprint
//! equals the running executable's, and the link re-derives from its
//! predecessor. Anything else reads as absent.
//!
//! ## Watermark
//!
//! `clock.json` is bound to one link (counter + chain value). It tracks the
//! latest time observed on offline runs and can latch grace off (rollback,
//! kill switch, expiry) until the next successful online validation writes a
//! new link. It also remembers the counter it was written for, so restoring an
//! older `state.json` next to it is detected as a replay.
//!
//! Every `record()` writes a watermark for the new link, so a valid state link
//! without a verifiable watermark has lost its clock history (and any latch).
//! [`StateStore::watermark`] reports that as tampering and no grace is granted
//! from such a link.
//!
//! ## Locking
//!
//! Writers hold the directory's lock file exclusively for the whole
//! read-modify-write; readers take it shared. The lock is an OS advisory lock,
//! so it also orders a host application against the `warden` CLI.
//!
//! ## Last failure
//!
//! `last_failure.json` keeps the reason of the most recent blocked decision
//! for diagnostics. It is MAC'd like the other records but never feeds a
//! decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::client::cache::CredentialCache;
use crate::client::decision::ReasonCode;
use crate::client::secret::{get_or_create_secret, Secret};
use crate::client::storage::{StorageDir, StorageKey};
use crate::encryption::{mac_hex, verify_mac_hex, KEY_SIZE};
use crate::errors::{LicenseError, LicenseResult};

const RECORD_VERSION: u32 = 1;

const CHAIN_SEED_LABEL: &[u8] = b"warden/chain-seed/v1";
const STATE_MAC_LABEL: &[u8] = b"warden/state-mac/v1";
const WATERMARK_MAC_LABEL: &[u8] = b"warden/watermark-mac/v1";
const CACHE_KEY_LABEL: &[u8] = b"warden/credential-cache/v1";
const FAILURE_MAC_LABEL: &[u8] = b"warden/last-failure-mac/v1";

/// One hash-chain value.
pub type ChainValue = [u8; 32];

/// Fixed starting point of every chain.
pub fn chain_seed() -> ChainValue {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(CHAIN_SEED_LABEL));
    out
}

/// Next chain value after `prev` for a validation at `timestamp` (unix seconds).
pub fn next_chain(prev: &ChainValue, timestamp: i64, fingerprint: &str) -> ChainValue {
    let mut hasher = Sha256::new();
    hasher.update(prev);
    hasher.update(timestamp.to_be_bytes());
    hasher.update(fingerprint.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Verified last-known-good state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalState {
    pub last_good: DateTime<Utc>,
    pub counter: u64,
    pub chain: ChainValue,
    pub fingerprint: String,
}

/// Why grace was switched off for the current state link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraceLatch {
    RollbackDetected,
    Disabled,
    Expired,
}

impl GraceLatch {
    pub fn code(&self) -> &'static str {
        match self {
            GraceLatch::RollbackDetected => "rollback-detected",
            GraceLatch::Disabled => "disabled",
            GraceLatch::Expired => "expired",
        }
    }
}

/// Verified clock watermark for one state link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockWatermark {
    pub counter: u64,
    pub chain: ChainValue,
    pub highest_seen: DateTime<Utc>,
    pub latch: Option<GraceLatch>,
}

/// Most recent blocked decision, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastFailure {
    pub at: DateTime<Utc>,
    pub reason: ReasonCode,
    pub detail: String,
}

/// Result of [`StateStore::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedState {
    /// No record on disk.
    Absent,
    /// A record exists but failed verification; treat as absent.
    Tampered(String),
    Valid(LocalState),
}

impl LoadedState {
    pub fn valid(&self) -> Option<&LocalState> {
        match self {
            LoadedState::Valid(state) => Some(state),
            _ => None,
        }
    }

    pub fn into_valid(self) -> Option<LocalState> {
        match self {
            LoadedState::Valid(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_tampered(&self) -> bool {
        matches!(self, LoadedState::Tampered(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateRecord {
    version: u32,
    timestamp: i64,
    counter: u64,
    prev_chain: String,
    chain: String,
    fingerprint: String,
    mac: String,
}

impl StateRecord {
    fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "state|v{}|{}|{}|{}|{}|{}",
            self.version, self.timestamp, self.counter, self.prev_chain, self.chain, self.fingerprint
        )
        .into_bytes()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatermarkRecord {
    version: u32,
    counter: u64,
    chain: String,
    highest_seen: i64,
    latch: Option<GraceLatch>,
    mac: String,
}

impl WatermarkRecord {
    fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "watermark|v{}|{}|{}|{}|{}",
            self.version,
            self.counter,
            self.chain,
            self.highest_seen,
            self.latch.map(|l| l.code()).unwrap_or("-")
        )
        .into_bytes()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FailureRecord {
    version: u32,
    at: i64,
    reason: ReasonCode,
    detail: String,
    mac: String,
}

impl FailureRecord {
    fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "last-failure|v{}|{}|{}|{}",
            self.version,
            self.at,
            self.reason.code(),
            self.detail
        )
        .into_bytes()
    }
}

fn tampered(msg: impl Into<String>) -> LicenseError {
    LicenseError::StateTampered(msg.into())
}

fn decode_chain(hex_value: &str) -> LicenseResult<ChainValue> {
    let bytes = hex::decode(hex_value).map_err(|_| tampered("chain value is not hex"))?;
    ChainValue::try_from(bytes.as_slice()).map_err(|_| tampered("chain value has wrong length"))
}

fn whole_seconds(at: DateTime<Utc>) -> LicenseResult<DateTime<Utc>> {
    DateTime::from_timestamp(at.timestamp(), 0)
        .ok_or_else(|| tampered(format!("timestamp out of range: {at}")))
}

/// Persists and verifies the local validation state.
pub struct StateStore {
    storage: StorageDir,
    state_key: [u8; KEY_SIZE],
    watermark_key: [u8; KEY_SIZE],
    failure_key: [u8; KEY_SIZE],
    cache: CredentialCache,
}

impl StateStore {
    /// Open the store, creating the directory and installation secret if needed.
    pub fn open(storage: StorageDir) -> LicenseResult<Self> {
        let mut lock = storage.lock()?;
        let secret = {
            let _guard = lock.write()?;
            get_or_create_secret(&storage)?
        };
        Ok(Self::with_secret(storage, &secret))
    }

    pub fn with_secret(storage: StorageDir, secret: &Secret) -> Self {
        let cache = CredentialCache::new(storage.clone(), secret.derive(CACHE_KEY_LABEL));
        Self {
            state_key: secret.derive(STATE_MAC_LABEL),
            watermark_key: secret.derive(WATERMARK_MAC_LABEL),
            failure_key: secret.derive(FAILURE_MAC_LABEL),
            storage,
            cache,
        }
    }

    pub fn storage(&self) -> &StorageDir {
        &self.storage
    }

    pub fn credential_cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Load and verify the state record against the running executable's fingerprint.
    pub fn load(&self, fingerprint: &str) -> LoadedState {
        let mut lock = self.storage.reader_lock();
        let _guard = lock.as_mut().and_then(|l| l.read().ok());
        self.load_unlocked(fingerprint)
    }

    /// State record and its watermark, read consistently under one shared lock.
    ///
    /// The watermark is `Err` unless the state is valid and a verified
    /// watermark is bound to exactly that link.
    pub fn snapshot(&self, fingerprint: &str) -> (LoadedState, LicenseResult<ClockWatermark>) {
        let mut lock = self.storage.reader_lock();
        let _guard = lock.as_mut().and_then(|l| l.read().ok());
        let state = self.load_unlocked(fingerprint);
        let watermark = match state.valid() {
            Some(valid) => self.bound_watermark(valid),
            None => Err(tampered("no valid state link")),
        };
        (state, watermark)
    }

    fn load_unlocked(&self, fingerprint: &str) -> LoadedState {
        let raw = match self.storage.read(StorageKey::State) {
            Ok(Some(raw)) => raw,
            Ok(None) => return LoadedState::Absent,
            Err(e) => return LoadedState::Tampered(format!("unreadable state record: {e}")),
        };

        let state = match self.verify_record(&raw, fingerprint) {
            Ok(state) => state,
            Err(e) => return LoadedState::Tampered(e.to_string()),
        };

        // A missing or broken watermark cannot prove a replay; grace is refused
        // for it separately.
        if let Ok(Some(watermark)) = self.read_watermark() {
            if watermark.counter > state.counter {
                return LoadedState::Tampered(format!(
                    "state record #{} is older than watermark #{}",
                    state.counter, watermark.counter
                ));
            }
        }

        LoadedState::Valid(state)
    }

    fn verify_record(&self, raw: &[u8], fingerprint: &str) -> LicenseResult<LocalState> {
        let record: StateRecord = serde_json::from_slice(raw)
            .map_err(|e| tampered(format!("unparseable state record: {e}")))?;

        if record.version != RECORD_VERSION {
            return Err(tampered(format!("unknown record version {}", record.version)));
        }
        if !verify_mac_hex(&self.state_key, &record.signing_bytes(), &record.mac) {
            return Err(tampered("state MAC mismatch"));
        }

        // Authenticated from here on.
        if record.fingerprint != fingerprint {
            return Err(tampered("executable fingerprint changed since last validation"));
        }

        let prev = decode_chain(&record.prev_chain)?;
        let chain = decode_chain(&record.chain)?;
        match record.counter {
            0 => return Err(tampered("chain counter is zero")),
            1 if prev != chain_seed() => {
                return Err(tampered("first chain link does not start at the seed"))
            }
            _ => {}
        }
        if next_chain(&prev, record.timestamp, &record.fingerprint) != chain {
            return Err(tampered("chain link is not derivable from its predecessor"));
        }

        let last_good = DateTime::from_timestamp(record.timestamp, 0)
            .ok_or_else(|| tampered("timestamp out of range"))?;

        Ok(LocalState {
            last_good,
            counter: record.counter,
            chain,
            fingerprint: record.fingerprint,
        })
    }

    /// Append a link for a successful online validation at `timestamp`.
    ///
    /// Runs as one exclusive read-modify-write. A timestamp earlier than the
    /// previous link is clamped to it so `last_good` never decreases.
    pub fn record(&self, timestamp: DateTime<Utc>, fingerprint: &str) -> LicenseResult<LocalState> {
        let mut lock = self.storage.lock()?;
        let _guard = lock.write()?;

        let timestamp = whole_seconds(timestamp)?;
        let (prev_chain, counter, last_good) = match self.load_unlocked(fingerprint).into_valid() {
            Some(previous) => {
                let last_good = if timestamp < previous.last_good {
                    log::warn!(
                        "Validation time {} precedes last good validation {}; clock rollback evidence, keeping {}",
                        timestamp,
                        previous.last_good,
                        previous.last_good
                    );
                    previous.last_good
                } else {
                    timestamp
                };
                (previous.chain, previous.counter + 1, last_good)
            }
            None => (chain_seed(), 1, timestamp),
        };

        let chain = next_chain(&prev_chain, last_good.timestamp(), fingerprint);
        let mut record = StateRecord {
            version: RECORD_VERSION,
            timestamp: last_good.timestamp(),
            counter,
            prev_chain: hex::encode(prev_chain),
            chain: hex::encode(chain),
            fingerprint: fingerprint.to_string(),
            mac: String::new(),
        };
        record.mac = mac_hex(&self.state_key, &record.signing_bytes());
        self.storage
            .write_atomic(StorageKey::State, &serde_json::to_vec(&record)?)?;

        let state = LocalState {
            last_good,
            counter,
            chain,
            fingerprint: fingerprint.to_string(),
        };
        self.write_watermark(&ClockWatermark {
            counter,
            chain,
            highest_seen: last_good,
            latch: None,
        })?;

        log::debug!("Recorded state link #{}", counter);
        Ok(state)
    }

    /// Watermark bound to `state`.
    ///
    /// Missing, unverifiable, or written for another link is an error: the
    /// clock history of `state` is unknown.
    pub fn watermark(&self, state: &LocalState) -> LicenseResult<ClockWatermark> {
        let mut lock = self.storage.reader_lock();
        let _guard = lock.as_mut().and_then(|l| l.read().ok());
        self.bound_watermark(state)
    }

    fn bound_watermark(&self, state: &LocalState) -> LicenseResult<ClockWatermark> {
        match self.read_watermark()? {
            Some(w) if w.counter == state.counter && w.chain == state.chain => Ok(w),
            Some(w) => Err(tampered(format!(
                "clock watermark belongs to link #{}, state is link #{}",
                w.counter, state.counter
            ))),
            None => Err(tampered("clock watermark missing")),
        }
    }

    /// Note an offline run at `now`, optionally latching grace off.
    ///
    /// The highest time seen never moves backwards and an existing latch is
    /// kept; only [`record`](Self::record) starts a clean watermark. Without a
    /// valid watermark for `state` only a latching write is allowed.
    pub fn observe(
        &self,
        state: &LocalState,
        now: DateTime<Utc>,
        latch: Option<GraceLatch>,
    ) -> LicenseResult<ClockWatermark> {
        let mut lock = self.storage.lock()?;
        let _guard = lock.write()?;

        let now = whole_seconds(now)?;
        let watermark = match (self.bound_watermark(state), latch) {
            (Ok(current), _) => ClockWatermark {
                highest_seen: current.highest_seen.max(now),
                latch: current.latch.or(latch),
                ..current
            },
            (Err(e), Some(latch)) => {
                log::warn!("Re-latching grace over an invalid watermark: {}", e);
                ClockWatermark {
                    counter: state.counter,
                    chain: state.chain,
                    highest_seen: state.last_good.max(now),
                    latch: Some(latch),
                }
            }
            (Err(e), None) => return Err(e),
        };
        self.write_watermark(&watermark)?;
        Ok(watermark)
    }

    /// Remember why the latest decision was blocked.
    pub fn note_failure(&self, failure: &LastFailure) -> LicenseResult<()> {
        let mut lock = self.storage.lock()?;
        let _guard = lock.write()?;

        let mut record = FailureRecord {
            version: RECORD_VERSION,
            at: failure.at.timestamp(),
            reason: failure.reason,
            detail: failure.detail.clone(),
            mac: String::new(),
        };
        record.mac = mac_hex(&self.failure_key, &record.signing_bytes());
        self.storage
            .write_atomic(StorageKey::LastFailure, &serde_json::to_vec(&record)?)
    }

    /// The last noted failure, if present and authentic.
    pub fn last_failure(&self) -> Option<LastFailure> {
        let mut lock = self.storage.reader_lock();
        let _guard = lock.as_mut().and_then(|l| l.read().ok());

        let raw = match self.storage.read(StorageKey::LastFailure) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("Last failure unreadable: {}", e);
                return None;
            }
        };
        let record: FailureRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Ignoring unparseable last failure record: {}", e);
                return None;
            }
        };
        if record.version != RECORD_VERSION
            || !verify_mac_hex(&self.failure_key, &record.signing_bytes(), &record.mac)
        {
            log::warn!("Ignoring last failure record: MAC mismatch");
            return None;
        }
        Some(LastFailure {
            at: DateTime::from_timestamp(record.at, 0)?,
            reason: record.reason,
            detail: record.detail,
        })
    }

    /// Remove every local artifact, including the installation secret.
    pub fn wipe(&self) -> LicenseResult<()> {
        {
            let mut lock = self.storage.lock()?;
            let _guard = lock.write()?;
            self.storage.wipe()?;
        }
        self.storage.remove_lock();
        Ok(())
    }

    fn write_watermark(&self, watermark: &ClockWatermark) -> LicenseResult<()> {
        let mut record = WatermarkRecord {
            version: RECORD_VERSION,
            counter: watermark.counter,
            chain: hex::encode(watermark.chain),
            highest_seen: watermark.highest_seen.timestamp(),
            latch: watermark.latch,
            mac: String::new(),
        };
        record.mac = mac_hex(&self.watermark_key, &record.signing_bytes());
        self.storage
            .write_atomic(StorageKey::Watermark, &serde_json::to_vec(&record)?)
    }

    /// `Ok(None)` when there is no watermark file; `Err` when it fails verification.
    fn read_watermark(&self) -> LicenseResult<Option<ClockWatermark>> {
        let Some(raw) = self.storage.read(StorageKey::Watermark)? else {
            return Ok(None);
        };

        let record: WatermarkRecord = serde_json::from_slice(&raw)
            .map_err(|e| tampered(format!("unparseable watermark: {e}")))?;
        if record.version != RECORD_VERSION
            || !verify_mac_hex(&self.watermark_key, &record.signing_bytes(), &record.mac)
        {
            return Err(tampered("watermark MAC mismatch"));
        }
        Ok(Some(ClockWatermark {
            counter: record.counter,
            chain: decode_chain(&record.chain)?,
            highest_seen: DateTime::from_timestamp(record.highest_seen, 0)
                .ok_or_else(|| tampered("watermark time out of range"))?,
            latch: record.latch,
        }))
    }
}
