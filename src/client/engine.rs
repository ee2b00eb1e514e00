//! The license decision engine.
//!
//! ```text
//! START ──► ONLINE_CHECK ──┬─ fetched, verified, enabled ─────► VALIDATED  (record state)
//!                          ├─ fetched, rejected / disabled ───► BLOCKED
//!                          ├─ unavailable, grace available ───► GRACE_ALLOWED
//!                          └─ unavailable, no grace ──────────► BLOCKED
//! ```
//!
//! Every call returns exactly one [`Decision`]; internal faults are folded
//! into it and logged. Calls are serialized, so a revalidation never runs
//! alongside a decision that is still writing state. Offline grace needs the
//! state link, its clock watermark and the cached credential; losing any of
//! them means BLOCKED until the next online validation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task;

use crate::client::cache::{CachedCredential, CredentialCache};
use crate::client::decision::{Decision, ReasonCode};
use crate::client::fetcher::{CredentialFetcher, FetchOutcome, HttpsFetcher};
use crate::client::grace::{evaluate, GracePolicy, GraceStatus};
use crate::client::state::{GraceLatch, LastFailure, LoadedState, LocalState, StateStore};
use crate::client::verifier::{Credential, CredentialVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::{LicenseMode, WardenConfig};
use crate::errors::{LicenseError, LicenseResult};
use crate::fingerprint::FingerprintSource;
use crate::logging::{log_decision, log_license_event, LicenseEvent};

/// Engine knobs derived from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: LicenseMode,
    pub token_url: String,
    pub grace: GracePolicy,
    pub fingerprint: FingerprintSource,
}

impl EngineSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            mode: config.license.mode,
            token_url: config.license.token_url.trim().to_string(),
            grace: config.grace_policy(),
            fingerprint: config.fingerprint_source(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Startup check; grace applies when offline.
    Startup,
    /// Host-requested revalidation; offline means blocked.
    Forced,
}

/// Local view of the license without touching the network.
#[derive(Debug, Clone)]
pub struct LocalStatus {
    pub state: LoadedState,
    pub grace: GraceStatus,
    pub cached: Option<CachedCredential>,
    pub last_failure: Option<LastFailure>,
}

/// Decides whether the host may run.
///
/// Network and fingerprint work is async; everything touching the store runs
/// on the blocking pool.
pub struct LicenseDecisionEngine<F, C = SystemClock> {
    core: Arc<Core>,
    fetcher: F,
    clock: C,
    gate: Mutex<()>,
}

/// The synchronous half of a decision: verification and local state.
struct Core {
    settings: EngineSettings,
    verifier: Option<CredentialVerifier>,
    store: StateStore,
}

impl LicenseDecisionEngine<HttpsFetcher, SystemClock> {
    /// Build the production engine: HTTPS fetcher, system clock, configured store.
    ///
    /// In offline mode no verifying key is needed.
    pub fn from_config(config: &WardenConfig) -> LicenseResult<Self> {
        let settings = EngineSettings::from_config(config);
        let verifier = match settings.mode {
            LicenseMode::Cloud => Some(
                CredentialVerifier::new(config.verifying_key()?)
                    .with_clock_skew(settings.grace.clock_skew),
            ),
            LicenseMode::Offline => None,
        };
        let fetcher = HttpsFetcher::new(config.fetch_timeout()).map_err(|e| {
            LicenseError::ConfigError(format!("failed to build HTTPS client: {e}"))
        })?;
        let store = StateStore::open(config.storage_dir()?)?;
        Ok(Self::assemble(settings, fetcher, verifier, store, SystemClock))
    }
}

impl<F: CredentialFetcher, C: Clock> LicenseDecisionEngine<F, C> {
    pub fn new(
        settings: EngineSettings,
        fetcher: F,
        verifier: CredentialVerifier,
        store: StateStore,
        clock: C,
    ) -> Self {
        Self::assemble(settings, fetcher, Some(verifier), store, clock)
    }

    fn assemble(
        settings: EngineSettings,
        fetcher: F,
        verifier: Option<CredentialVerifier>,
        store: StateStore,
        clock: C,
    ) -> Self {
        if settings.mode == LicenseMode::Cloud && !settings.fingerprint.is_bound() {
            log::warn!("Executable binding is disabled; local state is not tied to this build");
        }
        Self {
            core: Arc::new(Core {
                settings,
                verifier,
                store,
            }),
            fetcher,
            clock,
            gate: Mutex::new(()),
        }
    }

    /// Startup decision: online check, grace fallback when the source is unreachable.
    pub async fn decide(&self) -> Decision {
        let _gate = self.gate.lock().await;
        let decision = self.run(Attempt::Startup).await;
        log_decision(&decision);
        decision
    }

    /// Force an online check. A failed fetch is `BLOCKED` even if grace remains.
    pub async fn revalidate(&self) -> Decision {
        let _gate = self.gate.lock().await;
        let decision = self.run(Attempt::Forced).await;
        log_decision(&decision);
        decision
    }

    /// Entitlements cached by the last successful validation, if still bound to valid state.
    pub async fn cached_entitlements(&self) -> Option<CachedCredential> {
        let _gate = self.gate.lock().await;
        let fingerprint = self.core.settings.fingerprint.compute().await.ok()?;
        let core = Arc::clone(&self.core);
        task::spawn_blocking(move || {
            let state = core.store.load(&fingerprint).into_valid()?;
            core.cache().load_for(&state)
        })
        .await
        .ok()
        .flatten()
    }

    /// Inspect local state and grace without fetching or writing anything.
    pub async fn local_status(&self) -> LicenseResult<LocalStatus> {
        let _gate = self.gate.lock().await;
        let fingerprint = self.core.settings.fingerprint.compute().await?;
        let now = self.clock.now();
        let core = Arc::clone(&self.core);
        task::spawn_blocking(move || core.status(&fingerprint, now))
            .await
            .map_err(|e| LicenseError::StorageError(std::io::Error::other(e)))
    }

    /// Delete every local artifact and the installation secret.
    ///
    /// The next cloud-mode decision needs a successful online validation.
    pub async fn wipe_local_state(&self) -> LicenseResult<()> {
        let _gate = self.gate.lock().await;
        let core = Arc::clone(&self.core);
        task::spawn_blocking(move || core.store.wipe())
            .await
            .map_err(|e| LicenseError::StorageError(std::io::Error::other(e)))??;
        log_license_event(LicenseEvent::Wiped, None);
        Ok(())
    }

    async fn run(&self, attempt: Attempt) -> Decision {
        let settings = &self.core.settings;
        if settings.mode == LicenseMode::Offline {
            log_license_event(LicenseEvent::Bypassed, None);
            return Decision::offline_mode();
        }

        let fingerprint = match settings.fingerprint.compute().await {
            Ok(fp) => Some(fp),
            Err(e) => {
                log_license_event(LicenseEvent::FingerprintUnavailable, Some(&e.to_string()));
                None
            }
        };

        let fetched = if self.core.verifier.is_some() {
            self.fetcher.fetch(&settings.token_url).await
        } else {
            FetchOutcome::Unavailable("no verifying key configured".to_string())
        };
        let now = self.clock.now();

        let core = Arc::clone(&self.core);
        match task::spawn_blocking(move || core.conclude(attempt, fetched, fingerprint, now)).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "Decision task failed");
                Decision::blocked(ReasonCode::NoGrace, format!("internal error: {e}"))
            }
        }
    }
}

impl Core {
    fn cache(&self) -> &CredentialCache {
        self.store.credential_cache()
    }

    fn status(&self, fingerprint: &str, now: DateTime<Utc>) -> LocalStatus {
        let (state, watermark) = self.store.snapshot(fingerprint);
        let (grace, cached) = match state.valid() {
            Some(valid) => (
                evaluate(Some(valid), watermark.ok().as_ref(), now, &self.settings.grace),
                self.cache().load_for(valid),
            ),
            None => (GraceStatus::NeverValidated, None),
        };
        LocalStatus {
            state,
            grace,
            cached,
            last_failure: self.store.last_failure(),
        }
    }

    /// Turn a fetch result into a decision; a blocked decision is remembered.
    fn conclude(
        &self,
        attempt: Attempt,
        fetched: FetchOutcome,
        fingerprint: Option<String>,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = self.decide_locally(attempt, fetched, fingerprint.as_deref(), now);
        if !decision.is_allowed() {
            let failure = LastFailure {
                at: now,
                reason: decision.reason,
                detail: decision.detail.clone(),
            };
            if let Err(e) = self.store.note_failure(&failure) {
                log::debug!("Could not record last failure: {}", e);
            }
        }
        decision
    }

    fn decide_locally(
        &self,
        attempt: Attempt,
        fetched: FetchOutcome,
        fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Decision {
        let Some(verifier) = &self.verifier else {
            return Decision::blocked(ReasonCode::Unverifiable, "no verifying key configured");
        };

        match fetched {
            FetchOutcome::Fetched(token) => self.online(verifier, &token, fingerprint, now),
            FetchOutcome::Unavailable(why) => {
                tracing::info!(reason = %why, "Credential source unavailable");
                match attempt {
                    Attempt::Forced => Decision::blocked(
                        ReasonCode::NoGrace,
                        format!("revalidation requires the license server: {why}"),
                    ),
                    Attempt::Startup => self.offline(fingerprint, now),
                }
            }
        }
    }

    fn online(
        &self,
        verifier: &CredentialVerifier,
        token: &str,
        fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Decision {
        let credential = match verifier.verify(token, now) {
            Ok(credential) => credential,
            Err(rejection) => {
                log_license_event(LicenseEvent::CredentialRejected, Some(&rejection.to_string()));
                if rejection.is_expired() {
                    self.latch_current(fingerprint, now, GraceLatch::Expired);
                    return Decision::blocked(ReasonCode::Expired, rejection.to_string());
                }
                return Decision::blocked(ReasonCode::Unverifiable, rejection.to_string());
            }
        };

        if !credential.enabled {
            self.latch_current(fingerprint, now, GraceLatch::Disabled);
            return Decision::blocked(ReasonCode::Disabled, "license disabled by the publisher");
        }

        self.persist(&credential, fingerprint, now);
        log_license_event(
            LicenseEvent::Validated,
            credential.license_id.as_deref().or(credential.edition.as_deref()),
        );
        Decision::validated(&credential)
    }

    /// Record the validation. Failures are logged; the decision stays VALIDATED.
    fn persist(&self, credential: &Credential, fingerprint: Option<&str>, now: DateTime<Utc>) {
        let Some(fingerprint) = fingerprint else {
            log_license_event(
                LicenseEvent::PersistFailed,
                Some("executable fingerprint unavailable; state not recorded"),
            );
            return;
        };

        let state = match self.store.record(now, fingerprint) {
            Ok(state) => state,
            Err(e) => {
                log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
                return;
            }
        };
        let entry = CachedCredential::from_credential(credential, &state);
        if let Err(e) = self.cache().save(&entry) {
            log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
        }
    }

    /// Switch grace off for the current valid state link, if there is one.
    fn latch_current(&self, fingerprint: Option<&str>, now: DateTime<Utc>, latch: GraceLatch) {
        let Some(state) = fingerprint.and_then(|fp| self.store.load(fp).into_valid()) else {
            return;
        };
        if let Err(e) = self.store.observe(&state, now, Some(latch)) {
            log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
        }
    }

    fn offline(&self, fingerprint: Option<&str>, now: DateTime<Utc>) -> Decision {
        let Some(fingerprint) = fingerprint else {
            return Decision::blocked(
                ReasonCode::NoGrace,
                "executable fingerprint unavailable; grace disabled",
            );
        };

        let (loaded, watermark) = self.store.snapshot(fingerprint);
        let state = match loaded {
            LoadedState::Valid(state) => state,
            LoadedState::Absent => {
                return Decision::blocked(ReasonCode::NoGrace, "never validated");
            }
            LoadedState::Tampered(cause) => {
                log_license_event(LicenseEvent::StateTampered, Some(&cause));
                return Decision::blocked(
                    ReasonCode::NoGrace,
                    "local license state is invalid; online validation required",
                );
            }
        };
        let watermark = match watermark {
            Ok(watermark) => Some(watermark),
            Err(e) => {
                log_license_event(LicenseEvent::StateTampered, Some(&e.to_string()));
                None
            }
        };

        let status = evaluate(Some(&state), watermark.as_ref(), now, &self.settings.grace);
        match status {
            GraceStatus::NeverValidated => {
                Decision::blocked(ReasonCode::NoGrace, "never validated")
            }
            GraceStatus::ClockUnverified => Decision::blocked(
                ReasonCode::NoGrace,
                "clock watermark missing or invalid; online validation required",
            ),
            GraceStatus::Latched(latch) => latched_decision(latch),
            GraceStatus::RollbackDetected { anchor } => {
                let detail = format!("system clock {now} is behind last trusted time {anchor}");
                log_license_event(LicenseEvent::ClockRollback, Some(&detail));
                if let Err(e) = self
                    .store
                    .observe(&state, now, Some(GraceLatch::RollbackDetected))
                {
                    log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
                }
                Decision::blocked(ReasonCode::RollbackDetected, detail)
            }
            GraceStatus::Exhausted { last_good } => Decision::blocked(
                ReasonCode::NoGrace,
                format!(
                    "grace period of {} day(s) since {last_good} has ended",
                    self.settings.grace.grace_period.num_days()
                ),
            ),
            GraceStatus::Available { .. } => self.grace(&state, status, now),
        }
    }

    fn grace(&self, state: &LocalState, status: GraceStatus, now: DateTime<Utc>) -> Decision {
        // Every validation writes the cache with the state link; without it
        // the credential's expiry cannot be checked.
        let Some(cached) = self.cache().load_for(state) else {
            log_license_event(
                LicenseEvent::StateTampered,
                Some("cached credential missing or not bound to the state link"),
            );
            return Decision::blocked(
                ReasonCode::NoGrace,
                "cached credential missing or invalid; online validation required",
            );
        };
        if cached.is_expired_at(now) {
            if let Err(e) = self.store.observe(state, now, Some(GraceLatch::Expired)) {
                log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
            }
            return Decision::blocked(
                ReasonCode::Expired,
                format!("license expired at {}", cached.expires_at),
            );
        }

        // The watermark must move forward before grace is granted.
        if let Err(e) = self.store.observe(state, now, None) {
            log_license_event(LicenseEvent::PersistFailed, Some(&e.to_string()));
            return Decision::blocked(
                ReasonCode::NoGrace,
                format!("cannot update clock watermark: {e}"),
            );
        }

        let days = status.days_remaining().unwrap_or(0);
        log_license_event(
            LicenseEvent::GraceUsed,
            Some(&format!("{days} day(s) remaining")),
        );
        Decision::grace(days, Some(&cached))
    }
}

fn latched_decision(latch: GraceLatch) -> Decision {
    match latch {
        GraceLatch::RollbackDetected => Decision::blocked(
            ReasonCode::RollbackDetected,
            "clock rollback detected earlier; connect to revalidate",
        ),
        GraceLatch::Disabled => Decision::blocked(
            ReasonCode::Disabled,
            "license disabled by the publisher; offline use not permitted",
        ),
        GraceLatch::Expired => Decision::blocked(
            ReasonCode::Expired,
            "license expired; offline use not permitted",
        ),
    }
}
