//! Structured license event logging.
//!
//! Decision-level events go through [`log_license_event`] as `tracing`
//! events inside a `license_event` span. Low-level storage diagnostics use
//! the `log` macros; the subscriber installed by [`init_logging`] forwards
//! both to stderr and, when `logging.file` is set, appends them without ANSI
//! colors to that license log file.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing::{info, info_span, warn, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, registry};

use crate::client::decision::Decision;
use crate::config::LoggingConfig;
use crate::errors::{LicenseError, LicenseResult};

/// License lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseEvent {
    /// Credential verified online and state recorded
    Validated,
    /// Running offline on the grace window
    GraceUsed,
    /// Licensing bypassed by configuration
    Bypassed,
    /// A fetched credential was rejected
    CredentialRejected,
    /// Local state failed verification
    StateTampered,
    /// Executable fingerprint could not be computed
    FingerprintUnavailable,
    /// Clock behind the last trusted time
    ClockRollback,
    /// Decision was allowed but local state could not be saved
    PersistFailed,
    /// Local artifacts removed
    Wiped,
}

impl std::fmt::Display for LicenseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseEvent::Validated => "validated",
            LicenseEvent::GraceUsed => "grace_used",
            LicenseEvent::Bypassed => "bypassed",
            LicenseEvent::CredentialRejected => "credential_rejected",
            LicenseEvent::StateTampered => "state_tampered",
            LicenseEvent::FingerprintUnavailable => "fingerprint_unavailable",
            LicenseEvent::ClockRollback => "clock_rollback",
            LicenseEvent::PersistFailed => "persist_failed",
            LicenseEvent::Wiped => "wiped",
        };
        write!(f, "{}", s)
    }
}

impl LicenseEvent {
    fn is_warning(&self) -> bool {
        matches!(
            self,
            LicenseEvent::CredentialRejected
                | LicenseEvent::StateTampered
                | LicenseEvent::FingerprintUnavailable
                | LicenseEvent::ClockRollback
                | LicenseEvent::PersistFailed
        )
    }
}

/// Log a license event with optional details.
pub fn log_license_event(event: LicenseEvent, details: Option<&str>) {
    let span = info_span!("license_event", event = %event);
    let _enter = span.enter();

    match (event.is_warning(), details) {
        (true, Some(d)) => warn!(reason = %d, "License event occurred"),
        (true, None) => warn!("License event occurred"),
        (false, Some(d)) => info!(details = %d, "License event occurred"),
        (false, None) => info!("License event occurred"),
    }
}

/// Log the final decision of one engine call.
pub fn log_decision(decision: &Decision) {
    let span = info_span!(
        "license_decision",
        outcome = %decision.outcome,
        reason = %decision.reason,
    );
    let _enter = span.enter();

    if decision.is_allowed() {
        info!(
            detail = %decision.detail,
            edition = decision.edition.as_deref().unwrap_or("-"),
            grace_days_remaining = decision.grace_days_remaining,
            "License decision"
        );
    } else {
        warn!(detail = %decision.detail, "License decision");
    }
}

fn parse_level(level: &str) -> LicenseResult<Level> {
    level
        .parse::<Level>()
        .map_err(|_| LicenseError::ConfigError(format!("unknown log level '{level}'")))
}

fn open_log_file(path: &Path) -> LicenseResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            LicenseError::ConfigError(format!("cannot open log file {}: {e}", path.display()))
        })
}

/// stderr output plus an optional plain-text file, both filtered at `level`.
fn license_subscriber(level: Level, file: Option<File>) -> impl Subscriber + Send + Sync + 'static {
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });
    registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
}

/// Install the subscriber at the configured level (no-op when disabled).
///
/// Returns `Ok(false)` if logging is disabled or a subscriber already exists.
pub fn init_logging(config: &LoggingConfig) -> LicenseResult<bool> {
    if !config.enabled {
        return Ok(false);
    }
    let level = parse_level(&config.level)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;
    Ok(license_subscriber(level, file).try_init().is_ok())
}
