//! The value handed to the host application.
//!
//! Exactly one [`Decision`] comes out of every engine call. Only
//! [`Outcome`] gates execution; [`ReasonCode`] and `detail` are for display
//! and diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client::cache::CachedCredential;
use crate::client::verifier::Credential;

/// Whether the host may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Validated,
    GraceAllowed,
    Blocked,
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Outcome::Blocked)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Validated => "VALIDATED",
            Outcome::GraceAllowed => "GRACE_ALLOWED",
            Outcome::Blocked => "BLOCKED",
        })
    }
}

/// Short machine-readable reason attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// Fresh credential verified online.
    Validated,
    /// Licensing is switched off by configuration.
    OfflineMode,
    /// Running offline inside the grace window.
    Grace,
    /// The credential's `exp` has passed.
    Expired,
    /// Kill switch (`enabled = false`).
    Disabled,
    /// The fetched credential failed verification.
    Unverifiable,
    /// Offline with no usable grace.
    NoGrace,
    /// The clock moved behind the last trusted time.
    RollbackDetected,
}

impl ReasonCode {
    pub fn code(&self) -> &'static str {
        match self {
            ReasonCode::Validated => "validated",
            ReasonCode::OfflineMode => "offline-mode",
            ReasonCode::Grace => "grace",
            ReasonCode::Expired => "expired",
            ReasonCode::Disabled => "disabled",
            ReasonCode::Unverifiable => "unverifiable",
            ReasonCode::NoGrace => "no-grace",
            ReasonCode::RollbackDetected => "rollback-detected",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ReasonCode::Validated => "License validated",
            ReasonCode::OfflineMode => "Licensing disabled by configuration",
            ReasonCode::Grace => "Running offline on grace period",
            ReasonCode::Expired => "License has expired",
            ReasonCode::Disabled => "License has been disabled by the publisher",
            ReasonCode::Unverifiable => "License credential could not be verified",
            ReasonCode::NoGrace => "Online validation required",
            ReasonCode::RollbackDetected => {
                "System clock is behind the last validation - correct the clock and connect"
            }
        }
    }

    /// `true` if connecting to the license server could clear this reason.
    pub fn requires_online(&self) -> bool {
        matches!(
            self,
            ReasonCode::NoGrace | ReasonCode::RollbackDetected | ReasonCode::Grace
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Final verdict of one engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub reason: ReasonCode,
    /// Free-form diagnostic; never interpreted.
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Whole days left; only set for [`Outcome::GraceAllowed`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_days_remaining: Option<u32>,
}

impl Decision {
    fn bare(outcome: Outcome, reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            reason,
            detail: detail.into(),
            edition: None,
            features: Vec::new(),
            customer: None,
            expires_at: None,
            grace_days_remaining: None,
        }
    }

    pub fn validated(credential: &Credential) -> Self {
        Self {
            edition: credential.edition.clone(),
            features: credential.features.clone(),
            customer: credential.customer.clone(),
            expires_at: Some(credential.expires_at),
            ..Self::bare(Outcome::Validated, ReasonCode::Validated, "credential verified online")
        }
    }

    pub fn offline_mode() -> Self {
        Self::bare(
            Outcome::Validated,
            ReasonCode::OfflineMode,
            "license checks disabled (mode = offline)",
        )
    }

    /// Grace decision, populated from the cache when one matches the state link.
    pub fn grace(days_remaining: u32, cached: Option<&CachedCredential>) -> Self {
        let detail = format!("offline, {days_remaining} day(s) of grace remaining");
        let mut decision = Self::bare(Outcome::GraceAllowed, ReasonCode::Grace, detail);
        decision.grace_days_remaining = Some(days_remaining);
        if let Some(cached) = cached {
            decision.edition = cached.edition.clone();
            decision.features = cached.features.clone();
            decision.customer = cached.customer.clone();
            decision.expires_at = Some(cached.expires_at);
        }
        decision
    }

    pub fn blocked(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self::bare(Outcome::Blocked, reason, detail)
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome.is_allowed()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.is_allowed() && self.features.iter().any(|f| f == feature)
    }

    /// One-line summary suitable for a status bar or log.
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::GraceAllowed => format!(
                "{}: running on grace, {} day(s) remaining",
                self.outcome,
                self.grace_days_remaining.unwrap_or(0)
            ),
            _ => format!("{} ({}): {}", self.outcome, self.reason, self.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_blocked_denies() {
        assert!(Outcome::Validated.is_allowed());
        assert!(Outcome::GraceAllowed.is_allowed());
        assert!(!Outcome::Blocked.is_allowed());
    }

    #[test]
    fn reason_codes_serialize_as_kebab_case() {
        let json = serde_json::to_string(&ReasonCode::RollbackDetected).unwrap();
        assert_eq!(json, "\"rollback-detected\"");
        assert_eq!(ReasonCode::OfflineMode.to_string(), "offline-mode");
    }

    #[test]
    fn blocked_decision_exposes_no_features() {
        let mut d = Decision::blocked(ReasonCode::Disabled, "kill switch");
        d.features = vec!["export".to_string()];
        assert!(!d.has_feature("export"));
    }

    #[test]
    fn grace_summary_mentions_days() {
        let d = Decision::grace(3, None);
        assert_eq!(d.grace_days_remaining, Some(3));
        assert!(d.summary().contains("3 day(s) remaining"));
    }

    #[test]
    fn requires_online_only_for_availability_reasons() {
        assert!(ReasonCode::NoGrace.requires_online());
        assert!(ReasonCode::RollbackDetected.requires_online());
        assert!(!ReasonCode::Disabled.requires_online());
        assert!(!ReasonCode::Unverifiable.requires_online());
    }
}
