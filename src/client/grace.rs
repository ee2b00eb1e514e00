//! Offline grace evaluation.
//!
//! Everything here is a pure function of the last verified local state, the
//! clock watermark bound to it, and a caller-supplied `now`. No I/O, so the
//! boundaries can be exercised with synthetic clocks.

use chrono::{DateTime, Duration, Utc};

use crate::client::state::{ClockWatermark, GraceLatch, LocalState};

/// Grace window used when configuration does not override it.
pub const DEFAULT_GRACE_DAYS: u32 = 7;

/// Tolerated backward clock drift before a rollback is assumed (5 minutes).
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

const SECS_PER_DAY: i64 = 86_400;

/// Grace policy constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    pub grace_period: Duration,
    pub clock_skew: Duration,
}

impl GracePolicy {
    pub fn new(grace_days: u32, clock_skew_secs: i64) -> Self {
        Self {
            grace_period: Duration::days(i64::from(grace_days)),
            clock_skew: Duration::seconds(clock_skew_secs),
        }
    }
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_DAYS, DEFAULT_CLOCK_SKEW_SECS)
    }
}

/// Outcome of grace evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceStatus {
    /// No trusted record of a prior online validation.
    NeverValidated,
    /// The state link has no verified watermark, so its clock history and
    /// latch are unknown.
    ClockUnverified,
    /// `now` lies before the latest trusted instant by more than the skew.
    RollbackDetected { anchor: DateTime<Utc> },
    /// A previous run latched grace off for this state link.
    Latched(GraceLatch),
    /// The window anchored at the last validation has closed.
    Exhausted { last_good: DateTime<Utc> },
    /// Offline use is permitted for `remaining` more time.
    Available { remaining: Duration },
}

impl GraceStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, GraceStatus::Available { .. })
    }

    /// Whole days left, floored. `None` unless grace is available.
    pub fn days_remaining(&self) -> Option<u32> {
        match self {
            GraceStatus::Available { remaining } => {
                Some((remaining.num_seconds().max(0) / SECS_PER_DAY) as u32)
            }
            _ => None,
        }
    }
}

/// Decide whether offline operation is still permitted.
///
/// `watermark` must be the one bound to `state` (same counter and chain); the
/// store only hands out matching watermarks. A state without one gets no grace.
pub fn evaluate(
    state: Option<&LocalState>,
    watermark: Option<&ClockWatermark>,
    now: DateTime<Utc>,
    policy: &GracePolicy,
) -> GraceStatus {
    let Some(state) = state else {
        return GraceStatus::NeverValidated;
    };

    let Some(watermark) = watermark else {
        return GraceStatus::ClockUnverified;
    };
    if let Some(latch) = watermark.latch {
        return GraceStatus::Latched(latch);
    }

    let anchor = watermark.highest_seen.max(state.last_good);
    if now < anchor - policy.clock_skew {
        return GraceStatus::RollbackDetected { anchor };
    }

    let elapsed = (now - state.last_good).max(Duration::zero());
    if elapsed <= policy.grace_period {
        GraceStatus::Available {
            remaining: policy.grace_period - elapsed,
        }
    } else {
        GraceStatus::Exhausted {
            last_good: state.last_good,
        }
    }
}
