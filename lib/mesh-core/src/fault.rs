//! Consecutive-failure tracking for remote call targets
//!
//! Any call path talking to a remote endpoint records success/failure
//! here; the tracker decides when an endpoint has crossed from "flaky"
//! to "unhealthy". It has no side effects of its own — the caller acts
//! on the returned severity (typically by closing the registration that
//! backs the endpoint).

use std::sync::atomic::{AtomicU32, Ordering};

/// Default number of consecutive failures tolerated before a streak
/// turns fatal.
pub const DEFAULT_FAULT_THRESHOLD: u32 = 5;

/// Severity of a recorded failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The streak is still below or at the threshold, or the fatal
    /// signal for this streak already fired.
    Warning,
    /// The streak just crossed the threshold. Fires exactly once per
    /// unbroken failure streak.
    Fatal,
}

/// Thread-safe consecutive-failure counter with a warn/fatal threshold.
pub struct FaultTracker {
    errors: AtomicU32,
    threshold: u32,
}

impl FaultTracker {
    /// Create a tracker that tolerates `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            errors: AtomicU32::new(0),
            threshold,
        }
    }

    /// Record a successful call, resetting the failure streak.
    pub fn record_success(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }

    /// Record a failed call and report its severity.
    ///
    /// Returns [`Severity::Fatal`] exactly when the count transitions
    /// from `threshold` to `threshold + 1`; every other failure in the
    /// streak is a [`Severity::Warning`].
    pub fn record_failure(&self) -> Severity {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.threshold + 1 {
            Severity::Fatal
        } else {
            Severity::Warning
        }
    }

    /// Current length of the failure streak.
    pub fn consecutive_errors(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }
}

impl Default for FaultTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_THRESHOLD)
    }
}
