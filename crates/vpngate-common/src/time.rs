// ============================================
// File: crates/vpngate-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! Startup probing and orphan reaping both poll until an overall budget
//! runs out. `Deadline` keeps that arithmetic in one place.
//!
//! ## Main Functionality
//! - `Deadline`: fixed point in monotonic time with remaining/expired queries
//! - `millis`: lossless-enough `Duration` to `u64` milliseconds for errors
//!
//! ## ⚠️ Important Note for Next Developer
//! - Uses `std::time::Instant`, so a paused tokio test clock does not
//!   move it; tests that pause time must not rely on `Deadline`
//!
//! ## Last Modified
//! v0.3.0 - Replaced atomic timestamps with deadlines

use std::time::{Duration, Instant};

// ============================================
// Deadline
// ============================================

/// A point in monotonic time after which an operation gives up.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use vpngate_common::time::Deadline;
///
/// let deadline = Deadline::after(Duration::from_secs(5));
/// assert!(!deadline.has_passed());
/// assert!(deadline.remaining() <= Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    /// Creates a deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the deadline has been reached.
    #[must_use]
    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time since the deadline was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Total budget the deadline was created with.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.at - self.started
    }
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================
// Tests
// ============================================
