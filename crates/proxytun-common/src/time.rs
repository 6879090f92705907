// ============================================
// File: crates/proxytun-common/src/time.rs
// ============================================
//! # Time Utilities
//!
//! ## Creation Reason
//! Flow records are touched by the packet dispatcher and by their relay
//! task while the idle sweeper reads them. A lock per timestamp would put
//! a mutex on the per-packet path, so the last-activity time is an atomic.
//!
//! ## Main Functionality
//! - `AtomicInstant`: lock-free `Instant` cell
//!
//! ## ⚠️ Important Note for Next Developer
//! - Stored as nanoseconds since a process-wide reference instant
//! - Instants earlier than the reference saturate to the reference
//!
//! ## Last Modified
//! v0.1.0 - Initial time utilities

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Lock-free cell holding an [`Instant`].
///
/// # Example
/// ```
/// use proxytun_common::time::AtomicInstant;
/// use std::time::Duration;
///
/// let last_activity = AtomicInstant::now();
/// last_activity.touch();
/// assert!(!last_activity.has_elapsed(Duration::from_secs(60)));
/// ```
#[derive(Debug)]
pub struct AtomicInstant {
    nanos: AtomicU64,
}

impl AtomicInstant {
    fn reference() -> Instant {
        static REFERENCE: OnceLock<Instant> = OnceLock::new();
        *REFERENCE.get_or_init(Instant::now)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_nanos(instant: Instant) -> u64 {
        instant
            .checked_duration_since(Self::reference())
            .map_or(0, |d| d.as_nanos() as u64)
    }

    /// Creates a cell set to the current time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    /// Creates a cell holding `instant`.
    #[must_use]
    pub fn from_instant(instant: Instant) -> Self {
        Self {
            nanos: AtomicU64::new(Self::to_nanos(instant)),
        }
    }

    /// Loads the stored instant.
    #[must_use]
    pub fn load(&self) -> Instant {
        Self::reference() + Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }

    /// Stores a new instant.
    pub fn store(&self, instant: Instant) {
        self.nanos.store(Self::to_nanos(instant), Ordering::Relaxed);
    }

    /// Updates to the current time.
    pub fn touch(&self) {
        self.store(Instant::now());
    }

    /// Time elapsed between the stored instant and `now`.
    ///
    /// Returns zero if `now` is earlier than the stored instant.
    #[must_use]
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.load())
    }

    /// Time elapsed since the stored instant.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.idle_at(Instant::now())
    }

    /// Checks if more than `duration` has elapsed since the stored instant.
    #[must_use]
    pub fn has_elapsed(&self, duration: Duration) -> bool {
        self.elapsed() > duration
    }
}

impl Default for AtomicInstant {
    fn default() -> Self {
        Self::now()
    }
}
