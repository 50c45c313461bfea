//! Nanosecond timestamps
//!
//! Every tag in the database carries a nanosecond-precision timestamp.
//! Timestamps are stored as `u64` nanoseconds since the Unix epoch, which
//! covers dates through the year 2554.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Nanoseconds since the Unix epoch.
///
/// Ordered, copyable, and stable on disk as a little-endian `u64`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp (Unix epoch).
    pub const ZERO: Timestamp = Timestamp(0);

    /// The maximum representable timestamp.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX)
            .max(0) as u64;
        Timestamp(nanos)
    }

    /// Construct from raw nanoseconds since epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    /// Raw nanoseconds since epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Timestamp moved backward by `duration`, saturating at the epoch.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_nanos() as u64))
    }

    /// Elapsed time between `earlier` and this timestamp, or zero if this
    /// timestamp is not later.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Timestamp(nanos)
    }
}

/// A source of wall-clock time.
///
/// The engine takes its clock from the caller so tests can pin time. The
/// repository enforces per-entity monotonicity on top of whatever the clock
/// returns.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// The default clock, backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
