//! Operational counters and metrics-recursion prevention
//!
//! The engine reports its own activity by writing metric entities through
//! the ordinary writer path. Done naïvely that recurses: writing a metric
//! entity is itself a write, which wants to record a metric. Two guards
//! stop it:
//!
//! - a thread-local depth counter around every write that could emit
//!   metrics; emission is skipped whenever the depth exceeds one
//! - a process-wide kill-switch, flipped by critical memory pressure or by
//!   configuration
//!
//! Metric entities carry the reserved `metric:` tag prefix, so writes
//! targeting them are recognized and never emit metrics themselves.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static METRICS_ENABLED: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(true));

thread_local! {
    static WRITE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether metric emission is allowed process-wide.
pub fn metrics_globally_enabled() -> bool {
    METRICS_ENABLED.load(Ordering::Relaxed)
}

/// Flip the process-wide kill-switch.
///
/// Set to `false` by configuration or by the memory monitor at critical
/// pressure; set back to `true` when pressure recedes.
pub fn set_metrics_globally_enabled(enabled: bool) {
    METRICS_ENABLED.store(enabled, Ordering::Relaxed);
}

/// RAII guard tracking write-path nesting on this thread.
///
/// Acquired on entry to any write that could emit metrics. Emission is
/// permitted only at depth one — a nested write is, by construction, the
/// metric write itself (or retention fallout of one).
pub struct WriteDepthGuard;

impl WriteDepthGuard {
    /// Enter a write path.
    pub fn enter() -> Self {
        WRITE_DEPTH.with(|d| d.set(d.get() + 1));
        WriteDepthGuard
    }

    /// True when this write is the outermost on its thread.
    ///
    /// Emission additionally requires the process-wide switch; the caller
    /// checks that separately so the two suppressions count apart.
    pub fn may_emit(&self) -> bool {
        WRITE_DEPTH.with(|d| d.get()) <= 1
    }
}

impl Drop for WriteDepthGuard {
    fn drop(&mut self) {
        WRITE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Observable engine counters, exposed to external metric collectors.
#[derive(Debug, Default)]
pub struct RepositoryCounters {
    /// Successful creates.
    pub creates: AtomicU64,
    /// Successful full-entity updates.
    pub updates: AtomicU64,
    /// Successful tag appends.
    pub tag_appends: AtomicU64,
    /// Successful deletes.
    pub deletes: AtomicU64,
    /// Read operations (any outcome).
    pub reads: AtomicU64,
    /// WAL records appended.
    pub wal_appends: AtomicU64,
    /// Checkpoints completed.
    pub checkpoints: AtomicU64,
    /// Tags trimmed by retention.
    pub retention_trims: AtomicU64,
    /// Metric entities written.
    pub metric_writes: AtomicU64,
    /// Metric emissions suppressed by the recursion guard or kill-switch.
    pub metric_suppressions: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Successful creates.
    pub creates: u64,
    /// Successful updates.
    pub updates: u64,
    /// Successful tag appends.
    pub tag_appends: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Read operations.
    pub reads: u64,
    /// WAL records appended.
    pub wal_appends: u64,
    /// Checkpoints completed.
    pub checkpoints: u64,
    /// Tags trimmed by retention.
    pub retention_trims: u64,
    /// Metric entities written.
    pub metric_writes: u64,
    /// Suppressed metric emissions.
    pub metric_suppressions: u64,
}

impl RepositoryCounters {
    /// Snapshot every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            tag_appends: self.tag_appends.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            wal_appends: self.wal_appends.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            retention_trims: self.retention_trims.load(Ordering::Relaxed),
            metric_writes: self.metric_writes.load(Ordering::Relaxed),
            metric_suppressions: self.metric_suppressions.load(Ordering::Relaxed),
        }
    }
}

/// Derive the stable, pure-hex id of a named metric entity.
///
/// Pure-hex by construction, which means a probe for a metric entity that
/// was never written is exactly the artifact the recovery skip rule is
/// tuned for.
pub fn metric_entity_id(name: &str) -> entitydb_core::EntityId {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{:02x}", byte));
    }
    entitydb_core::EntityId::parse(&hex).expect("hex digest is a valid id")
}
