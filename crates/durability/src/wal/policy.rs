//! WAL fsync policy
//!
//! Controls when appended WAL records are flushed to stable storage.

use std::time::Duration;

/// When the WAL writer calls fsync.
///
/// | Policy | fsync | Data-loss window |
/// |--------|-------|------------------|
/// | PerOperation | every append | zero |
/// | EveryN | every N appends | up to N-1 operations |
/// | Periodic | at most every interval | up to one interval |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every append (slowest, zero loss).
    PerOperation,

    /// fsync once per N appends.
    EveryN(u32),

    /// fsync when the given interval has elapsed since the last sync.
    ///
    /// Evaluated on each append; an idle WAL is additionally synced on
    /// checkpoint and close.
    Periodic(Duration),
}

impl FsyncPolicy {
    /// Whether an append under this policy must sync now.
    pub fn should_sync(&self, ops_since_sync: u32, elapsed_since_sync: Duration) -> bool {
        match self {
            FsyncPolicy::PerOperation => true,
            FsyncPolicy::EveryN(n) => ops_since_sync >= *n,
            FsyncPolicy::Periodic(interval) => elapsed_since_sync >= *interval,
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> String {
        match self {
            FsyncPolicy::PerOperation => "per-operation".to_string(),
            FsyncPolicy::EveryN(n) => format!("every {} operations", n),
            FsyncPolicy::Periodic(d) => format!("every {:?}", d),
        }
    }
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::PerOperation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_operation_always_syncs() {
        let p = FsyncPolicy::PerOperation;
        assert!(p.should_sync(0, Duration::ZERO));
        assert!(p.should_sync(100, Duration::ZERO));
    }

    #[test]
    fn every_n_syncs_at_threshold() {
        let p = FsyncPolicy::EveryN(10);
        assert!(!p.should_sync(9, Duration::ZERO));
        assert!(p.should_sync(10, Duration::ZERO));
    }

    #[test]
    fn periodic_syncs_after_interval() {
        let p = FsyncPolicy::Periodic(Duration::from_millis(100));
        assert!(!p.should_sync(1000, Duration::from_millis(50)));
        assert!(p.should_sync(0, Duration::from_millis(150)));
    }
}
