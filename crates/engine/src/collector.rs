//! Deletion collector
//!
//! A bounded background service that walks the corpus on an interval and
//! applies lifecycle policies: `active → soft_deleted → archived → purged`.
//! Every transition is an ordinary tag write through the repository, so it
//! is WAL-durable and indexed like any caller mutation — the collector has
//! no private locks and no private write path.
//!
//! Each cycle processes entities in batches across a small worker pool,
//! respects a max-runtime budget (the in-flight batch completes, then the
//! cycle ends), and supports a dry-run mode that logs without mutating.

use crate::repository::EntityRepository;
use crate::retention::{default_lifecycle_policies, transition_tag, RetentionPolicy};
use entitydb_core::{EntityId, LifecycleState};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Collector tuning.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Hard budget per cycle; the in-flight batch finishes, then the cycle
    /// stops.
    pub max_runtime: Duration,
    /// Entities per batch.
    pub batch_size: usize,
    /// Worker threads per cycle.
    pub concurrency: usize,
    /// Log transitions without performing them.
    pub dry_run: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            interval: Duration::from_secs(3600),
            max_runtime: Duration::from_secs(300),
            batch_size: 100,
            concurrency: 4,
            dry_run: false,
        }
    }
}

/// Collector statistics, all monotonically increasing.
#[derive(Debug, Default)]
pub struct CollectorStats {
    /// Completed cycles.
    pub runs: AtomicU64,
    /// Entities examined.
    pub entities_processed: AtomicU64,
    /// Transitions into soft_deleted.
    pub soft_deleted: AtomicU64,
    /// Transitions into archived.
    pub archived: AtomicU64,
    /// Transitions into purged.
    pub purged: AtomicU64,
    /// Failed transition writes.
    pub errors: AtomicU64,
}

impl CollectorStats {
    fn record_transition(&self, to: LifecycleState) {
        match to {
            LifecycleState::SoftDeleted => self.soft_deleted.fetch_add(1, Ordering::Relaxed),
            LifecycleState::Archived => self.archived.fetch_add(1, Ordering::Relaxed),
            LifecycleState::Purged => self.purged.fetch_add(1, Ordering::Relaxed),
            LifecycleState::Active => 0,
        };
    }

    /// Transitions per target state, for reporting.
    pub fn transitions(&self) -> HashMap<LifecycleState, u64> {
        let mut map = HashMap::new();
        map.insert(
            LifecycleState::SoftDeleted,
            self.soft_deleted.load(Ordering::Relaxed),
        );
        map.insert(
            LifecycleState::Archived,
            self.archived.load(Ordering::Relaxed),
        );
        map.insert(LifecycleState::Purged, self.purged.load(Ordering::Relaxed));
        map
    }
}

struct CollectorShared {
    repo: Arc<EntityRepository>,
    policies: Vec<RetentionPolicy>,
    config: CollectorConfig,
    stats: CollectorStats,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

/// Handle to the background collector thread.
pub struct DeletionCollector {
    shared: Arc<CollectorShared>,
    handle: Option<JoinHandle<()>>,
}

impl DeletionCollector {
    /// Start the collector with the built-in lifecycle policies.
    pub fn start(repo: Arc<EntityRepository>, config: CollectorConfig) -> Self {
        Self::start_with_policies(repo, config, default_lifecycle_policies())
    }

    /// Start the collector with caller-supplied policies; highest priority
    /// (lowest number) wins per entity.
    pub fn start_with_policies(
        repo: Arc<EntityRepository>,
        config: CollectorConfig,
        mut policies: Vec<RetentionPolicy>,
    ) -> Self {
        policies.sort_by_key(|p| p.priority);
        let shared = Arc::new(CollectorShared {
            repo,
            policies,
            config,
            stats: CollectorStats::default(),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("entitydb-collector".to_string())
            .spawn(move || collector_loop(&thread_shared))
            .expect("failed to spawn deletion collector thread");

        DeletionCollector {
            shared,
            handle: Some(handle),
        }
    }

    /// Run one cycle synchronously. Used by tests and by operators who
    /// want an immediate pass.
    pub fn run_cycle_now(&self) {
        run_cycle(&self.shared);
    }

    /// Collector statistics.
    pub fn stats(&self) -> &CollectorStats {
        &self.shared.stats
    }

    /// Stop the collector and wait for the thread.
    pub fn shutdown(&mut self) {
        {
            let mut down = self.shared.shutdown.lock();
            *down = true;
            self.shared.shutdown_cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeletionCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn collector_loop(shared: &Arc<CollectorShared>) {
    loop {
        {
            let mut down = shared.shutdown.lock();
            if *down {
                return;
            }
            shared
                .shutdown_cv
                .wait_for(&mut down, shared.config.interval);
            if *down {
                return;
            }
        }
        run_cycle(shared);
    }
}

fn run_cycle(shared: &Arc<CollectorShared>) {
    let started = Instant::now();
    let candidates: Vec<EntityId> = match shared.repo.list() {
        Ok(summaries) => summaries.into_iter().map(|s| s.id).collect(),
        Err(e) => {
            warn!(error = %e, "collector cannot list entities; skipping cycle");
            return;
        }
    };

    debug!(candidates = candidates.len(), "deletion collector cycle start");
    let mut processed = 0u64;

    for batch in candidates.chunks(shared.config.batch_size.max(1)) {
        if started.elapsed() >= shared.config.max_runtime {
            info!(
                processed,
                elapsed = ?started.elapsed(),
                "collector cycle hit its runtime budget"
            );
            break;
        }
        processed += batch.len() as u64;

        // A short-lived worker pool per batch; transitions go through the
        // ordinary writer path, so no extra locks are needed here
        let workers = shared.config.concurrency.max(1).min(batch.len().max(1));
        std::thread::scope(|scope| {
            let per_worker = (batch.len() + workers - 1) / workers;
            for chunk in batch.chunks(per_worker.max(1)) {
                let shared = Arc::clone(shared);
                scope.spawn(move || {
                    for id in chunk {
                        process_entity(&shared, id);
                    }
                });
            }
        });
    }

    shared
        .stats
        .entities_processed
        .fetch_add(processed, Ordering::Relaxed);
    shared.stats.runs.fetch_add(1, Ordering::Relaxed);
    debug!(processed, "deletion collector cycle complete");
}

fn process_entity(shared: &CollectorShared, id: &EntityId) {
    let entity = match shared.repo.get(id) {
        Ok(entity) => entity,
        Err(_) => return,
    };
    let now = shared.repo.clock().now();

    // Policies are priority-sorted; the first matching rule wins
    let Some((policy, rule)) = shared
        .policies
        .iter()
        .find_map(|p| p.first_matching_rule(&entity, now).map(|r| (p, r)))
    else {
        return;
    };

    if shared.config.dry_run {
        info!(
            id = %id,
            policy = %policy.name,
            from = %rule.from_state,
            to = %rule.to_state,
            reason = %rule.reason,
            "dry-run: would transition"
        );
        return;
    }

    let tag = transition_tag(rule.to_state, now);
    match shared.repo.add_tag(id, &tag.wire()) {
        Ok(_) => {
            debug!(id = %id, to = %rule.to_state, reason = %rule.reason, "lifecycle transition");
            shared.stats.record_transition(rule.to_state);
        }
        Err(e) => {
            warn!(id = %id, error = %e, "lifecycle transition failed");
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
