//! Memory monitor
//!
//! Samples process memory on its own thread and maps usage to pressure
//! levels. When the level rises, every registered pressure callback runs
//! with the new usage ratio; callbacks must be short and must not hold user
//! locks on return. Crossing into critical additionally flips the global
//! metrics kill-switch until pressure recedes.
//!
//! Levels: low (< 60%), medium (60–80%), high (80–90%), critical (> 90%),
//! with the high/critical boundaries configurable.

use crate::metrics::set_metrics_globally_enabled;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{info, warn};

/// Pressure level derived from the memory usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PressureLevel {
    /// Below the medium boundary.
    Low = 0,
    /// Elevated but not yet actionable.
    Medium = 1,
    /// Pressure callbacks fire.
    High = 2,
    /// Callbacks fire and metrics are suppressed globally.
    Critical = 3,
}

impl PressureLevel {
    fn from_u8(v: u8) -> PressureLevel {
        match v {
            0 => PressureLevel::Low,
            1 => PressureLevel::Medium,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }
}

/// A registered pressure callback; receives the usage ratio.
pub type PressureCallback = Box<dyn Fn(f64) + Send + Sync>;

/// Level boundaries as fractions of total memory.
#[derive(Debug, Clone, Copy)]
pub struct PressureThresholds {
    /// Low/medium boundary.
    pub medium: f64,
    /// Medium/high boundary — callbacks fire from here up.
    pub high: f64,
    /// High/critical boundary.
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        PressureThresholds {
            medium: 0.60,
            high: 0.80,
            critical: 0.90,
        }
    }
}

impl PressureThresholds {
    /// Map a usage ratio to its level.
    pub fn level_for(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.critical {
            PressureLevel::Critical
        } else if ratio >= self.high {
            PressureLevel::High
        } else if ratio >= self.medium {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }
}

struct MonitorShared {
    callbacks: RwLock<Vec<PressureCallback>>,
    level: AtomicU8,
    thresholds: PressureThresholds,
    /// What the metrics switch returns to when critical pressure recedes;
    /// a config-disabled engine must stay disabled.
    metrics_baseline: bool,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

impl MonitorShared {
    /// Apply one sample: update the level and fire callbacks on an upward
    /// transition.
    fn observe(&self, ratio: f64) {
        let new_level = self.thresholds.level_for(ratio);
        let old_level =
            PressureLevel::from_u8(self.level.swap(new_level as u8, Ordering::AcqRel));

        if new_level > old_level && new_level >= PressureLevel::High {
            warn!(?new_level, ratio, "memory pressure rose; invoking callbacks");
            for callback in self.callbacks.read().iter() {
                callback(ratio);
            }
        }
        if new_level == PressureLevel::Critical && old_level < PressureLevel::Critical {
            warn!("critical memory pressure; suppressing metrics globally");
            set_metrics_globally_enabled(false);
        } else if old_level == PressureLevel::Critical && new_level < PressureLevel::Critical {
            info!("memory pressure receded from critical; restoring metrics switch");
            set_metrics_globally_enabled(self.metrics_baseline);
        }
    }
}

/// Background sampler of process memory usage.
pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    /// Start the monitor thread.
    ///
    /// `metrics_baseline` is the configured metrics switch; it is what the
    /// switch returns to when critical pressure recedes, so a
    /// config-disabled engine stays disabled.
    pub fn start(
        thresholds: PressureThresholds,
        sample_interval: Duration,
        metrics_baseline: bool,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            callbacks: RwLock::new(Vec::new()),
            level: AtomicU8::new(PressureLevel::Low as u8),
            thresholds,
            metrics_baseline,
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("entitydb-memmon".to_string())
            .spawn(move || sample_loop(&thread_shared, sample_interval))
            .expect("failed to spawn memory monitor thread");

        MemoryMonitor {
            shared,
            handle: Some(handle),
        }
    }

    /// Register a pressure callback. Fired on each upward transition into
    /// high or critical, on the monitor's thread.
    pub fn register_callback(&self, callback: PressureCallback) {
        self.shared.callbacks.write().push(callback);
    }

    /// The most recently observed level.
    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.shared.level.load(Ordering::Acquire))
    }

    /// Feed one usage ratio directly, bypassing sysinfo. Test seam, also
    /// usable by an embedder with its own accounting.
    pub fn observe_ratio(&self, ratio: f64) {
        self.shared.observe(ratio);
    }

    /// Stop the monitor thread and wait for it.
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

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sample_loop(shared: &Arc<MonitorShared>, interval: Duration) {
    let pid = Pid::from_u32(std::process::id());
    let refresh = RefreshKind::new()
        .with_memory(sysinfo::MemoryRefreshKind::everything())
        .with_processes(ProcessRefreshKind::new().with_memory());
    let mut system = System::new_with_specifics(refresh);

    loop {
        {
            let mut down = shared.shutdown.lock();
            if *down {
                return;
            }
            // Condvar wait doubles as the sampling timer
            shared.shutdown_cv.wait_for(&mut down, interval);
            if *down {
                return;
            }
        }

        system.refresh_specifics(refresh);
        let total = system.total_memory();
        if total == 0 {
            continue;
        }
        let used = system
            .process(pid)
            .map(|p| p.memory())
            .unwrap_or(0);
        shared.observe(used as f64 / total as f64);
    }
}
