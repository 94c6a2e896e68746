//! Statistics sink and process resource sampling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::ports::{Clock, SystemClock};

/// Point-in-time view of the pool counters.
///
/// `active + idle + vacant == capacity` while the pool is alive. `vacant` is
/// only non-zero while a replacement keeps failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub idle: usize,
    pub vacant: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub replaced: u64,
    pub memory: ResourceSnapshot,
}

/// Process-wide resource usage at one moment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

/// How long a sample is reused before `/proc` is read again.
const SAMPLE_MAX_AGE: Duration = Duration::from_millis(250);

/// Samples memory usage of the current process.
///
/// A batch finishing many tasks at once shares one sample instead of
/// queueing on the process refresh.
pub struct ResourceMonitor {
    pid: Pid,
    system: Mutex<System>,
    last: Mutex<Option<(Instant, ResourceSnapshot)>>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );

        Self {
            pid,
            system: Mutex::new(system),
            last: Mutex::new(None),
            max_age: SAMPLE_MAX_AGE,
            clock,
        }
    }

    /// Reuse samples for `max_age`. `Duration::ZERO` samples every time.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn cached(&self) -> Option<ResourceSnapshot> {
        match &*self.last.lock() {
            Some((at, snap)) if at.elapsed() < self.max_age => Some(snap.clone()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        if let Some(snap) = self.cached() {
            return snap;
        }
        let mut system = self.system.lock();
        // someone else may have sampled while we waited for the lock
        if let Some(snap) = self.cached() {
            return snap;
        }
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let snap = self.read(&system);
        *self.last.lock() = Some((Instant::now(), snap.clone()));
        snap
    }

    fn read(&self, system: &System) -> ResourceSnapshot {
        match system.process(self.pid) {
            Some(process) => ResourceSnapshot {
                taken_at: self.clock.now(),
                rss_bytes: process.memory(),
                virtual_bytes: process.virtual_memory(),
            },
            None => ResourceSnapshot {
                taken_at: self.clock.now(),
                ..Default::default()
            },
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
