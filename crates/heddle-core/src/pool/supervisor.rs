//! Health supervisor.
//!
//! Runs in the background for the lifetime of the pool:
//! - every `interval` it probes the idle units and replaces the silent ones
//! - units busy on one task past the stall threshold are replaced
//! - crash reports from unit watchers trigger an immediate replacement
//! - vacant slots are retried with backoff

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::registry::{CrashReport, PoolRegistry};

/// What one supervision round found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub probed: usize,
    pub unresponsive: usize,
    pub stalled: usize,
    pub crashed: usize,
    pub vacant: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unresponsive == 0 && self.stalled == 0 && self.crashed == 0 && self.vacant == 0
    }
}

pub(crate) struct HealthSupervisor {
    registry: Arc<PoolRegistry>,
    interval: Duration,
    probe_timeout: Duration,
    stall_after: Option<Duration>,
    /// Crash reports received since the last round.
    crashes_seen: AtomicUsize,
}

impl HealthSupervisor {
    pub(crate) fn new(
        registry: Arc<PoolRegistry>,
        interval: Duration,
        probe_timeout: Duration,
        stall_after: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            interval,
            probe_timeout,
            stall_after,
            crashes_seen: AtomicUsize::new(0),
        }
    }

    /// One full check of every unit. Busy units are left alone unless they
    /// exceeded the stall threshold.
    pub(crate) async fn run_round(&self) -> HealthReport {
        let mut report = HealthReport {
            crashed: self.crashes_seen.swap(0, Ordering::Relaxed),
            ..HealthReport::default()
        };

        for lost in self.registry.retry_vacant() {
            tracing::error!(error = %lost, "execution unit slot is lost");
        }

        if let Some(limit) = self.stall_after {
            report.stalled = self.registry.reap_stalled(limit);
        }

        let leases = self.registry.checkout_idle();
        report.probed = leases.len();

        let probe_timeout = self.probe_timeout;
        let probes = leases.into_iter().map(|mut lease| async move {
            let alive = lease.probe(probe_timeout).await;
            (lease, alive)
        });

        for (lease, alive) in join_all(probes).await {
            if alive {
                lease.release();
            } else {
                tracing::warn!(
                    slot = ?lease.slot(),
                    unit_id = ?lease.unit_id(),
                    timeout = ?probe_timeout,
                    "execution unit did not answer probe"
                );
                report.unresponsive += 1;
                lease.replace("no response to health probe");
            }
        }

        report.vacant = self.registry.vacant();
        if !report.is_healthy() {
            tracing::info!(?report, "health round found problems");
        }
        report
    }

    /// Replace a crashed unit. Returns `false` if it was already replaced.
    pub(crate) fn handle_crash(&self, crash: CrashReport) -> bool {
        self.crashes_seen.fetch_add(1, Ordering::Relaxed);
        self.registry
            .replace(crash.slot, crash.generation, "execution unit crashed")
    }

    /// Background loop. Ends when `shutdown` is cancelled.
    pub(crate) async fn supervise(
        self: Arc<Self>,
        mut crashes: mpsc::UnboundedReceiver<CrashReport>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(interval = ?self.interval, "health supervisor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(crash) = crashes.recv() => {
                    tracing::debug!(slot = crash.slot, unit_id = %crash.unit_id, "crash reported");
                    self.handle_crash(crash);
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.run_round() => {}
                    }
                }
            }
        }
        tracing::debug!("health supervisor stopped");
    }
}
