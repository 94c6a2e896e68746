//! Pool registry: the fixed set of execution units, which of them are idle,
//! and the FIFO of callers waiting for one.
//!
//! All bookkeeping lives in one [`RegistryState`] behind a single mutex. The
//! lock is never held across an `.await`; the only code that runs under it
//! besides our own is the [`UnitFactory`] when a unit is (re)built.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::backoff::ReplacementPolicy;
use super::lease::UnitLease;
use crate::config::UNIT_CHANNEL_CAPACITY;
use crate::domain::{TaskId, UnitId};
use crate::error::{PoolError, UnitInitError};
use crate::ports::{IdGenerator, UnitFactory};
use crate::typed::HandlerRegistry;
use crate::unit::worker::unit_loop;
use crate::unit::{UnitRequest, UnitResponse};

/// Exclusive handle on one live execution unit.
///
/// Only one handle per slot exists at a time; whoever holds it is the only
/// party talking to the unit.
pub(crate) struct UnitHandle {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) unit_id: UnitId,
    pub(crate) requests: mpsc::Sender<UnitRequest>,
    pub(crate) responses: mpsc::Receiver<UnitResponse>,
}

/// Sent by a unit's watcher when the unit task panicked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CrashReport {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) unit_id: UnitId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Initializing,
    Ready,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Idle,
    /// Handed out. `task` is set once a task was sent to the unit; probes
    /// leave it empty.
    Busy {
        since: Instant,
        task: Option<TaskId>,
    },
    /// Replacement failed; the supervisor retries at `retry_at`.
    Vacant { failures: u32, retry_at: Instant },
}

struct Slot {
    generation: u64,
    unit_id: Option<UnitId>,
    abort: Option<AbortHandle>,
    state: SlotState,
}

type Waiter = oneshot::Sender<Result<UnitHandle, PoolError>>;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    failed: u64,
    replaced: u64,
}

struct RegistryState {
    lifecycle: Lifecycle,
    slots: Vec<Slot>,
    idle: VecDeque<UnitHandle>,
    waiters: VecDeque<Waiter>,
    counters: Counters,
}

/// Counter values read under the registry lock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RegistryCounts {
    pub(crate) capacity: usize,
    pub(crate) active: usize,
    pub(crate) idle: usize,
    pub(crate) vacant: usize,
    pub(crate) queued: usize,
    pub(crate) completed: u64,
    pub(crate) failed: u64,
    pub(crate) replaced: u64,
}

/// Why [`PoolRegistry::start`] could not bring up the initial units.
#[derive(Debug)]
pub(crate) enum StartError {
    Init { slot: usize, source: UnitInitError },
    MissingKinds { missing: Vec<String> },
}

pub(crate) struct PoolRegistry {
    state: Mutex<RegistryState>,
    factory: Arc<dyn UnitFactory>,
    ids: Arc<dyn IdGenerator>,
    runtime: Handle,
    crashes: mpsc::UnboundedSender<CrashReport>,
    replacement: ReplacementPolicy,
}

impl RegistryState {
    fn is_current(&self, slot: usize, generation: u64) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.generation == generation)
    }

    fn mark_busy(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Busy {
            since: Instant::now(),
            task: None,
        };
    }

    /// Give `unit` to the oldest live waiter, or park it in the idle set.
    fn hand_off(&mut self, mut unit: UnitHandle) {
        while let Some(waiter) = self.waiters.pop_front() {
            self.mark_busy(unit.slot);
            match waiter.send(Ok(unit)) {
                Ok(()) => return,
                // waiter gave up (timeout / dropped); try the next one
                Err(Ok(returned)) => unit = returned,
                Err(Err(_)) => return,
            }
        }
        self.slots[unit.slot].state = SlotState::Idle;
        self.idle.push_back(unit);
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn vacant(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Vacant { .. }))
            .count()
    }

    /// Every slot is vacant and has used up its replacement attempts.
    fn exhausted(&self, policy: &ReplacementPolicy) -> Option<PoolError> {
        let mut worst: Option<(usize, u32)> = None;
        for (slot, s) in self.slots.iter().enumerate() {
            match s.state {
                SlotState::Vacant { failures, .. } if policy.is_exhausted(failures) => {
                    if worst.is_none_or(|(_, f)| failures > f) {
                        worst = Some((slot, failures));
                    }
                }
                _ => return None,
            }
        }
        worst.map(|(slot, attempts)| PoolError::ReplacementFailed {
            slot,
            attempts,
            reason: "no execution unit could be constructed".to_string(),
        })
    }
}

impl PoolRegistry {
    /// Build the registry and eagerly spawn `capacity` units.
    pub(crate) fn start(
        capacity: usize,
        factory: Arc<dyn UnitFactory>,
        ids: Arc<dyn IdGenerator>,
        runtime: Handle,
        crashes: mpsc::UnboundedSender<CrashReport>,
        replacement: ReplacementPolicy,
        expected_kinds: &[String],
    ) -> Result<Arc<Self>, StartError> {
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState {
                lifecycle: Lifecycle::Initializing,
                slots: Vec::with_capacity(capacity),
                idle: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
                counters: Counters::default(),
            }),
            factory,
            ids,
            runtime,
            crashes,
            replacement,
        });

        {
            let mut state = registry.state.lock();
            for slot in 0..capacity {
                let spawned = registry
                    .factory
                    .create(slot)
                    .map_err(|source| StartError::Init { slot, source })
                    .and_then(|handlers| {
                        let missing = missing_kinds(&handlers, expected_kinds);
                        if missing.is_empty() {
                            Ok(registry.launch(slot, 0, handlers))
                        } else {
                            Err(StartError::MissingKinds { missing })
                        }
                    });

                let (unit, abort) = match spawned {
                    Ok(spawned) => spawned,
                    Err(err) => {
                        for s in state.slots.iter_mut() {
                            if let Some(abort) = s.abort.take() {
                                abort.abort();
                            }
                        }
                        state.idle.clear();
                        state.lifecycle = Lifecycle::Destroyed;
                        return Err(err);
                    }
                };

                state.slots.push(Slot {
                    generation: 0,
                    unit_id: Some(unit.unit_id),
                    abort: Some(abort),
                    state: SlotState::Idle,
                });
                state.idle.push_back(unit);
            }
            state.lifecycle = Lifecycle::Ready;
        }

        tracing::info!(capacity, "worker pool ready");
        Ok(registry)
    }

    /// Spawn the unit task and its crash watcher.
    fn launch(
        &self,
        slot: usize,
        generation: u64,
        handlers: HandlerRegistry,
    ) -> (UnitHandle, AbortHandle) {
        let unit_id = self.ids.generate_unit_id();
        let (request_tx, request_rx) = mpsc::channel(UNIT_CHANNEL_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(UNIT_CHANNEL_CAPACITY);

        let join = self
            .runtime
            .spawn(unit_loop(unit_id, slot, handlers, request_rx, response_tx));
        let abort = join.abort_handle();

        let crashes = self.crashes.clone();
        self.runtime.spawn(async move {
            match join.await {
                Err(err) if err.is_panic() => {
                    tracing::error!(%unit_id, slot, "execution unit panicked");
                    let _ = crashes.send(CrashReport {
                        slot,
                        generation,
                        unit_id,
                    });
                }
                // cancelled (replaced / destroyed) or a clean exit
                _ => {}
            }
        });

        let unit = UnitHandle {
            slot,
            generation,
            unit_id,
            requests: request_tx,
            responses: response_rx,
        };
        (unit, abort)
    }

    fn try_spawn(
        &self,
        slot: usize,
        generation: u64,
    ) -> Result<(UnitHandle, AbortHandle), UnitInitError> {
        let handlers = self.factory.create(slot)?;
        Ok(self.launch(slot, generation, handlers))
    }

    /// Take an idle unit, or wait in FIFO order for one to be released.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<UnitLease, PoolError> {
        let rx = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Ready {
                return Err(PoolError::PoolDestroyed);
            }
            if let Some(unit) = state.idle.pop_front() {
                state.mark_busy(unit.slot);
                tracing::debug!(slot = unit.slot, unit_id = %unit.unit_id, "acquired idle unit");
                return Ok(UnitLease::new(unit, Arc::clone(self)));
            }
            if let Some(err) = state.exhausted(&self.replacement) {
                return Err(err);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(queued = state.live_waiters(), "no idle unit, waiting");
            rx
        };

        let mut pending = PendingAcquire {
            rx,
            registry: self,
            settled: false,
        };
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut pending.rx).await {
                Ok(received) => received,
                Err(_) => return Err(PoolError::AcquisitionTimeout { waited: limit }),
            },
            None => (&mut pending.rx).await,
        };
        pending.settled = true;

        match received {
            Ok(Ok(unit)) => {
                tracing::debug!(slot = unit.slot, unit_id = %unit.unit_id, "acquired released unit");
                Ok(UnitLease::new(unit, Arc::clone(self)))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::PoolDestroyed),
        }
    }

    /// Return a unit. Handles of replaced units are dropped silently.
    pub(crate) fn release(&self, unit: UnitHandle) {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Ready {
            return;
        }
        if !state.is_current(unit.slot, unit.generation) {
            tracing::debug!(slot = unit.slot, unit_id = %unit.unit_id, "dropping handle of replaced unit");
            return;
        }
        state.hand_off(unit);
    }

    /// The unit received `task_id`. The stall clock starts here, not at
    /// acquisition.
    pub(crate) fn begin_task(&self, slot: usize, generation: u64, task_id: TaskId) {
        let mut state = self.state.lock();
        if !state.is_current(slot, generation) {
            return;
        }
        if let SlotState::Busy { .. } = state.slots[slot].state {
            state.slots[slot].state = SlotState::Busy {
                since: Instant::now(),
                task: Some(task_id),
            };
        }
    }

    /// Terminate the unit in `slot` (if still at `generation`) and install a
    /// fresh one. Returns `false` if the slot was already replaced.
    pub(crate) fn replace(&self, slot: usize, generation: u64, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Ready || !state.is_current(slot, generation) {
            return false;
        }
        self.reinstall(&mut state, slot, reason);
        true
    }

    fn reinstall(&self, state: &mut RegistryState, slot: usize, reason: &str) {
        let old_unit = state.slots[slot].unit_id.take();
        if let Some(abort) = state.slots[slot].abort.take() {
            abort.abort();
        }
        state.idle.retain(|u| u.slot != slot);

        let generation = state.slots[slot].generation + 1;
        state.slots[slot].generation = generation;

        match self.try_spawn(slot, generation) {
            Ok((unit, abort)) => {
                tracing::warn!(
                    slot,
                    old_unit = ?old_unit,
                    new_unit = %unit.unit_id,
                    reason,
                    "replaced execution unit"
                );
                state.slots[slot].unit_id = Some(unit.unit_id);
                state.slots[slot].abort = Some(abort);
                state.counters.replaced += 1;
                state.hand_off(unit);
            }
            Err(err) => {
                let retry_at = self.retry_at(Instant::now(), 1);
                tracing::error!(
                    slot,
                    old_unit = ?old_unit,
                    reason,
                    error = %err,
                    "could not construct replacement unit, slot left vacant"
                );
                state.slots[slot].state = SlotState::Vacant {
                    failures: 1,
                    retry_at,
                };
                self.reject_if_exhausted(state);
            }
        }
    }

    /// Retry vacant slots whose backoff elapsed. Returns the slots that
    /// have used up their attempts.
    pub(crate) fn retry_vacant(&self) -> Vec<PoolError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Ready {
            return Vec::new();
        }

        let now = Instant::now();
        let mut lost = Vec::new();
        for slot in 0..state.slots.len() {
            let SlotState::Vacant { failures, retry_at } = state.slots[slot].state else {
                continue;
            };
            if retry_at > now {
                if self.replacement.is_exhausted(failures) {
                    lost.push(PoolError::ReplacementFailed {
                        slot,
                        attempts: failures,
                        reason: "waiting for next retry".to_string(),
                    });
                }
                continue;
            }

            let generation = state.slots[slot].generation + 1;
            state.slots[slot].generation = generation;
            match self.try_spawn(slot, generation) {
                Ok((unit, abort)) => {
                    tracing::info!(slot, unit_id = %unit.unit_id, failures, "restored vacant slot");
                    state.slots[slot].unit_id = Some(unit.unit_id);
                    state.slots[slot].abort = Some(abort);
                    state.counters.replaced += 1;
                    state.hand_off(unit);
                }
                Err(err) => {
                    let failures = failures.saturating_add(1);
                    let retry_at = self.retry_at(now, failures);
                    if self.replacement.is_exhausted(failures) {
                        lost.push(PoolError::ReplacementFailed {
                            slot,
                            attempts: failures,
                            reason: err.to_string(),
                        });
                    } else {
                        tracing::warn!(slot, failures, error = %err, "replacement attempt failed");
                    }
                    state.slots[slot].state = SlotState::Vacant { failures, retry_at };
                }
            }
        }

        self.reject_if_exhausted(&mut state);
        lost
    }

    fn retry_at(&self, now: Instant, failures: u32) -> Instant {
        let delay = self.replacement.next_delay(failures);
        now.checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(24 * 60 * 60))
    }

    /// Nobody will ever be served: fail the queued acquirers now.
    fn reject_if_exhausted(&self, state: &mut RegistryState) {
        if let Some(err) = state.exhausted(&self.replacement) {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }

    /// Replace units that have been working on one task for too long.
    pub(crate) fn reap_stalled(&self, limit: Duration) -> usize {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Ready {
            return 0;
        }

        let stalled: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| match s.state {
                SlotState::Busy {
                    since,
                    task: Some(_),
                } if since.elapsed() >= limit => Some(slot),
                _ => None,
            })
            .collect();

        for &slot in &stalled {
            self.reinstall(&mut state, slot, "busy beyond stall threshold");
        }
        stalled.len()
    }

    /// Take every idle unit out of the idle set for probing. They count as
    /// busy until released or replaced.
    pub(crate) fn checkout_idle(self: &Arc<Self>) -> Vec<UnitLease> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Ready {
            return Vec::new();
        }
        let units: Vec<UnitHandle> = state.idle.drain(..).collect();
        units
            .into_iter()
            .map(|unit| {
                state.mark_busy(unit.slot);
                UnitLease::new(unit, Arc::clone(self))
            })
            .collect()
    }

    pub(crate) fn record_outcome(&self, success: bool) {
        let mut state = self.state.lock();
        if success {
            state.counters.completed += 1;
        } else {
            state.counters.failed += 1;
        }
    }

    pub(crate) fn counts(&self) -> RegistryCounts {
        let state = self.state.lock();
        let active = state
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Busy { .. }))
            .count();
        RegistryCounts {
            capacity: state.slots.len(),
            active,
            idle: state.idle.len(),
            vacant: state.vacant(),
            queued: state.live_waiters(),
            completed: state.counters.completed,
            failed: state.counters.failed,
            replaced: state.counters.replaced,
        }
    }

    pub(crate) fn vacant(&self) -> usize {
        self.state.lock().vacant()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Destroyed
    }

    /// Move to `Destroyed`: reject queued acquirers, close idle units, abort
    /// busy ones. Returns `false` if the registry was already destroyed.
    pub(crate) fn shut_down(&self) -> bool {
        let (waiters, idle, aborts) = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return false;
            }
            state.lifecycle = Lifecycle::Destroyed;

            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let idle: Vec<UnitHandle> = state.idle.drain(..).collect();
            let aborts: Vec<AbortHandle> = state
                .slots
                .iter_mut()
                .filter(|s| !matches!(s.state, SlotState::Idle))
                .filter_map(|s| s.abort.take())
                .collect();
            (waiters, idle, aborts)
        };

        tracing::debug!(
            waiters = waiters.len(),
            idle = idle.len(),
            busy = aborts.len(),
            "shutting down execution units"
        );
        for waiter in waiters {
            let _ = waiter.send(Err(PoolError::PoolDestroyed));
        }
        // dropping the request sender ends the unit loop
        drop(idle);
        for abort in aborts {
            abort.abort();
        }
        true
    }

    /// Abort an idle unit behind the registry's back, as an external kill would.
    #[cfg(test)]
    pub(crate) fn kill_idle_unit(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let slot = state.idle.front()?.slot;
        if let Some(abort) = state.slots[slot].abort.take() {
            abort.abort();
        }
        Some(slot)
    }

    /// Make an idle unit run `handler_kind` while it still sits in the idle
    /// set, so nothing on the dispatch path notices what happens to it.
    #[cfg(test)]
    pub(crate) fn run_on_idle_unit(&self, handler_kind: &str) -> Option<usize> {
        let state = self.state.lock();
        let unit = state.idle.front()?;
        unit.requests
            .try_send(UnitRequest::Run {
                task_id: TaskId::generate(),
                handler_kind: crate::domain::HandlerKind::new(handler_kind),
                payload: serde_json::json!({}),
            })
            .ok()?;
        Some(unit.slot)
    }

    #[cfg(test)]
    pub(crate) fn generation(&self, slot: usize) -> u64 {
        self.state.lock().slots[slot].generation
    }
}

/// A queued acquisition. If the caller stops waiting (timeout or dropped
/// future) after a unit was already handed over, the unit goes back.
struct PendingAcquire<'a> {
    rx: oneshot::Receiver<Result<UnitHandle, PoolError>>,
    registry: &'a PoolRegistry,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(Ok(unit)) = self.rx.try_recv() {
            self.registry.release(unit);
        }
        self.registry
            .state
            .lock()
            .waiters
            .retain(|w| !w.is_closed());
    }
}

fn missing_kinds(handlers: &HandlerRegistry, expected: &[String]) -> Vec<String> {
    let registered = handlers.registered_kinds();
    expected
        .iter()
        .filter(|kind| !registered.contains(kind))
        .cloned()
        .collect()
}
