//! Per-recipe phase coordination.
//!
//! Every recipe owns a worker thread driving its phases in order. The worker
//! sleeps while `current_phase >= target_phase`; any thread may extend the
//! target (never lower it) and wake the worker. Waits are short condvar
//! sleeps in a predicate loop, so the process-wide shutdown flag is observed
//! within one tick even without a notification.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::core::phase::Phase;
use crate::core::recipe::Recipe;
use crate::engine::phases::{self, PhaseOutcome};
use crate::engine::EngineInner;
use crate::shutdown;

/// Upper bound on how long a blocked wait can miss a state change.
const WAIT_TICK: Duration = Duration::from_millis(25);

/// Synchronization record of one recipe; all cross-thread phase state lives
/// here, never in the recipe object.
pub(crate) struct Coordination {
    mutex: Mutex<()>,
    condvar: Condvar,
    current_phase: AtomicI32,
    target_phase: AtomicI32,
    failed: AtomicBool,
    barrier_checked_in: AtomicBool,
}

impl Coordination {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            current_phase: AtomicI32::new(-1),
            target_phase: AtomicI32::new(-1),
            failed: AtomicBool::new(false),
            barrier_checked_in: AtomicBool::new(false),
        }
    }

    pub fn current_phase(&self) -> i32 {
        self.current_phase.load(Ordering::SeqCst)
    }

    pub fn target_phase(&self) -> i32 {
        self.target_phase.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Raises the target phase to at least `phase` and wakes the worker.
    /// Targets are monotonic: a lower request leaves the target untouched.
    pub fn extend_target(&self, phase: i32) {
        self.target_phase.fetch_max(phase, Ordering::SeqCst);
        self.notify();
    }

    pub fn advance_current(&self, phase: i32) {
        self.current_phase.store(phase, Ordering::SeqCst);
        self.notify();
    }

    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// Marks this recipe's resolution-barrier check-in as consumed; returns
    /// true the first time only.
    pub fn barrier_check_in(&self) -> bool {
        !self.barrier_checked_in.swap(true, Ordering::SeqCst)
    }

    fn notify(&self) {
        let _guard = self.mutex.lock().expect("coordination mutex poisoned");
        self.condvar.notify_all();
    }

    /// Sleeps until notified or one tick elapses; callers re-check their
    /// predicate afterwards.
    pub fn wait_tick(&self) {
        let guard = self.mutex.lock().expect("coordination mutex poisoned");
        let _ = self
            .condvar
            .wait_timeout(guard, WAIT_TICK)
            .expect("coordination mutex poisoned");
    }
}

/// Engine-level counter of workers not yet past recipe-load.
///
/// [`ResolutionBarrier::wait`] returns once every known recipe has completed
/// (or abandoned) phase 0: after that the set of recipes and the static graph
/// are frozen, modulo weak fallbacks instantiated during resolution, which
/// re-raise the counter for late waiters.
pub(crate) struct ResolutionBarrier {
    pending: Mutex<usize>,
    condvar: Condvar,
}

impl ResolutionBarrier {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn register(&self) {
        let mut pending = self.pending.lock().expect("barrier mutex poisoned");
        *pending += 1;
    }

    pub fn arrive(&self) {
        let mut pending = self.pending.lock().expect("barrier mutex poisoned");
        debug_assert!(*pending > 0, "barrier arrivals exceed registrations");
        *pending = pending.saturating_sub(1);
        self.condvar.notify_all();
    }

    pub fn wait(&self, closed: &AtomicBool) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().expect("barrier mutex poisoned");
        loop {
            if *pending == 0 {
                return Ok(());
            }
            shutdown::check()?;
            if closed.load(Ordering::SeqCst) {
                return Err(crate::core::errors::EnvyError::Cancelled.into());
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(pending, WAIT_TICK)
                .expect("barrier mutex poisoned");
            pending = guard;
        }
    }
}

/// Body of a recipe's worker thread.
///
/// The loop: wait for a target extension, execute the next phase body, bump
/// `current_phase`, notify waiters. A phase failure marks the recipe failed,
/// records the error with the engine, releases the cache lock and stops the
/// worker.
pub(crate) fn worker_main(
    engine: Arc<EngineInner>,
    recipe: Arc<Recipe>,
    coord: Arc<Coordination>,
) {
    loop {
        if coord.current_phase() >= Phase::Completion.index() {
            break;
        }

        // Idle until there is work, a failure, or teardown.
        while coord.current_phase() >= coord.target_phase()
            && !coord.is_failed()
            && !engine.is_closed()
            && !shutdown::is_requested()
        {
            coord.wait_tick();
        }

        if coord.is_failed() || engine.is_closed() {
            break;
        }
        if shutdown::is_requested() {
            let phase = Phase::from_index(coord.current_phase() + 1).unwrap_or(Phase::Completion);
            engine.record_failure(
                recipe.key().clone(),
                phase,
                crate::core::errors::EnvyError::Cancelled.into(),
            );
            coord.fail();
            break;
        }

        let next = coord.current_phase() + 1;
        let phase = Phase::from_index(next).expect("target phase out of range");

        // A panic in a hook (or anywhere in a phase body) becomes a regular
        // failure; a hung waiter is worse than a poisoned lock.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            phases::run_phase(&engine, &recipe, phase)
        }))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Err(anyhow::anyhow!("phase body panicked: {message}"))
        });

        match result {
            Ok(outcome) => {
                let new_current = match outcome {
                    PhaseOutcome::Advance => next,
                    PhaseOutcome::SkipTo(skip_to) => {
                        debug!(recipe = %recipe.key(), to = %skip_to, "short-circuiting");
                        skip_to.index() - 1
                    }
                };
                coord.advance_current(new_current);
                if phase == Phase::RecipeLoad {
                    engine.barrier_arrive(&coord);
                }
            }
            Err(err) => {
                error!(recipe = %recipe.key(), phase = %phase, "phase failed: {err:#}");
                engine.record_failure(recipe.key().clone(), phase, err);
                coord.fail();
                // The failing recipe must not keep its cache entry pinned.
                recipe.data().cache_lock.take();
                break;
            }
        }
    }

    // A worker that exits before finishing recipe-load must still check in,
    // or the resolution barrier would wait forever.
    engine.barrier_arrive(&coord);
    if coord.current_phase() < Phase::Completion.index() {
        recipe.data().cache_lock.take();
    }
    debug!(recipe = %recipe.key(), "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_phases_are_minus_one() {
        let coord = Coordination::new();
        assert_eq!(coord.current_phase(), -1);
        assert_eq!(coord.target_phase(), -1);
        assert!(!coord.is_failed());
    }

    #[test]
    fn target_is_monotonic_non_decreasing() {
        let coord = Coordination::new();
        coord.extend_target(3);
        assert_eq!(coord.target_phase(), 3);
        // Lower requests never lower the target.
        coord.extend_target(1);
        assert_eq!(coord.target_phase(), 3);
        coord.extend_target(7);
        assert_eq!(coord.target_phase(), 7);
    }

    #[test]
    fn barrier_check_in_is_consumed_once() {
        let coord = Coordination::new();
        assert!(coord.barrier_check_in());
        assert!(!coord.barrier_check_in());
    }

    #[test]
    fn barrier_clears_when_all_arrive() {
        let barrier = ResolutionBarrier::new();
        barrier.register();
        barrier.register();
        barrier.arrive();
        barrier.arrive();
        barrier.wait(&AtomicBool::new(false)).unwrap();
    }

    #[test]
    fn barrier_wait_aborts_on_teardown() {
        let barrier = ResolutionBarrier::new();
        barrier.register();
        assert!(barrier.wait(&AtomicBool::new(true)).is_err());
    }
}
