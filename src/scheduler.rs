//! C7 — the re-entrant, cancellable periodic update scheduler that drives live manifest refresh.
//!
//! The teacher has no equivalent (its download path is a single VOD fetch); this is built fresh
//! from the state machine in SPEC_FULL.md §9 ("Scheduler re-entrancy"), using `tokio::time` the way
//! the rest of this crate's async surface does, so that `tests/scheduler.rs` can drive it
//! deterministically with `tokio::time::{pause, advance}` instead of a hand-rolled fake timer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type TickFuture = Pin<Box<dyn Future<Output = UpdateOutcome> + Send>>;
type TickFn = Box<dyn Fn() -> TickFuture + Send + Sync>;

/// What an update tick reported back to the scheduler, used to pick the next delay.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// How long the fetch+parse actually took.
    pub measured: Duration,
    /// The interval the manifest itself asked for next (`minimumUpdatePeriod`,
    /// `#EXT-X-TARGETDURATION`-derived, …). `None` means "re-use the last nominal delay".
    pub nominal: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SchedulerState {
    Idle = 0,
    Armed = 1,
    Running = 2,
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Armed,
            2 => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }
}

/// Drives periodic re-fetching of a live manifest. One instance per manifest (§5: "at most one
/// in-flight update per manifest instance").
///
/// Re-entrancy: a call to `tick_now` while a tick is already `Running` is coalesced into a single
/// request to run again immediately after the in-flight tick completes, rather than spawning a
/// second concurrent tick (§9, "Scheduler re-entrancy").
pub struct UpdateScheduler {
    state: Arc<AtomicU8>,
    rerun_requested: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    tick: Arc<TickFn>,
    last_nominal: Arc<std::sync::Mutex<Duration>>,
}

impl UpdateScheduler {
    /// `tick` performs one fetch+parse+reconcile pass and reports how it went.
    pub fn new<F, Fut>(default_interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = UpdateOutcome> + Send + 'static,
    {
        UpdateScheduler {
            state: Arc::new(AtomicU8::new(SchedulerState::Idle as u8)),
            rerun_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            handle: std::sync::Mutex::new(None),
            tick: Arc::new(Box::new(move || Box::pin(tick()))),
            last_nominal: Arc::new(std::sync::Mutex::new(default_interval)),
        }
    }

    fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: SchedulerState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Arm the scheduler: the first tick fires after `initial_delay`.
    pub fn tick_after(&self, initial_delay: Duration) {
        if self.state() == SchedulerState::Stopped {
            return;
        }
        self.set_state(SchedulerState::Armed);
        self.spawn_loop(initial_delay);
    }

    /// Request an immediate tick. If a tick is already running, the request is coalesced: the
    /// scheduler runs exactly one more tick right after the current one finishes, rather than
    /// running two concurrently.
    pub fn tick_now(&self) {
        match self.state() {
            SchedulerState::Stopped => {}
            SchedulerState::Running => {
                trace!("update already in flight, coalescing immediate tick request");
                self.rerun_requested.store(true, Ordering::SeqCst);
            }
            _ => {
                self.set_state(SchedulerState::Armed);
                self.spawn_loop(Duration::ZERO);
            }
        }
    }

    /// Cancel any armed or in-flight tick and move to `Stopped`. Idempotent.
    pub fn stop(&self) {
        self.set_state(SchedulerState::Stopped);
        self.notify.notify_waiters();
        if let Some(h) = self.handle.lock().unwrap().take() {
            h.abort();
        }
    }

    fn spawn_loop(&self, initial_delay: Duration) {
        let mut guard = self.handle.lock().unwrap();
        if let Some(old) = guard.take() {
            old.abort();
        }
        let state = self.state.clone();
        let rerun_requested = self.rerun_requested.clone();
        let tick = self.tick.clone();
        let last_nominal = self.last_nominal.clone();

        *guard = Some(tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                if SchedulerState::from_u8(state.load(Ordering::SeqCst)) == SchedulerState::Stopped {
                    return;
                }
                tokio::time::sleep(delay).await;
                if SchedulerState::from_u8(state.load(Ordering::SeqCst)) == SchedulerState::Stopped {
                    return;
                }
                state.store(SchedulerState::Running as u8, Ordering::SeqCst);
                debug!("update scheduler tick firing");
                let outcome = tick().await;
                if SchedulerState::from_u8(state.load(Ordering::SeqCst)) == SchedulerState::Stopped {
                    return;
                }

                let nominal = outcome.nominal.unwrap_or(*last_nominal.lock().unwrap());
                *last_nominal.lock().unwrap() = nominal;
                // next_delay = max(nominal, measured): an update that itself took longer than the
                // manifest's requested interval must not be immediately retried.
                delay = nominal.max(outcome.measured);

                if rerun_requested.swap(false, Ordering::SeqCst) {
                    delay = Duration::ZERO;
                }
                state.store(SchedulerState::Armed as u8, Ordering::SeqCst);
            }
        }));
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
