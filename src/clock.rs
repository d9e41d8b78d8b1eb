//! Injectable time source for the presentation timeline and update scheduler.
//!
//! The specification calls for this explicitly (§9, "Test-time clock injection"): the timeline and
//! scheduler must take a clock as a construction parameter rather than reading `SystemTime::now()`
//! or `Instant::now()` inline, so that tests can drive wall-clock-dependent behavior (availability
//! windows, scheduler re-arming) deterministically. Production code supplies `SystemClock`; tests
//! either supply a `FakeClock` for explicit wall-clock assertions, or rely on `tokio::time::pause`
//! for the scheduler's timer (see `tests/scheduler.rs`).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A source of wall-clock time, abstracted so it can be replaced in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose value is set explicitly, for deterministic tests of availability-window math.
#[derive(Debug, Clone)]
pub struct FakeClock {
    millis_since_epoch: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn at(t: DateTime<Utc>) -> Self {
        FakeClock {
            millis_since_epoch: Arc::new(AtomicI64::new(t.timestamp_millis())),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.millis_since_epoch
            .fetch_add((seconds * 1000.0) as i64, Ordering::SeqCst);
    }

    pub fn set(&self, t: DateTime<Utc>) {
        self.millis_since_epoch
            .store(t.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis_since_epoch.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}

/// A shared, cloneable handle to any `Clock` implementation.
pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
