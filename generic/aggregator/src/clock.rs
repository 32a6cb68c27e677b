// SPDX-License-Identifier: MPL-2.0

//! Monotonic clocks with cancellable single-shot waits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

/// Result of waiting on a [`ClockId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockReturn {
    /// The deadline was reached while waiting.
    Ok,
    /// The deadline had already passed when the wait started.
    Early,
    /// The wait was cancelled with [`ClockId::unschedule`].
    Unscheduled,
    Error,
}

/// A monotonic clock.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time of the clock.
    fn time(&self) -> Duration;

    /// Creates a wait for `time` that can be cancelled from any thread.
    fn new_single_shot_id(&self, time: Duration) -> ClockId;
}

/// Backing implementation of a single-shot wait.
pub trait ClockIdImpl: Send + Sync + fmt::Debug {
    fn time(&self) -> Duration;
    fn wait(&self) -> ClockReturn;
    fn unschedule(&self);
}

/// Handle on a single-shot clock wait.
///
/// Unscheduling is sticky: once unscheduled, every later `wait` returns
/// [`ClockReturn::Unscheduled`] immediately.
#[derive(Clone, Debug)]
pub struct ClockId(Arc<dyn ClockIdImpl>);

impl ClockId {
    pub fn new(imp: impl ClockIdImpl + 'static) -> Self {
        ClockId(Arc::new(imp))
    }

    pub fn time(&self) -> Duration {
        self.0.time()
    }

    /// Blocks until the clock reaches the time of this id or it gets unscheduled.
    pub fn wait(&self) -> ClockReturn {
        self.0.wait()
    }

    pub fn unschedule(&self) {
        self.0.unschedule()
    }
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Clock following the system's monotonic time, counted from the first use in the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn obtain() -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn time(&self) -> Duration {
        EPOCH.elapsed()
    }

    fn new_single_shot_id(&self, time: Duration) -> ClockId {
        ClockId::new(SystemClockId {
            time,
            deadline: *EPOCH + time,
            unscheduled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }
}

#[derive(Debug)]
struct SystemClockId {
    time: Duration,
    deadline: Instant,
    unscheduled: Mutex<bool>,
    cond: Condvar,
}

impl ClockIdImpl for SystemClockId {
    fn time(&self) -> Duration {
        self.time
    }

    fn wait(&self) -> ClockReturn {
        let mut unscheduled = self.unscheduled.lock();
        let mut first = true;
        loop {
            if *unscheduled {
                return ClockReturn::Unscheduled;
            }
            if Instant::now() >= self.deadline {
                return if first {
                    ClockReturn::Early
                } else {
                    ClockReturn::Ok
                };
            }
            first = false;
            self.cond.wait_until(&mut unscheduled, self.deadline);
        }
    }

    fn unschedule(&self) {
        let mut unscheduled = self.unscheduled.lock();
        *unscheduled = true;
        self.cond.notify_all();
    }
}

#[derive(Debug, Default)]
struct TestClockState {
    time: Duration,
    pending: Vec<Duration>,
}

#[derive(Debug, Default)]
struct TestClockInner {
    state: Mutex<TestClockState>,
    cond: Condvar,
}

/// Clock that only advances when told to.
///
/// Tests use it to decide exactly when deadlines pass, and
/// [`TestClock::wait_for_pending_id`] to know that some thread is blocked on it.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<TestClockInner>);

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, time: Duration) {
        let mut state = self.0.state.lock();
        assert!(time >= state.time, "test clock can't go backwards");
        trace!("Setting test clock time to {time:?}");
        state.time = time;
        self.0.cond.notify_all();
    }

    pub fn advance(&self, delta: Duration) {
        let mut state = self.0.state.lock();
        state.time += delta;
        trace!("Advancing test clock to {:?}", state.time);
        self.0.cond.notify_all();
    }

    /// Number of threads currently blocked in a wait on this clock.
    pub fn pending_id_count(&self) -> usize {
        self.0.state.lock().pending.len()
    }

    /// Blocks until some thread waits on this clock and returns the earliest pending time.
    pub fn wait_for_pending_id(&self) -> Duration {
        let mut state = self.0.state.lock();
        loop {
            if let Some(time) = state.pending.iter().min() {
                return *time;
            }
            self.0.cond.wait(&mut state);
        }
    }

    /// Like [`TestClock::wait_for_pending_id`] but gives up after `timeout` of real time.
    pub fn wait_for_pending_id_timeout(&self, timeout: Duration) -> Option<Duration> {
        let deadline = Instant::now() + timeout;
        let mut state = self.0.state.lock();
        loop {
            if let Some(time) = state.pending.iter().min() {
                return Some(*time);
            }
            if self.0.cond.wait_until(&mut state, deadline).timed_out() {
                return state.pending.iter().min().copied();
            }
        }
    }

    /// Advances the clock to the earliest pending wait, if any.
    pub fn crank(&self) -> bool {
        let mut state = self.0.state.lock();
        let Some(time) = state.pending.iter().min().copied() else {
            return false;
        };
        if time > state.time {
            state.time = time;
        }
        self.0.cond.notify_all();
        true
    }
}

impl Clock for TestClock {
    fn time(&self) -> Duration {
        self.0.state.lock().time
    }

    fn new_single_shot_id(&self, time: Duration) -> ClockId {
        ClockId::new(TestClockId {
            time,
            clock: self.0.clone(),
            unscheduled: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
struct TestClockId {
    time: Duration,
    clock: Arc<TestClockInner>,
    unscheduled: AtomicBool,
}

impl ClockIdImpl for TestClockId {
    fn time(&self) -> Duration {
        self.time
    }

    fn wait(&self) -> ClockReturn {
        let mut state = self.clock.state.lock();
        if self.unscheduled.load(Ordering::SeqCst) {
            return ClockReturn::Unscheduled;
        }
        if state.time >= self.time {
            return ClockReturn::Early;
        }

        state.pending.push(self.time);
        self.clock.cond.notify_all();

        let ret = loop {
            if self.unscheduled.load(Ordering::SeqCst) {
                break ClockReturn::Unscheduled;
            }
            if state.time >= self.time {
                break ClockReturn::Ok;
            }
            self.clock.cond.wait(&mut state);
        };

        if let Some(idx) = state.pending.iter().position(|t| *t == self.time) {
            state.pending.swap_remove(idx);
        }

        ret
    }

    fn unschedule(&self) {
        // Taking the lock orders the store before any waiter's next check
        let _state = self.clock.state.lock();
        self.unscheduled.store(true, Ordering::SeqCst);
        self.clock.cond.notify_all();
    }
}
