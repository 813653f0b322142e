//! Scheduler binding: the single primitive that suspends a task and moves time.
//!
//! - **Deterministic tests**: [`VirtualScheduler`] keeps a deadline-ordered
//!   timer queue over a [`VirtualClock`]
//! - **Production use**: [`TokioScheduler`] sleeps on a real tokio timer
//!
//! Waiters and executors never touch the clock directly. Every suspension
//! goes through [`Scheduler::sleep`], so the time a waiter measures always
//! equals the suspensions it actually took (plus any external
//! [`Scheduler::advance`] calls made by the test harness).
//!
//! # Virtual timers
//!
//! A virtual sleep registers a wake-up at `now + delta` and yields. Time
//! only moves when the earliest pending sleeper is polled after having
//! yielded at least once, and then only up to that sleeper's deadline.
//! Concurrent sleeps therefore overlap: two tasks each sleeping 100ms
//! finish together at +100ms. Ties wake in registration order.
//!
//! A sleep future that is created but never polled holds back every later
//! deadline until it is dropped.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::{Clock, SystemClock, VirtualClock, ensure_non_negative, to_std};
use crate::error::{EngineError, Result};

/// Trait for cooperative schedulers (virtual or timer-based).
pub trait Scheduler: Clock + Clone {
    /// Suspends the current task for `delta`, advancing time in lockstep.
    fn sleep(&self, delta: TimeDelta) -> impl Future<Output = Result<()>> + Send;

    /// Moves time forward without suspending (harness-driven).
    ///
    /// Timer-based implementations only validate the argument.
    fn advance(&self, delta: TimeDelta) -> Result<DateTime<Utc>>;

    /// Time elapsed since construction or last reset.
    fn elapsed(&self) -> TimeDelta;

    /// Re-anchors time at the wall clock. No-op for timer-based schedulers.
    fn reset(&self);
}

// ============================================================================
// Virtual Implementation
// ============================================================================

/// Pending wake-ups ordered by deadline, then by registration.
#[derive(Debug, Default)]
struct TimerQueue {
    pending: BTreeSet<TimerKey>,
    next_id: u64,
}

type TimerKey = (DateTime<Utc>, u64);

type SharedTimers = Arc<Mutex<TimerQueue>>;

fn lock_timers(timers: &SharedTimers) -> MutexGuard<'_, TimerQueue> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler over a shared [`VirtualClock`] and timer queue.
#[derive(Debug, Clone, Default)]
pub struct VirtualScheduler {
    clock: VirtualClock,
    timers: SharedTimers,
}

impl VirtualScheduler {
    /// Creates a scheduler with a fresh clock anchored at wall-clock now.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler driving an existing clock handle.
    pub fn with_clock(clock: VirtualClock) -> Self {
        Self {
            clock,
            timers: SharedTimers::default(),
        }
    }

    /// Returns the underlying clock handle.
    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Number of sleeps currently waiting for their deadline.
    pub fn pending_timers(&self) -> usize {
        lock_timers(&self.timers).pending.len()
    }

    fn register(&self, delta: TimeDelta) -> Result<VirtualSleep> {
        ensure_non_negative("scheduler sleep", delta)?;
        let deadline = self
            .clock
            .now()
            .checked_add_signed(delta)
            .ok_or(EngineError::InvalidDuration {
                context: "scheduler sleep (overflow)",
                duration: delta,
            })?;

        let mut timers = lock_timers(&self.timers);
        let key = (deadline, timers.next_id);
        timers.next_id += 1;
        timers.pending.insert(key);

        Ok(VirtualSleep {
            clock: self.clock.clone(),
            timers: Arc::clone(&self.timers),
            key,
            yielded: false,
            done: false,
        })
    }
}

impl Clock for VirtualScheduler {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Scheduler for VirtualScheduler {
    fn sleep(&self, delta: TimeDelta) -> impl Future<Output = Result<()>> + Send {
        let sleep = self.register(delta);
        async move {
            sleep?.await;
            Ok(())
        }
    }

    fn advance(&self, delta: TimeDelta) -> Result<DateTime<Utc>> {
        let now = self.clock.advance(delta)?;
        tracing::debug!(
            delta_ms = delta.num_milliseconds(),
            elapsed_ms = self.clock.elapsed().num_milliseconds(),
            "virtual time advanced"
        );
        Ok(now)
    }

    fn elapsed(&self) -> TimeDelta {
        self.clock.elapsed()
    }

    fn reset(&self) {
        self.clock.reset();
        tracing::debug!(origin = %self.clock.origin(), "virtual clock reset");
    }
}

/// Future returned by [`VirtualScheduler::sleep`].
#[derive(Debug)]
struct VirtualSleep {
    clock: VirtualClock,
    timers: SharedTimers,
    key: TimerKey,
    yielded: bool,
    done: bool,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Give every other runnable task one pass to register its deadline
        if !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let (deadline, _) = self.key;
        let mut timers = lock_timers(&self.timers);
        if self.clock.now() < deadline {
            if timers.pending.first() != Some(&self.key) {
                drop(timers);
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            // Fails only if another handle already moved past the deadline
            let _ = self.clock.advance_to(deadline);
        }
        timers.pending.remove(&self.key);
        drop(timers);

        self.done = true;
        Poll::Ready(())
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        if !self.done {
            lock_timers(&self.timers).pending.remove(&self.key);
        }
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Timer-backed scheduler using `tokio::time::sleep` and the wall clock.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    started: DateTime<Utc>,
}

impl TokioScheduler {
    /// Creates a scheduler anchored at wall-clock now.
    pub fn new() -> Self {
        Self {
            started: SystemClock.now(),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioScheduler {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        SystemClock.now()
    }
}

impl Scheduler for TokioScheduler {
    async fn sleep(&self, delta: TimeDelta) -> Result<()> {
        tokio::time::sleep(to_std("scheduler sleep", delta)?).await;
        Ok(())
    }

    fn advance(&self, delta: TimeDelta) -> Result<DateTime<Utc>> {
        // Wall time advances on its own
        ensure_non_negative("scheduler advance", delta)?;
        Ok(self.now())
    }

    fn elapsed(&self) -> TimeDelta {
        self.now() - self.started
    }

    fn reset(&self) {}
}
