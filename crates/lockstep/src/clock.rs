//! Time sources for virtual and wall-clock execution.
//!
//! - **Deterministic tests**: [`VirtualClock`] only moves when told to
//! - **Production use**: [`SystemClock`] reads the wall clock
//!
//! Instants are `DateTime<Utc>` and durations are signed `TimeDelta`s, so a
//! negative argument can be detected and rejected instead of wrapping.
//!
//! # Example
//!
//! ```rust
//! use chrono::TimeDelta;
//! use lockstep::{Clock, VirtualClock};
//!
//! let clock = VirtualClock::new();
//! let before = clock.now();
//! clock.advance(TimeDelta::milliseconds(250)).unwrap();
//! assert_eq!(clock.now() - before, TimeDelta::milliseconds(250));
//! assert!(clock.advance(TimeDelta::milliseconds(-1)).is_err());
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{EngineError, Result};

/// Trait for time sources (virtual or wall-clock).
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since `start` according to this clock.
    #[inline]
    fn elapsed_since(&self, start: DateTime<Utc>) -> TimeDelta {
        self.now() - start
    }
}

// ============================================================================
// Virtual Implementation
// ============================================================================

#[derive(Debug)]
struct ClockState {
    /// Instant of construction or last reset.
    origin: DateTime<Utc>,
    now: DateTime<Utc>,
}

/// Monotonic simulated clock.
///
/// Cloning yields another handle to the same clock. All reads and writes go
/// through one mutex, so an `advance` is never observed half-applied.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<ClockState>>,
}

impl VirtualClock {
    /// Creates a clock anchored at the current wall-clock instant.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock anchored at a fixed instant.
    pub fn starting_at(instant: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                origin: instant,
                now: instant,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Instant of construction or last reset.
    pub fn origin(&self) -> DateTime<Utc> {
        self.lock().origin
    }

    /// Virtual time elapsed since [`origin`](Self::origin).
    pub fn elapsed(&self) -> TimeDelta {
        let state = self.lock();
        state.now - state.origin
    }

    /// Moves the clock forward by `delta` and returns the new instant.
    pub fn advance(&self, delta: TimeDelta) -> Result<DateTime<Utc>> {
        ensure_non_negative("clock advance", delta)?;
        let mut state = self.lock();
        let next = state
            .now
            .checked_add_signed(delta)
            .ok_or(EngineError::InvalidDuration {
                context: "clock advance (overflow)",
                duration: delta,
            })?;
        state.now = next;
        Ok(next)
    }

    /// Moves the clock forward to `instant`.
    pub fn advance_to(&self, instant: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut state = self.lock();
        let delta = instant - state.now;
        ensure_non_negative("clock advance_to", delta)?;
        state.now = instant;
        Ok(instant)
    }

    /// Re-anchors the clock at the current wall-clock instant.
    ///
    /// This is the only operation that moves virtual time backwards.
    pub fn reset(&self) {
        self.reset_to(Utc::now());
    }

    /// Re-anchors the clock at `instant`.
    pub fn reset_to(&self, instant: DateTime<Utc>) {
        let mut state = self.lock();
        state.origin = instant;
        state.now = instant;
    }
}

impl Clock for VirtualClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Duration helpers
// ============================================================================

/// Rejects negative durations with [`EngineError::InvalidDuration`].
pub fn ensure_non_negative(context: &'static str, delta: TimeDelta) -> Result<()> {
    if delta < TimeDelta::zero() {
        return Err(EngineError::InvalidDuration {
            context,
            duration: delta,
        });
    }
    Ok(())
}

/// Converts to a `std::time::Duration`, rejecting negative values.
pub fn to_std(context: &'static str, delta: TimeDelta) -> Result<std::time::Duration> {
    delta.to_std().map_err(|_| EngineError::InvalidDuration {
        context,
        duration: delta,
    })
}

/// Multiplies a duration by a float factor, saturating at the representable range.
pub(crate) fn scale(delta: TimeDelta, factor: f64) -> TimeDelta {
    let nanos = delta.num_nanoseconds().unwrap_or(if delta < TimeDelta::zero() {
        i64::MIN
    } else {
        i64::MAX
    });
    let scaled = (nanos as f64 * factor).round();
    if scaled >= i64::MAX as f64 {
        TimeDelta::nanoseconds(i64::MAX)
    } else if scaled <= i64::MIN as f64 {
        TimeDelta::nanoseconds(i64::MIN)
    } else {
        TimeDelta::nanoseconds(scaled as i64)
    }
}
