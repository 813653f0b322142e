//! # lockstep: Deterministic virtual-time orchestration for async tests
//!
//! This crate lets test code drive a simulated clock, wait on predicates
//! with bounded adaptive polling, run operations under latency and failure
//! profiles with retry and backoff, and simulate skewed, drifting device
//! clocks.
//!
//! ## Philosophy
//!
//! - **Reproducibility**: Same seed and same calls produce the same outcome
//! - **Time compression**: Minutes of simulated waiting run in microseconds
//! - **Lockstep time**: Every suspension advances virtual time by exactly the
//!   suspended amount, so elapsed time equals what the engine measured
//! - **Self-diagnosing failures**: Timeouts and exhausted retries carry
//!   attempt counts, elapsed time and the tail of the diagnostics log
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                           │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ ConditionWaiter  │  │ ScenarioExecutor │  │ ClockSync    │  │
//! │  │ (poll, timeout)  │  │ (delay, retry)   │  │ (skew/drift) │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └──────┬───────┘  │
//! │           │   ScenarioCatalog ──┤  EntropySource    │          │
//! │  ┌────────▼─────────────────────▼───────────────────▼───────┐  │
//! │  │   Scheduler (VirtualScheduler / TokioScheduler) + Clock   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                        DiagnosticsLog                          │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::TimeDelta;
//! use lockstep::Orchestrator;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lockstep::Result<()> {
//! let orchestrator = Orchestrator::deterministic(42);
//! let options = orchestrator
//!     .wait_options()
//!     .with_timeout(TimeDelta::seconds(2))
//!     .with_poll_interval(TimeDelta::milliseconds(100));
//!
//! let result = orchestrator
//!     .wait_for_condition(|ctx| Ok(ctx.attempt >= 3), &options)
//!     .await?;
//! let success = result.assert_success();
//! assert_eq!(success.attempts, 3);
//! assert_eq!(orchestrator.elapsed(), TimeDelta::milliseconds(200));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::float_cmp))] // Test assertions use exact float comparisons
#![allow(clippy::missing_fields_in_debug)] // Boxed predicates have no useful Debug

mod clock;
mod clock_sync;
mod diagnostics;
mod entropy;
mod error;
mod executor;
mod orchestrator;
mod scenario;
mod scheduler;
mod waiter;

pub use clock::{Clock, SystemClock, VirtualClock, ensure_non_negative, to_std};
pub use clock_sync::{ClockSynchronizer, DeviceClock};
pub use diagnostics::{DEFAULT_CAPACITY, DiagnosticsEntry, DiagnosticsLog};
pub use entropy::EntropySource;
pub use error::{EngineError, Result};
pub use executor::{BatchFailure, BatchResult, ExecutorStats, RetryPolicy, ScenarioExecutor};
pub use orchestrator::Orchestrator;
pub use scenario::{DELAY_FLOOR_RATIO, DelayScenario, ScenarioCatalog};
pub use scheduler::{Scheduler, TokioScheduler, VirtualScheduler};
pub use waiter::{
    Condition, ConditionContext, ConditionSet, ConditionWaiter, FromFn, NamedCondition,
    WaitOptions, WaitResult, WaitSuccess, from_fn,
};

pub use lockstep_config::{FailureMode, LockstepConfig};
