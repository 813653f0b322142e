//! Error taxonomy for the orchestration engine.
//!
//! Waits report through [`WaitResult`](crate::WaitResult); these errors are
//! what executor calls return and what a non-success wait converts into at
//! an assertion boundary.

use chrono::TimeDelta;
use lockstep_config::ConfigError;
use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Deadline elapsed before the predicate became true.
    #[error(
        "{message}: condition not met after {}ms ({attempts} attempts){}\n{diagnostics}",
        .elapsed.num_milliseconds(),
        last_error_suffix(.last_error.as_deref())
    )]
    ConditionTimeout {
        message: String,
        elapsed: TimeDelta,
        attempts: u32,
        last_error: Option<String>,
        diagnostics: String,
    },

    /// The predicate failed and too little time remained to retry it.
    #[error(
        "condition evaluation failed after {}ms ({attempts} attempts): {source:#}\n{diagnostics}",
        .elapsed.num_milliseconds()
    )]
    ConditionEvaluation {
        elapsed: TimeDelta,
        attempts: u32,
        #[source]
        source: anyhow::Error,
        diagnostics: String,
    },

    /// The wrapped operation itself failed.
    #[error(transparent)]
    Operation(anyhow::Error),

    /// Scenario name absent from the catalog.
    #[error("unknown delay scenario '{name}' (known: {})", .known.join(", "))]
    UnknownScenario { name: String, known: Vec<String> },

    /// Scenario parameters out of range.
    #[error("invalid delay scenario '{name}': {reason}")]
    InvalidScenario { name: String, reason: String },

    /// Failure injected by a scenario's failure rate.
    #[error("simulated failure in scenario '{scenario}' at +{}ms", .at.num_milliseconds())]
    SimulatedFailure { scenario: String, at: TimeDelta },

    /// Every attempt under a scenario failed.
    #[error(
        "retries exhausted for scenario '{scenario}' after {attempts} attempts: {last}\n{diagnostics}"
    )]
    RetryExhausted {
        scenario: String,
        attempts: u32,
        #[source]
        last: Box<EngineError>,
        diagnostics: String,
    },

    /// Negative duration handed to advance/backoff/sleep.
    #[error("invalid duration for {context}: {}ms", .duration.num_milliseconds())]
    InvalidDuration {
        context: &'static str,
        duration: TimeDelta,
    },

    /// Wait options that could never reach their deadline.
    #[error("invalid wait options: {reason}")]
    InvalidWaitOptions { reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether a retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Operation(_) | Self::SimulatedFailure { .. })
    }
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    match last_error {
        Some(err) => format!("; last error: {err}"),
        None => String::new(),
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
