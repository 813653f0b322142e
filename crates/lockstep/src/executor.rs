//! Runs operations under delay scenarios, with retry and exponential backoff.
//!
//! One attempt is: sample a delay (`base ± jitter`, floored at 80% of base),
//! suspend for it through the scheduler, decide whether to inject a
//! failure, then invoke the operation if none was injected. Retries sleep
//! `backoff_base × multiplier^attempt` (capped at the ceiling) before each
//! new attempt.
//!
//! Every attempt, injected failure, retry and backoff is counted in
//! [`ExecutorStats`] so tests can assert on what the executor actually did.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::TimeDelta;
use lockstep_config::RetryConfig;

use crate::clock::{Clock, ensure_non_negative, scale};
use crate::diagnostics::DiagnosticsLog;
use crate::entropy::EntropySource;
use crate::error::{EngineError, Result};
use crate::scenario::{DelayScenario, ScenarioCatalog};
use crate::scheduler::Scheduler;

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff parameters shared by every scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: TimeDelta,
    pub backoff_ceiling: TimeDelta,
}

impl RetryPolicy {
    pub fn new(backoff_base: TimeDelta, backoff_ceiling: TimeDelta) -> Result<Self> {
        ensure_non_negative("retry backoff base", backoff_base)?;
        ensure_non_negative("retry backoff ceiling", backoff_ceiling)?;
        Ok(Self {
            backoff_base,
            backoff_ceiling,
        })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Self::new(
            TimeDelta::milliseconds(config.backoff_base_ms as i64),
            TimeDelta::milliseconds(config.backoff_ceiling_ms as i64),
        )
    }

    /// Backoff before retrying after failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32, multiplier: f64) -> TimeDelta {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = multiplier.max(1.0).powi(exponent);
        if !factor.is_finite() {
            return self.backoff_ceiling;
        }
        scale(self.backoff_base, factor).min(self.backoff_ceiling)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: TimeDelta::milliseconds(100),
            backoff_ceiling: TimeDelta::seconds(10),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// What the executor has done since creation or last reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorStats {
    /// Underlying attempts, including injected failures.
    pub attempts: u64,
    pub injected_failures: u64,
    pub operation_failures: u64,
    pub retries: u64,
    /// Backoff delays, in the order they were slept.
    pub backoffs: Vec<TimeDelta>,
    /// Simulated delays, in the order they were slept.
    pub delays: Vec<TimeDelta>,
}

// ============================================================================
// Batch Results
// ============================================================================

/// Failure of one named operation within a batch.
#[derive(Debug)]
pub struct BatchFailure {
    pub name: String,
    pub error: EngineError,
}

/// Outcome of [`ScenarioExecutor::execute_batch`].
#[derive(Debug)]
pub struct BatchResult<T> {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Operations never started because an earlier one failed.
    pub skipped: usize,
    /// Successful values in input order.
    pub results: Vec<T>,
    pub errors: Vec<BatchFailure>,
}

impl<T> BatchResult<T> {
    fn with_total(total: usize) -> Self {
        Self {
            total,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            results: Vec::with_capacity(total),
            errors: Vec::new(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Applies delay scenarios to operations.
#[derive(Debug)]
pub struct ScenarioExecutor<S: Scheduler> {
    scheduler: S,
    catalog: ScenarioCatalog,
    retry: RetryPolicy,
    entropy: Mutex<EntropySource>,
    stats: Mutex<ExecutorStats>,
    log: Arc<DiagnosticsLog>,
    dump_tail: Option<usize>,
}

impl<S: Scheduler> ScenarioExecutor<S> {
    pub fn new(
        scheduler: S,
        catalog: ScenarioCatalog,
        retry: RetryPolicy,
        entropy: EntropySource,
        log: Arc<DiagnosticsLog>,
    ) -> Self {
        Self {
            scheduler,
            catalog,
            retry,
            entropy: Mutex::new(entropy),
            stats: Mutex::new(ExecutorStats::default()),
            log,
            dump_tail: None,
        }
    }

    /// Limits retry-exhaustion diagnostics to the last `dump_tail` entries.
    pub fn with_dump_tail(mut self, dump_tail: impl Into<Option<usize>>) -> Self {
        self.dump_tail = dump_tail.into();
        self
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn stats_mut(&self) -> MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entropy_mut(&self) -> MutexGuard<'_, EntropySource> {
        self.entropy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats_mut().clone()
    }

    /// Clears statistics and rewinds the entropy stream.
    pub fn reset(&self) {
        *self.stats_mut() = ExecutorStats::default();
        self.entropy_mut().reset();
    }

    /// Samples the simulated delay for one attempt under `scenario`.
    pub fn sample_delay(&self, scenario: &DelayScenario) -> TimeDelta {
        let jitter = self
            .entropy_mut()
            .jitter(scenario.jitter_bound, self.scheduler.elapsed());
        scenario.delay_with_jitter(jitter)
    }

    /// Runs `operation` once under the named scenario.
    pub async fn execute_with_delay<T, F, Fut>(&self, scenario_name: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let scenario = self.catalog.get(scenario_name)?;
        self.attempt(&scenario, operation).await
    }

    async fn attempt<T, F, Fut>(&self, scenario: &DelayScenario, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let delay = self.sample_delay(scenario);
        {
            let mut stats = self.stats_mut();
            stats.attempts += 1;
            stats.delays.push(delay);
        }
        self.scheduler.sleep(delay).await?;

        let at = self.scheduler.elapsed();
        let inject = self.entropy_mut().should_fail(scenario.failure_rate, at);
        if inject {
            self.stats_mut().injected_failures += 1;
            self.log.record(
                self.scheduler.now(),
                format!(
                    "scenario '{}': injected failure after {}ms delay",
                    scenario.name,
                    delay.num_milliseconds()
                ),
            );
            tracing::debug!(scenario = %scenario.name, at_ms = at.num_milliseconds(), "simulated failure injected");
            return Err(EngineError::SimulatedFailure {
                scenario: scenario.name.clone(),
                at,
            });
        }

        match operation().await {
            Ok(value) => Ok(value),
            Err(error) => {
                self.stats_mut().operation_failures += 1;
                self.log.record(
                    self.scheduler.now(),
                    format!("scenario '{}': operation failed: {error:#}", scenario.name),
                );
                Err(EngineError::Operation(error))
            }
        }
    }

    /// Runs `operation` under the named scenario, retrying with backoff.
    ///
    /// `max_retries` overrides the scenario default. The total number of
    /// attempts is at most `max_retries + 1`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        scenario_name: &str,
        mut operation: F,
        max_retries: Option<u32>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let scenario = self.catalog.get(scenario_name)?;
        let max_retries = max_retries.unwrap_or(scenario.max_retries);
        let mut attempt: u32 = 0;

        loop {
            let error = match self.attempt(&scenario, &mut operation).await {
                Ok(value) => {
                    if attempt > 0 {
                        self.log.record(
                            self.scheduler.now(),
                            format!(
                                "scenario '{}': succeeded on attempt {}",
                                scenario.name,
                                attempt + 1
                            ),
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= max_retries {
                self.log.record(
                    self.scheduler.now(),
                    format!(
                        "scenario '{}': giving up after {} attempts",
                        scenario.name,
                        attempt + 1
                    ),
                );
                tracing::warn!(scenario = %scenario.name, attempts = attempt + 1, "retries exhausted");
                return Err(EngineError::RetryExhausted {
                    scenario: scenario.name.clone(),
                    attempts: attempt + 1,
                    last: Box::new(error),
                    diagnostics: self.log.dump(self.dump_tail),
                });
            }

            let backoff = self.retry.backoff(attempt, scenario.retry_multiplier);
            {
                let mut stats = self.stats_mut();
                stats.retries += 1;
                stats.backoffs.push(backoff);
            }
            self.log.record(
                self.scheduler.now(),
                format!(
                    "scenario '{}': attempt {} failed ({error}), retrying in {}ms",
                    scenario.name,
                    attempt + 1,
                    backoff.num_milliseconds()
                ),
            );
            self.scheduler.sleep(backoff).await?;
            attempt += 1;
        }
    }

    /// Runs each named operation once under the named scenario.
    ///
    /// Stops at the first failure unless `allow_partial_failure` is set;
    /// operations after the stop are counted as skipped.
    pub async fn execute_batch<T, I, N, F, Fut>(
        &self,
        scenario_name: &str,
        operations: I,
        allow_partial_failure: bool,
    ) -> Result<BatchResult<T>>
    where
        I: IntoIterator<Item = (N, F)>,
        N: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let scenario = self.catalog.get(scenario_name)?;
        let operations: Vec<(String, F)> = operations
            .into_iter()
            .map(|(name, op)| (name.into(), op))
            .collect();
        let mut batch = BatchResult::with_total(operations.len());

        for (name, operation) in operations {
            if batch.failed > 0 && !allow_partial_failure {
                batch.skipped += 1;
                continue;
            }
            match self.attempt(&scenario, operation).await {
                Ok(value) => {
                    batch.succeeded += 1;
                    batch.results.push(value);
                }
                Err(error) => {
                    self.log.record(
                        self.scheduler.now(),
                        format!("batch '{}': operation '{name}' failed: {error}", scenario.name),
                    );
                    batch.failed += 1;
                    batch.errors.push(BatchFailure { name, error });
                }
            }
        }

        tracing::debug!(
            scenario = %scenario.name,
            total = batch.total,
            succeeded = batch.succeeded,
            failed = batch.failed,
            skipped = batch.skipped,
            "batch finished"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor_with(entropy: EntropySource) -> ScenarioExecutor<VirtualScheduler> {
        ScenarioExecutor::new(
            VirtualScheduler::new(),
            ScenarioCatalog::with_presets(),
            RetryPolicy::default(),
            entropy,
            Arc::new(DiagnosticsLog::default()),
        )
    }

    fn executor() -> ScenarioExecutor<VirtualScheduler> {
        executor_with(EntropySource::seeded(42))
    }

    fn register(executor: &ScenarioExecutor<VirtualScheduler>, failure_rate: f64) {
        executor
            .catalog()
            .register(DelayScenario::new(
                "flaky",
                TimeDelta::milliseconds(100),
                TimeDelta::milliseconds(20),
                failure_rate,
            ))
            .unwrap();
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(TimeDelta::milliseconds(100), TimeDelta::seconds(1)).unwrap();
        assert_eq!(policy.backoff(0, 2.0), TimeDelta::milliseconds(100));
        assert_eq!(policy.backoff(1, 2.0), TimeDelta::milliseconds(200));
        assert_eq!(policy.backoff(3, 2.0), TimeDelta::milliseconds(800));
        assert_eq!(policy.backoff(4, 2.0), TimeDelta::seconds(1));
        assert_eq!(policy.backoff(u32::MAX, 2.0), TimeDelta::seconds(1));
    }

    #[test]
    fn negative_backoff_is_rejected() {
        assert!(matches!(
            RetryPolicy::new(TimeDelta::milliseconds(-1), TimeDelta::seconds(1)),
            Err(EngineError::InvalidDuration { .. })
        ));
    }

    #[tokio::test]
    async fn execute_with_delay_advances_virtual_time() {
        let executor = executor();
        let value = executor
            .execute_with_delay("fast", || async { Ok::<_, anyhow::Error>(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        let stats = executor.stats();
        assert_eq!(stats.attempts, 1);
        let delay = stats.delays[0];
        assert!(delay >= TimeDelta::milliseconds(20) && delay <= TimeDelta::milliseconds(30));
        assert_eq!(executor.scheduler.elapsed(), delay);
    }

    #[tokio::test]
    async fn unknown_scenario_never_runs_operation() {
        let executor = executor();
        let ran = &AtomicU32::new(0);
        let result = executor
            .execute_with_delay("warp_speed", move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(EngineError::UnknownScenario { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(executor.scheduler.elapsed(), TimeDelta::zero());
    }

    #[tokio::test]
    async fn certain_failure_is_injected_before_operation() {
        let executor = executor();
        register(&executor, 1.0);
        let ran = &AtomicU32::new(0);

        let result = executor
            .execute_with_delay("flaky", move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(EngineError::SimulatedFailure { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(executor.stats().injected_failures, 1);
    }

    #[tokio::test]
    async fn operation_errors_surface_unchanged() {
        let executor = executor();
        let result: Result<()> = executor
            .execute_with_delay("instant", || async { Err(anyhow::anyhow!("quota exceeded")) })
            .await;

        match result {
            Err(EngineError::Operation(error)) => assert_eq!(error.to_string(), "quota exceeded"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(executor.stats().operation_failures, 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_two_failures() {
        let executor = executor();
        register(&executor, 0.0);
        let calls = &AtomicU32::new(0);

        let value = executor
            .execute_with_retry(
                "flaky",
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        anyhow::bail!("transient failure {n}");
                    }
                    Ok("ok")
                },
                Some(3),
            )
            .await
            .unwrap();

        assert_eq!(value, "ok");
        let stats = executor.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(
            stats.backoffs,
            vec![TimeDelta::milliseconds(100), TimeDelta::milliseconds(200)]
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_wraps_last_error() {
        let executor = executor();
        register(&executor, 1.0);

        let result: Result<()> = executor
            .execute_with_retry("flaky", || async { Ok(()) }, Some(2))
            .await;

        match result {
            Err(EngineError::RetryExhausted {
                scenario,
                attempts,
                last,
                diagnostics,
            }) => {
                assert_eq!(scenario, "flaky");
                assert_eq!(attempts, 3);
                assert!(matches!(*last, EngineError::SimulatedFailure { .. }));
                assert!(diagnostics.contains("giving up after 3 attempts"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(executor.stats().attempts, 3);
    }

    #[tokio::test]
    async fn retry_defaults_to_scenario_max_retries() {
        let executor = executor();
        executor
            .catalog()
            .register(
                DelayScenario::new("doomed", TimeDelta::zero(), TimeDelta::zero(), 1.0)
                    .with_max_retries(4),
            )
            .unwrap();

        let result: Result<()> = executor
            .execute_with_retry("doomed", || async { Ok(()) }, None)
            .await;
        assert!(matches!(result, Err(EngineError::RetryExhausted { attempts: 5, .. })));
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure() {
        let executor = executor();
        let ops = (0..4).map(|i| {
            (format!("op-{i}"), move || async move {
                if i == 1 {
                    anyhow::bail!("op {i} rejected");
                }
                Ok(i)
            })
        });

        let batch = executor.execute_batch("fast", ops, false).await.unwrap();
        assert_eq!(batch.total, 4);
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.results, vec![0]);
        assert_eq!(batch.errors[0].name, "op-1");
        assert!(!batch.all_succeeded());
    }

    #[tokio::test]
    async fn batch_allows_partial_failure() {
        let executor = executor();
        let ops = (0..4).map(|i| {
            (format!("op-{i}"), move || async move {
                if i % 2 == 1 {
                    anyhow::bail!("odd op {i}");
                }
                Ok(i * 10)
            })
        });

        let batch = executor.execute_batch("fast", ops, true).await.unwrap();
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 2);
        assert_eq!(batch.skipped, 0);
        assert_eq!(batch.results, vec![0, 20]);
    }

    #[tokio::test]
    async fn reset_rewinds_seeded_delays() {
        let executor = executor();
        for _ in 0..3 {
            let _ = executor
                .execute_with_delay("normal", || async { Ok::<_, anyhow::Error>(()) })
                .await;
        }
        let first = executor.stats().delays;

        executor.reset();
        assert_eq!(executor.stats(), ExecutorStats::default());
        for _ in 0..3 {
            let _ = executor
                .execute_with_delay("normal", || async { Ok::<_, anyhow::Error>(()) })
                .await;
        }
        assert_eq!(executor.stats().delays, first);
    }
}
