//! The facade tests call.
//!
//! An [`Orchestrator`] owns every piece of per-run state: the scheduler (and
//! with it the clock), the device registry, the diagnostics log, the
//! scenario catalog and the executor statistics. Nothing is process-global;
//! two orchestrators never observe each other.

use std::future::Future;
use std::ops::RangeBounds;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use lockstep_config::LockstepConfig;

use crate::clock::{Clock, VirtualClock};
use crate::clock_sync::{ClockSynchronizer, DeviceClock};
use crate::diagnostics::{DiagnosticsEntry, DiagnosticsLog};
use crate::entropy::EntropySource;
use crate::error::Result;
use crate::executor::{BatchResult, ExecutorStats, RetryPolicy, ScenarioExecutor};
use crate::scenario::{DelayScenario, ScenarioCatalog};
use crate::scheduler::{Scheduler, VirtualScheduler};
use crate::waiter::{ConditionContext, ConditionWaiter, NamedCondition, WaitOptions, WaitResult};

/// Per-run orchestration state and the operations over it.
#[derive(Debug)]
pub struct Orchestrator<S: Scheduler = VirtualScheduler> {
    scheduler: S,
    wait_defaults: WaitOptions,
    dump_tail: Option<usize>,
    log: Arc<DiagnosticsLog>,
    devices: ClockSynchronizer,
    executor: ScenarioExecutor<S>,
}

impl Orchestrator<VirtualScheduler> {
    /// Virtual-time orchestrator configured from `config`.
    pub fn new(config: &LockstepConfig) -> Result<Self> {
        Self::with_scheduler(VirtualScheduler::new(), config)
    }

    /// Virtual-time orchestrator with default settings and a seeded failure source.
    pub fn deterministic(seed: u64) -> Self {
        Self::assemble(
            VirtualScheduler::new(),
            &LockstepConfig::deterministic(seed),
            ScenarioCatalog::with_presets(),
            RetryPolicy::default(),
        )
    }

    /// Like [`deterministic`](Self::deterministic) with the clock anchored at
    /// `origin`, so diagnostics timestamps are reproducible too.
    pub fn deterministic_at(seed: u64, origin: DateTime<Utc>) -> Self {
        Self::assemble(
            VirtualScheduler::with_clock(VirtualClock::starting_at(origin)),
            &LockstepConfig::deterministic(seed),
            ScenarioCatalog::with_presets(),
            RetryPolicy::default(),
        )
    }

    pub fn clock(&self) -> &VirtualClock {
        self.scheduler.clock()
    }
}

impl Default for Orchestrator<VirtualScheduler> {
    fn default() -> Self {
        Self::deterministic(0)
    }
}

impl<S: Scheduler> Orchestrator<S> {
    /// Orchestrator driven by `scheduler`.
    pub fn with_scheduler(scheduler: S, config: &LockstepConfig) -> Result<Self> {
        config.validate()?;
        let catalog = ScenarioCatalog::from_definitions(&config.scenarios)?;
        let retry = RetryPolicy::from_config(&config.retry)?;
        Ok(Self::assemble(scheduler, config, catalog, retry))
    }

    fn assemble(
        scheduler: S,
        config: &LockstepConfig,
        catalog: ScenarioCatalog,
        retry: RetryPolicy,
    ) -> Self {
        let log = Arc::new(DiagnosticsLog::new(config.diagnostics.capacity));
        let executor = ScenarioExecutor::new(
            scheduler.clone(),
            catalog,
            retry,
            EntropySource::from_config(&config.entropy),
            Arc::clone(&log),
        )
        .with_dump_tail(config.diagnostics.dump_tail);

        tracing::debug!(
            failure_mode = ?config.entropy.mode,
            seed = config.entropy.seed,
            scenarios = executor.catalog().names().len(),
            "orchestrator created"
        );

        Self {
            scheduler,
            wait_defaults: WaitOptions::from_config(&config.wait),
            dump_tail: config.diagnostics.dump_tail,
            log,
            devices: ClockSynchronizer::new(),
            executor,
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Configured wait defaults, ready for `with_*` adjustments.
    pub fn wait_options(&self) -> WaitOptions {
        self.wait_defaults.clone()
    }

    fn waiter(&self) -> ConditionWaiter<'_, S> {
        ConditionWaiter::new(&self.scheduler, &self.log).with_dump_tail(self.dump_tail)
    }

    // ------------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------------

    pub async fn wait_for_condition<F>(&self, predicate: F, options: &WaitOptions) -> Result<WaitResult>
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
    {
        self.waiter().wait_for_condition(predicate, options).await
    }

    pub async fn wait_for_condition_with_diagnostics<F, D>(
        &self,
        predicate: F,
        options: &WaitOptions,
        diagnostics: D,
    ) -> Result<WaitResult>
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
        D: FnOnce() -> anyhow::Result<String>,
    {
        self.waiter()
            .wait_for_condition_with_diagnostics(predicate, options, diagnostics)
            .await
    }

    pub async fn wait_until<F>(&self, predicate: F, options: &WaitOptions) -> Result<WaitResult>
    where
        F: FnMut() -> bool,
    {
        self.waiter().wait_until(predicate, options).await
    }

    pub async fn wait_for_all_conditions(
        &self,
        conditions: Vec<NamedCondition<'_>>,
        options: &WaitOptions,
    ) -> Result<WaitResult> {
        self.waiter().wait_for_all_conditions(conditions, options).await
    }

    pub async fn wait_for_any_condition(
        &self,
        conditions: Vec<NamedCondition<'_>>,
        options: &WaitOptions,
    ) -> Result<WaitResult> {
        self.waiter().wait_for_any_condition(conditions, options).await
    }

    pub async fn wait_for_eventual_consistency<F>(
        &self,
        predicate: F,
        stability: TimeDelta,
        options: &WaitOptions,
    ) -> Result<WaitResult>
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
    {
        self.waiter()
            .wait_for_eventual_consistency(predicate, stability, options)
            .await
    }

    pub async fn wait_for_state_change<T, R>(&self, read: R, options: &WaitOptions) -> Result<WaitResult>
    where
        T: PartialEq + std::fmt::Debug,
        R: FnMut() -> anyhow::Result<T>,
    {
        self.waiter().wait_for_state_change(read, options).await
    }

    pub async fn wait_for_value<T, R>(&self, read: R, expected: T, options: &WaitOptions) -> Result<WaitResult>
    where
        T: PartialEq + std::fmt::Debug,
        R: FnMut() -> anyhow::Result<T>,
    {
        self.waiter().wait_for_value(read, expected, options).await
    }

    pub async fn wait_for_value_in_range<T, R, B>(
        &self,
        read: R,
        range: B,
        options: &WaitOptions,
    ) -> Result<WaitResult>
    where
        T: PartialOrd + std::fmt::Debug,
        R: FnMut() -> anyhow::Result<T>,
        B: RangeBounds<T>,
    {
        self.waiter().wait_for_value_in_range(read, range, options).await
    }

    // ------------------------------------------------------------------------
    // Scenario execution
    // ------------------------------------------------------------------------

    pub async fn execute_with_delay<T, F, Fut>(&self, scenario: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.executor.execute_with_delay(scenario, operation).await
    }

    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        scenario: &str,
        operation: F,
        max_retries: Option<u32>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.executor
            .execute_with_retry(scenario, operation, max_retries)
            .await
    }

    pub async fn execute_batch<T, I, N, F, Fut>(
        &self,
        scenario: &str,
        operations: I,
        allow_partial_failure: bool,
    ) -> Result<BatchResult<T>>
    where
        I: IntoIterator<Item = (N, F)>,
        N: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.executor
            .execute_batch(scenario, operations, allow_partial_failure)
            .await
    }

    /// Runs `operation` under `scenario`, then waits for `effect` to hold.
    ///
    /// A failed operation is returned as an error without waiting; the
    /// effect wait is reported as a [`WaitResult`] alongside the value.
    pub async fn execute_and_wait_for_effect<T, F, Fut, P>(
        &self,
        scenario: &str,
        operation: F,
        effect: P,
        options: &WaitOptions,
    ) -> Result<(T, WaitResult)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        P: FnMut(&ConditionContext) -> anyhow::Result<bool>,
    {
        let value = self.executor.execute_with_delay(scenario, operation).await?;
        self.log.record(
            self.scheduler.now(),
            format!("operation under '{scenario}' completed, waiting for effect"),
        );
        let outcome = self.waiter().wait_for_condition(effect, options).await?;
        Ok((value, outcome))
    }

    pub fn register_scenario(&self, scenario: DelayScenario) -> Result<Option<DelayScenario>> {
        self.executor.catalog().register(scenario)
    }

    pub fn scenario(&self, name: &str) -> Result<DelayScenario> {
        self.executor.catalog().get(name)
    }

    pub fn scenario_names(&self) -> Vec<String> {
        self.executor.catalog().names()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    /// Registers a drift-free device with a fixed skew.
    pub fn register_device(&self, device_id: impl Into<String>, skew: TimeDelta) -> DeviceClock {
        self.register_drifting_device(device_id, skew, 0.0)
    }

    pub fn register_drifting_device(
        &self,
        device_id: impl Into<String>,
        skew: TimeDelta,
        drift_rate_per_second: f64,
    ) -> DeviceClock {
        let device =
            self.devices
                .register_device(device_id, skew, drift_rate_per_second, self.scheduler.now());
        self.log.record(
            self.scheduler.now(),
            format!(
                "device '{}' registered (skew {}ms, drift {})",
                device.device_id,
                skew.num_milliseconds(),
                drift_rate_per_second
            ),
        );
        device
    }

    /// Apparent time of a device; unknown ids report the reference clock.
    pub fn device_time(&self, device_id: &str) -> DateTime<Utc> {
        self.devices.device_time(device_id, self.scheduler.now())
    }

    pub fn synchronize_devices(&self, master_id: &str) -> usize {
        let adjusted = self
            .devices
            .synchronize_devices(master_id, self.scheduler.now());
        self.log.record(
            self.scheduler.now(),
            format!("synchronized {adjusted} devices to '{master_id}'"),
        );
        adjusted
    }

    pub fn devices(&self) -> Vec<DeviceClock> {
        self.devices.devices()
    }

    // ------------------------------------------------------------------------
    // Time and state
    // ------------------------------------------------------------------------

    /// Moves time forward without suspending.
    pub fn advance_time(&self, delta: TimeDelta) -> Result<DateTime<Utc>> {
        let now = self.scheduler.advance(delta)?;
        self.log
            .record(now, format!("time advanced by {}ms", delta.num_milliseconds()));
        Ok(now)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.scheduler.now()
    }

    pub fn elapsed(&self) -> TimeDelta {
        self.scheduler.elapsed()
    }

    /// Re-anchors the clock and forgets devices, diagnostics and statistics.
    ///
    /// Registered scenarios are kept.
    pub fn reset(&self) {
        self.scheduler.reset();
        self.devices.reset();
        self.log.clear();
        self.executor.reset();
        tracing::info!("orchestrator reset");
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticsEntry> {
        self.log.entries()
    }

    pub fn diagnostics_dump(&self, last_n: Option<usize>) -> String {
        self.log.dump(last_n)
    }

    pub fn diagnostics_log(&self) -> &DiagnosticsLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::scheduler::TokioScheduler;
    use lockstep_config::ScenarioDefinition;

    fn ms(v: i64) -> TimeDelta {
        TimeDelta::milliseconds(v)
    }

    #[test]
    fn devices_sync_to_master_after_time_passes() {
        let orchestrator = Orchestrator::deterministic(1);
        orchestrator.register_device("phoneA", TimeDelta::zero());
        orchestrator.advance_time(TimeDelta::seconds(1)).unwrap();
        orchestrator.register_device("master", ms(300));

        assert_eq!(orchestrator.device_time("master") - orchestrator.now(), ms(300));
        assert_eq!(orchestrator.synchronize_devices("master"), 1);
        assert_eq!(
            orchestrator.device_time("phoneA"),
            orchestrator.device_time("master")
        );
        assert_eq!(orchestrator.device_time("nobody"), orchestrator.now());
    }

    #[test]
    fn advance_time_rejects_negative() {
        let orchestrator = Orchestrator::deterministic(1);
        let before = orchestrator.now();
        assert!(matches!(
            orchestrator.advance_time(ms(-10)),
            Err(EngineError::InvalidDuration { .. })
        ));
        assert_eq!(orchestrator.now(), before);
    }

    #[tokio::test]
    async fn reset_clears_run_state_but_keeps_scenarios() {
        let orchestrator = Orchestrator::deterministic(3);
        orchestrator
            .register_scenario(DelayScenario::new("custom", ms(10), ms(0), 0.0))
            .unwrap();
        orchestrator.register_device("A", ms(5));
        orchestrator
            .execute_with_delay("custom", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        assert_eq!(orchestrator.elapsed(), ms(10));

        orchestrator.reset();
        assert_eq!(orchestrator.elapsed(), TimeDelta::zero());
        assert!(orchestrator.devices().is_empty());
        assert!(orchestrator.diagnostics().is_empty());
        assert_eq!(orchestrator.executor_stats(), ExecutorStats::default());
        assert!(orchestrator.scenario("custom").is_ok());
    }

    #[tokio::test]
    async fn execute_and_wait_for_effect_reports_both() {
        let orchestrator = Orchestrator::deterministic(5);
        let options = orchestrator
            .wait_options()
            .with_timeout(TimeDelta::seconds(1))
            .with_poll_interval(ms(50));

        let (value, effect) = orchestrator
            .execute_and_wait_for_effect(
                "fast",
                || async { Ok::<_, anyhow::Error>("written") },
                |ctx| Ok(ctx.attempt >= 2),
                &options,
            )
            .await
            .unwrap();

        assert_eq!(value, "written");
        assert_eq!(effect.assert_success().attempts, 2);
    }

    #[tokio::test]
    async fn execute_and_wait_for_effect_skips_wait_on_failure() {
        let orchestrator = Orchestrator::deterministic(5);
        let options = orchestrator.wait_options();
        let result = orchestrator
            .execute_and_wait_for_effect(
                "instant",
                || async { Err::<(), _>(anyhow::anyhow!("write rejected")) },
                |_| Ok(true),
                &options,
            )
            .await;

        assert!(matches!(result, Err(EngineError::Operation(_))));
        assert_eq!(orchestrator.elapsed(), TimeDelta::zero());
    }

    #[test]
    fn configured_scenarios_are_loaded() {
        let mut config = LockstepConfig::deterministic(9);
        config.scenarios.insert(
            "satellite".to_string(),
            ScenarioDefinition {
                base_delay_ms: 600,
                jitter_ms: 100,
                failure_rate: 0.1,
                retry_multiplier: 2.0,
                max_retries: 4,
            },
        );
        let orchestrator = Orchestrator::new(&config).unwrap();
        assert_eq!(orchestrator.scenario("satellite").unwrap().max_retries, 4);
        assert!(orchestrator.scenario_names().contains(&"fast".to_string()));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = LockstepConfig::default();
        config.diagnostics.capacity = 0;
        assert!(matches!(
            Orchestrator::new(&config),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn diagnostics_are_timestamped_in_virtual_time() {
        let origin = DateTime::parse_from_rfc3339("2026-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);
        let orchestrator = Orchestrator::deterministic_at(0, origin);
        orchestrator.advance_time(ms(1_500)).unwrap();

        let entries = orchestrator.diagnostics();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].virtual_time, origin + ms(1_500));
        assert!(orchestrator.diagnostics_dump(None).contains("[04:05:07.500]"));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_timer_scheduler() {
        let orchestrator =
            Orchestrator::with_scheduler(TokioScheduler::new(), &LockstepConfig::deterministic(2))
                .unwrap();
        let value = orchestrator
            .execute_with_delay("fast", || async { Ok::<_, anyhow::Error>(11) })
            .await
            .unwrap();
        assert_eq!(value, 11);
        assert_eq!(orchestrator.executor_stats().attempts, 1);
    }
}
