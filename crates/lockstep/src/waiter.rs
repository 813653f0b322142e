//! Deadline-bounded polling of predicates.
//!
//! A wait runs a small state machine: `Polling → Succeeded | TimedOut |
//! Failed`. Each iteration checks the deadline, evaluates the condition,
//! then suspends through the scheduler for the current poll interval. The
//! interval may grow once the warm-up attempts are used up.
//!
//! Timing rules:
//!
//! - The deadline is checked at the top of each iteration. A wait only
//!   times out there if the deadline was already *exceeded* going in.
//! - A condition evaluated at exactly `elapsed == timeout` still counts; if
//!   it is true the wait succeeds, otherwise the wait times out with
//!   `elapsed == timeout`.
//! - The last suspension is clamped to the remaining time, so a timed-out
//!   wait never overshoots the deadline under virtual time.
//! - A predicate error is remembered as the last error. If less than twice
//!   the current interval remains, the wait stops with
//!   [`WaitResult::Error`] instead of polling again.
//!
//! Outcomes are returned as [`WaitResult`], never raised. The outer
//! [`Result`] only fails on misuse (invalid options) or a scheduler error.

use std::fmt::{self, Debug, Write as _};
use std::ops::{Bound, RangeBounds};

use chrono::TimeDelta;
use lockstep_config::WaitConfig;

use crate::clock::{Clock, ensure_non_negative, scale};
use crate::diagnostics::DiagnosticsLog;
use crate::error::{EngineError, Result};
use crate::scheduler::Scheduler;

// ============================================================================
// Context, Options, Results
// ============================================================================

/// What a predicate knows about the wait it is part of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionContext {
    /// 1-based evaluation number.
    pub attempt: u32,
    pub elapsed: TimeDelta,
    pub remaining: TimeDelta,
    pub current_interval: TimeDelta,
}

/// Timing parameters for a single wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOptions {
    pub timeout: TimeDelta,
    pub poll_interval: TimeDelta,
    pub adaptive: bool,
    pub min_interval: TimeDelta,
    pub max_interval: TimeDelta,
    pub growth_factor: f64,
    /// Attempts evaluated at the initial interval before growth starts.
    pub warmup_attempts: u32,
    pub timeout_message: String,
}

impl WaitOptions {
    /// Default options with the given timeout and poll interval.
    pub fn new(timeout: TimeDelta, poll_interval: TimeDelta) -> Self {
        Self::default()
            .with_timeout(timeout)
            .with_poll_interval(poll_interval)
    }

    pub fn from_config(config: &WaitConfig) -> Self {
        let ms = |v: u64| TimeDelta::milliseconds(i64::try_from(v).unwrap_or(i64::MAX));
        Self {
            timeout: ms(config.timeout_ms),
            poll_interval: ms(config.poll_interval_ms),
            adaptive: config.adaptive,
            min_interval: ms(config.min_interval_ms),
            max_interval: ms(config.max_interval_ms),
            growth_factor: config.growth_factor,
            warmup_attempts: config.warmup_attempts,
            timeout_message: "wait timed out".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: TimeDelta) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: TimeDelta) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn with_interval_bounds(mut self, min_interval: TimeDelta, max_interval: TimeDelta) -> Self {
        self.min_interval = min_interval;
        self.max_interval = max_interval;
        self
    }

    pub fn with_growth_factor(mut self, growth_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    pub fn with_warmup_attempts(mut self, warmup_attempts: u32) -> Self {
        self.warmup_attempts = warmup_attempts;
        self
    }

    pub fn with_timeout_message(mut self, message: impl Into<String>) -> Self {
        self.timeout_message = message.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |context: &'static str, delta: TimeDelta| {
            if delta <= TimeDelta::zero() {
                Err(EngineError::InvalidDuration {
                    context,
                    duration: delta,
                })
            } else {
                Ok(())
            }
        };
        positive("wait timeout", self.timeout)?;
        positive("wait poll interval", self.poll_interval)?;
        ensure_non_negative("wait min interval", self.min_interval)?;
        positive("wait max interval", self.max_interval)?;
        if self.max_interval < self.min_interval {
            return Err(EngineError::InvalidDuration {
                context: "wait max interval (below min interval)",
                duration: self.max_interval,
            });
        }
        // A shrinking interval would stop virtual time from advancing
        if !(self.growth_factor >= 1.0 && self.growth_factor.is_finite()) {
            return Err(EngineError::InvalidWaitOptions {
                reason: format!("growth factor must be >= 1.0, got {}", self.growth_factor),
            });
        }
        Ok(())
    }

    fn next_interval(&self, interval: TimeDelta, attempts: u32) -> TimeDelta {
        if !self.adaptive || attempts <= self.warmup_attempts {
            return interval;
        }
        scale(interval, self.growth_factor).clamp(self.min_interval, self.max_interval)
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from_config(&WaitConfig::default())
    }
}

/// Outcome of a wait. Exactly one variant per call.
#[derive(Debug)]
pub enum WaitResult {
    Success {
        attempts: u32,
        elapsed: TimeDelta,
    },
    Timeout {
        message: String,
        attempts: u32,
        elapsed: TimeDelta,
        last_error: Option<String>,
        diagnostics: String,
    },
    Error {
        error: anyhow::Error,
        attempts: u32,
        elapsed: TimeDelta,
        diagnostics: String,
    },
}

/// Attempt count and elapsed time of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSuccess {
    pub attempts: u32,
    pub elapsed: TimeDelta,
}

impl WaitResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::Error { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed(&self) -> TimeDelta {
        match self {
            Self::Success { elapsed, .. }
            | Self::Timeout { elapsed, .. }
            | Self::Error { elapsed, .. } => *elapsed,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Timeout { diagnostics, .. } | Self::Error { diagnostics, .. } => {
                Some(diagnostics)
            }
        }
    }

    /// Converts a non-success outcome into the matching [`EngineError`].
    pub fn into_result(self) -> Result<WaitSuccess> {
        match self {
            Self::Success { attempts, elapsed } => Ok(WaitSuccess { attempts, elapsed }),
            Self::Timeout {
                message,
                attempts,
                elapsed,
                last_error,
                diagnostics,
            } => Err(EngineError::ConditionTimeout {
                message,
                elapsed,
                attempts,
                last_error,
                diagnostics,
            }),
            Self::Error {
                error,
                attempts,
                elapsed,
                diagnostics,
            } => Err(EngineError::ConditionEvaluation {
                elapsed,
                attempts,
                source: error,
                diagnostics,
            }),
        }
    }

    /// Panics with the full diagnostics unless the wait succeeded.
    ///
    /// For test assertion boundaries only.
    #[track_caller]
    pub fn assert_success(self) -> WaitSuccess {
        match self.into_result() {
            Ok(success) => success,
            Err(err) => panic!("{err}"),
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Something a waiter can poll.
pub trait Condition {
    fn evaluate(&mut self, ctx: &ConditionContext) -> anyhow::Result<bool>;

    /// Current state, included in timeout diagnostics.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// [`Condition`] backed by a closure. See [`from_fn`].
pub struct FromFn<F>(F);

impl<F> Debug for FromFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FromFn")
    }
}

/// Wraps a context-aware closure as a [`Condition`].
pub fn from_fn<F>(predicate: F) -> FromFn<F>
where
    F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
{
    FromFn(predicate)
}

impl<F> Condition for FromFn<F>
where
    F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
{
    fn evaluate(&mut self, ctx: &ConditionContext) -> anyhow::Result<bool> {
        (self.0)(ctx)
    }
}

type BoxedPredicate<'a> = Box<dyn FnMut(&ConditionContext) -> anyhow::Result<bool> + Send + 'a>;

/// A labelled predicate inside a composite wait.
pub struct NamedCondition<'a> {
    name: String,
    predicate: BoxedPredicate<'a>,
    state: ConditionState,
}

impl<'a> NamedCondition<'a> {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool> + Send + 'a,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            state: ConditionState::Pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Debug for NamedCondition<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedCondition")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConditionState {
    Pending,
    Met,
    Unmet,
    Failed(String),
}

impl fmt::Display for ConditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("not evaluated"),
            Self::Met => f.write_str("met"),
            Self::Unmet => f.write_str("unmet"),
            Self::Failed(err) => write!(f, "error: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    All,
    Any,
}

/// Composite of named conditions combined with AND or OR.
///
/// Every member is evaluated on every attempt; a member that errors counts
/// as false without aborting the others.
#[derive(Debug)]
pub struct ConditionSet<'a> {
    conditions: Vec<NamedCondition<'a>>,
    combine: Combine,
}

impl<'a> ConditionSet<'a> {
    pub fn all(conditions: Vec<NamedCondition<'a>>) -> Self {
        Self {
            conditions,
            combine: Combine::All,
        }
    }

    pub fn any(conditions: Vec<NamedCondition<'a>>) -> Self {
        Self {
            conditions,
            combine: Combine::Any,
        }
    }
}

impl Condition for ConditionSet<'_> {
    fn evaluate(&mut self, ctx: &ConditionContext) -> anyhow::Result<bool> {
        let mut met = 0;
        for condition in &mut self.conditions {
            condition.state = match (condition.predicate)(ctx) {
                Ok(true) => {
                    met += 1;
                    ConditionState::Met
                }
                Ok(false) => ConditionState::Unmet,
                Err(err) => ConditionState::Failed(format!("{err:#}")),
            };
        }
        Ok(match self.combine {
            Combine::All => met == self.conditions.len(),
            Combine::Any => met > 0,
        })
    }

    fn describe(&self) -> Option<String> {
        let label = match self.combine {
            Combine::All => "all of",
            Combine::Any => "any of",
        };
        let mut out = format!("{label} {} conditions:", self.conditions.len());
        for condition in &self.conditions {
            let _ = write!(out, "\n  {}: {}", condition.name, condition.state);
        }
        Some(out)
    }
}

/// True once the inner predicate has held continuously for `stability`.
struct Stable<F> {
    predicate: F,
    stability: TimeDelta,
    stable_since: Option<TimeDelta>,
    longest: TimeDelta,
}

impl<F> Condition for Stable<F>
where
    F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
{
    fn evaluate(&mut self, ctx: &ConditionContext) -> anyhow::Result<bool> {
        let holds = match (self.predicate)(ctx) {
            Ok(holds) => holds,
            Err(err) => {
                self.stable_since = None;
                return Err(err);
            }
        };
        if !holds {
            if self.stable_since.take().is_some() {
                tracing::debug!(elapsed_ms = ctx.elapsed.num_milliseconds(), "stability window reset");
            }
            return Ok(false);
        }
        let since = *self.stable_since.get_or_insert(ctx.elapsed);
        let held = ctx.elapsed - since;
        self.longest = self.longest.max(held);
        Ok(held >= self.stability)
    }

    fn describe(&self) -> Option<String> {
        Some(format!(
            "stability window {}ms; longest continuous run {}ms; currently {}",
            self.stability.num_milliseconds(),
            self.longest.num_milliseconds(),
            if self.stable_since.is_some() { "holding" } else { "not holding" }
        ))
    }
}

/// Reads a value each attempt and tests it.
struct Watch<T, R, P> {
    read: R,
    accept: P,
    expectation: String,
    last: Option<T>,
}

impl<T, R, P> Condition for Watch<T, R, P>
where
    T: Debug,
    R: FnMut() -> anyhow::Result<T>,
    P: FnMut(&T) -> bool,
{
    fn evaluate(&mut self, _ctx: &ConditionContext) -> anyhow::Result<bool> {
        let value = (self.read)()?;
        let accepted = (self.accept)(&value);
        self.last = Some(value);
        Ok(accepted)
    }

    fn describe(&self) -> Option<String> {
        Some(match &self.last {
            Some(value) => format!("expected {}; last observed {value:?}", self.expectation),
            None => format!("expected {}; no value observed", self.expectation),
        })
    }
}

fn describe_bound<T: Debug>(bound: Bound<&T>, inclusive: &str, exclusive: &str) -> String {
    match bound {
        Bound::Included(v) => format!("{inclusive}{v:?}"),
        Bound::Excluded(v) => format!("{exclusive}{v:?}"),
        Bound::Unbounded => "unbounded".to_string(),
    }
}

// ============================================================================
// Waiter
// ============================================================================

/// Polls conditions against a scheduler, recording into a diagnostics log.
#[derive(Debug)]
pub struct ConditionWaiter<'a, S: Scheduler> {
    scheduler: &'a S,
    log: &'a DiagnosticsLog,
    dump_tail: Option<usize>,
}

impl<'a, S: Scheduler> ConditionWaiter<'a, S> {
    pub fn new(scheduler: &'a S, log: &'a DiagnosticsLog) -> Self {
        Self {
            scheduler,
            log,
            dump_tail: None,
        }
    }

    /// Limits failure diagnostics to the last `dump_tail` log entries.
    /// `None` (the default) attaches the whole retained log.
    pub fn with_dump_tail(mut self, dump_tail: impl Into<Option<usize>>) -> Self {
        self.dump_tail = dump_tail.into();
        self
    }

    fn record(&self, message: impl Into<String>) {
        self.log.record(self.scheduler.now(), message);
    }

    /// Polls `condition` until it holds or the deadline passes.
    pub async fn wait_for<C: Condition>(&self, condition: C, options: &WaitOptions) -> Result<WaitResult> {
        self.poll(condition, options, None::<fn() -> anyhow::Result<String>>)
            .await
    }

    async fn poll<C, D>(&self, mut condition: C, options: &WaitOptions, diagnostics_fn: Option<D>) -> Result<WaitResult>
    where
        C: Condition,
        D: FnOnce() -> anyhow::Result<String>,
    {
        options.validate()?;

        let start = self.scheduler.now();
        let mut interval = options.poll_interval;
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;

        self.record(format!(
            "waiting: {} (timeout {}ms, poll {}ms)",
            options.timeout_message,
            options.timeout.num_milliseconds(),
            interval.num_milliseconds()
        ));
        tracing::debug!(
            timeout_ms = options.timeout.num_milliseconds(),
            poll_ms = interval.num_milliseconds(),
            adaptive = options.adaptive,
            "wait started"
        );

        loop {
            let elapsed = self.scheduler.elapsed_since(start);
            if elapsed > options.timeout {
                return Ok(self.timed_out(&condition, options, attempts, elapsed, last_error, diagnostics_fn));
            }

            attempts += 1;
            let remaining = options.timeout - elapsed;
            let ctx = ConditionContext {
                attempt: attempts,
                elapsed,
                remaining,
                current_interval: interval,
            };

            match condition.evaluate(&ctx) {
                Ok(true) => {
                    self.record(format!(
                        "condition met on attempt {attempts} after {}ms",
                        elapsed.num_milliseconds()
                    ));
                    tracing::debug!(attempts, elapsed_ms = elapsed.num_milliseconds(), "wait succeeded");
                    return Ok(WaitResult::Success { attempts, elapsed });
                }
                Ok(false) => {}
                Err(error) => {
                    let text = format!("{error:#}");
                    self.record(format!("attempt {attempts}: predicate error: {text}"));
                    tracing::warn!(attempt = attempts, error = %text, "predicate evaluation failed");
                    if remaining < interval * 2 {
                        return Ok(WaitResult::Error {
                            error,
                            attempts,
                            elapsed,
                            diagnostics: self.log.dump(self.dump_tail),
                        });
                    }
                    last_error = Some(text);
                }
            }

            if elapsed >= options.timeout {
                return Ok(self.timed_out(&condition, options, attempts, elapsed, last_error, diagnostics_fn));
            }

            let next = options.next_interval(interval, attempts);
            if next != interval {
                tracing::debug!(
                    attempt = attempts,
                    from_ms = interval.num_milliseconds(),
                    to_ms = next.num_milliseconds(),
                    "poll interval grown"
                );
                interval = next;
            }
            self.scheduler.sleep(interval.min(remaining)).await?;
        }
    }

    fn timed_out<C, D>(
        &self,
        condition: &C,
        options: &WaitOptions,
        attempts: u32,
        elapsed: TimeDelta,
        last_error: Option<String>,
        diagnostics_fn: Option<D>,
    ) -> WaitResult
    where
        C: Condition,
        D: FnOnce() -> anyhow::Result<String>,
    {
        if let Some(state) = condition.describe() {
            self.record(state);
        }
        if let Some(collect) = diagnostics_fn {
            match collect() {
                Ok(extra) => self.record(extra),
                Err(err) => self.record(format!("diagnostics collection failed: {err:#}")),
            }
        }
        self.record(format!(
            "timed out: {} after {}ms ({attempts} attempts)",
            options.timeout_message,
            elapsed.num_milliseconds()
        ));
        tracing::warn!(attempts, elapsed_ms = elapsed.num_milliseconds(), "wait timed out");

        WaitResult::Timeout {
            message: options.timeout_message.clone(),
            attempts,
            elapsed,
            last_error,
            diagnostics: self.log.dump(self.dump_tail),
        }
    }

    /// Polls a context-aware predicate.
    pub async fn wait_for_condition<F>(&self, predicate: F, options: &WaitOptions) -> Result<WaitResult>
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
    {
        self.wait_for(from_fn(predicate), options).await
    }

    /// Like [`wait_for_condition`](Self::wait_for_condition), adding the
    /// output of `diagnostics` to the log on timeout. Errors from
    /// `diagnostics` are recorded and otherwise ignored.
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
        self.poll(from_fn(predicate), options, Some(diagnostics)).await
    }

    /// Polls an infallible predicate that ignores the context.
    pub async fn wait_until<F>(&self, mut predicate: F, options: &WaitOptions) -> Result<WaitResult>
    where
        F: FnMut() -> bool,
    {
        self.wait_for(from_fn(move |_: &ConditionContext| Ok(predicate())), options)
            .await
    }

    pub async fn wait_for_all_conditions(
        &self,
        conditions: Vec<NamedCondition<'_>>,
        options: &WaitOptions,
    ) -> Result<WaitResult> {
        self.wait_for(ConditionSet::all(conditions), options).await
    }

    pub async fn wait_for_any_condition(
        &self,
        conditions: Vec<NamedCondition<'_>>,
        options: &WaitOptions,
    ) -> Result<WaitResult> {
        self.wait_for(ConditionSet::any(conditions), options).await
    }

    /// Succeeds once `predicate` has held on every evaluation spanning at
    /// least `stability`. Any false (or failed) evaluation restarts the window.
    pub async fn wait_for_eventual_consistency<F>(
        &self,
        predicate: F,
        stability: TimeDelta,
        options: &WaitOptions,
    ) -> Result<WaitResult>
    where
        F: FnMut(&ConditionContext) -> anyhow::Result<bool>,
    {
        ensure_non_negative("stability duration", stability)?;
        let condition = Stable {
            predicate,
            stability,
            stable_since: None,
            longest: TimeDelta::zero(),
        };
        self.wait_for(condition, options).await
    }

    /// Snapshots a value, then waits until a later read differs from it.
    pub async fn wait_for_state_change<T, R>(&self, mut read: R, options: &WaitOptions) -> Result<WaitResult>
    where
        T: PartialEq + Debug,
        R: FnMut() -> anyhow::Result<T>,
    {
        options.validate()?;
        let initial = match read() {
            Ok(value) => value,
            Err(error) => {
                let text = format!("{error:#}");
                self.record(format!("state snapshot failed: {text}"));
                tracing::warn!(error = %text, "state snapshot failed");
                // No baseline to compare against, so there is nothing to poll
                return Ok(WaitResult::Error {
                    error,
                    attempts: 0,
                    elapsed: TimeDelta::zero(),
                    diagnostics: self.log.dump(self.dump_tail),
                });
            }
        };
        let expectation = format!("a change from {initial:?}");
        self.record(format!("state snapshot: {initial:?}"));
        let condition = Watch {
            read,
            accept: move |value: &T| *value != initial,
            expectation,
            last: None,
        };
        self.wait_for(condition, options).await
    }

    /// Waits until `read` returns `expected`.
    pub async fn wait_for_value<T, R>(&self, read: R, expected: T, options: &WaitOptions) -> Result<WaitResult>
    where
        T: PartialEq + Debug,
        R: FnMut() -> anyhow::Result<T>,
    {
        let condition = Watch {
            read,
            expectation: format!("{expected:?}"),
            accept: move |value: &T| *value == expected,
            last: None,
        };
        self.wait_for(condition, options).await
    }

    /// Waits until `read` returns a value inside `range`.
    pub async fn wait_for_value_in_range<T, R, B>(&self, read: R, range: B, options: &WaitOptions) -> Result<WaitResult>
    where
        T: PartialOrd + Debug,
        R: FnMut() -> anyhow::Result<T>,
        B: RangeBounds<T>,
    {
        let expectation = format!(
            "a value in range ({}, {})",
            describe_bound(range.start_bound(), ">= ", "> "),
            describe_bound(range.end_bound(), "<= ", "< ")
        );
        let condition = Watch {
            read,
            accept: move |value: &T| range.contains(value),
            expectation,
            last: None,
        };
        self.wait_for(condition, options).await
    }
}
