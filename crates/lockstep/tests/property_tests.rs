//! Property-based tests using proptest.
//!
//! Async properties run on a fresh current-thread runtime per case.

use chrono::TimeDelta;
use lockstep::{
    Clock, ConditionWaiter, DelayScenario, DiagnosticsLog, EngineError, EntropySource,
    RetryPolicy, VirtualClock, VirtualScheduler, WaitOptions, WaitResult,
};
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
        .block_on(future)
}

fn ms(v: i64) -> TimeDelta {
    TimeDelta::milliseconds(v)
}

fn fixed(timeout: i64, poll: i64) -> WaitOptions {
    WaitOptions::new(ms(timeout), ms(poll)).with_adaptive(false)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // ========================================================================
    // Clock
    // ========================================================================

    #[test]
    fn clock_never_goes_backwards(steps in prop::collection::vec(-1_000i64..10_000, 1..50)) {
        let clock = VirtualClock::new();
        let mut previous = clock.now();
        for step in steps {
            let result = clock.advance(TimeDelta::milliseconds(step));
            if step < 0 {
                let is_invalid = matches!(result, Err(EngineError::InvalidDuration { .. }));
                prop_assert!(is_invalid);
            } else {
                prop_assert!(result.is_ok());
            }
            let now = clock.now();
            prop_assert!(now >= previous);
            previous = now;
        }
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    /// 100ms ± 20ms never leaves [80ms, 120ms], under either model
    #[test]
    fn jitter_stays_in_bounds(seed: u64, elapsed_ms in 0i64..1_000_000) {
        let scenario = DelayScenario::new("normal", ms(100), ms(20), 0.0);
        let mut seeded = EntropySource::seeded(seed);
        let mut legacy = EntropySource::virtual_time();
        let elapsed = ms(elapsed_ms);

        for source in [&mut seeded, &mut legacy] {
            for _ in 0..20 {
                let delay = scenario.delay_with_jitter(source.jitter(scenario.jitter_bound, elapsed));
                prop_assert!(delay >= ms(80) && delay <= ms(120), "delay {delay}");
            }
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped(
        base_ms in 1i64..1_000,
        extra_ms in 0i64..60_000,
        multiplier in 1.0f64..4.0,
    ) {
        let ceiling = ms(base_ms + extra_ms);
        let policy = RetryPolicy::new(ms(base_ms), ceiling).unwrap();
        let mut previous = TimeDelta::zero();
        for attempt in 0..64 {
            let backoff = policy.backoff(attempt, multiplier);
            prop_assert!(backoff >= previous);
            prop_assert!(backoff <= ceiling);
            previous = backoff;
        }
        prop_assert_eq!(policy.backoff(0, multiplier), ms(base_ms));
    }

    // ========================================================================
    // Waiter
    // ========================================================================

    #[test]
    fn never_true_times_out_with_expected_attempts(timeout_ms in 1i64..3_000, poll_ms in 10i64..500) {
        let result = block_on(async {
            let scheduler = VirtualScheduler::new();
            let log = DiagnosticsLog::default();
            ConditionWaiter::new(&scheduler, &log)
                .wait_until(|| false, &fixed(timeout_ms, poll_ms))
                .await
                .unwrap()
        });

        let polls = (timeout_ms + poll_ms - 1) / poll_ms;
        match result {
            WaitResult::Timeout { attempts, elapsed, .. } => {
                prop_assert!(elapsed >= ms(timeout_ms));
                prop_assert!(i64::from(attempts) >= polls - 1);
                prop_assert_eq!(i64::from(attempts), polls + 1);
            }
            other => prop_assert!(false, "expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn success_reports_the_attempt_it_happened_on(k in 1u32..30, poll_ms in 1i64..200) {
        let timeout_ms = i64::from(k) * poll_ms + 1;
        let (result, seen) = block_on(async {
            let scheduler = VirtualScheduler::new();
            let log = DiagnosticsLog::default();
            let mut seen = 0;
            let result = ConditionWaiter::new(&scheduler, &log)
                .wait_for_condition(
                    |ctx| {
                        seen = ctx.attempt;
                        Ok(ctx.attempt == k)
                    },
                    &fixed(timeout_ms, poll_ms),
                )
                .await
                .unwrap();
            (result, seen)
        });

        prop_assert!(result.is_success());
        prop_assert_eq!(result.attempts(), k);
        prop_assert_eq!(seen, k);
        prop_assert_eq!(result.elapsed(), ms(i64::from(k - 1) * poll_ms));
    }

    /// Success never comes before the window since the last false reading
    #[test]
    fn stability_window_starts_at_first_continuous_true(
        prefix in prop::collection::vec(any::<bool>(), 0..20),
        stability_ms in 0i64..500,
    ) {
        let poll_ms = 50;
        let (result, run_start) = block_on(async {
            let scheduler = VirtualScheduler::new();
            let log = DiagnosticsLog::default();
            let mut run_start = None;
            let result = ConditionWaiter::new(&scheduler, &log)
                .wait_for_eventual_consistency(
                    |ctx| {
                        let value = prefix.get(ctx.attempt as usize - 1).copied().unwrap_or(true);
                        if !value {
                            run_start = None;
                        } else if run_start.is_none() {
                            run_start = Some(ctx.elapsed);
                        }
                        Ok(value)
                    },
                    ms(stability_ms),
                    &fixed(60_000, poll_ms),
                )
                .await
                .unwrap();
            (result, run_start)
        });

        prop_assert!(result.is_success());
        let run_start = run_start.expect("a true run was observed");
        prop_assert!(result.elapsed() - run_start >= ms(stability_ms));
        prop_assert!(result.elapsed() - run_start < ms(stability_ms + poll_ms));
    }
}
