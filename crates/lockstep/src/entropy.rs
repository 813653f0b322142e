//! Reproducible pseudo-random samples for jitter and failure injection.
//!
//! Two models are available:
//!
//! - [`FailureMode::VirtualTime`]: `sample = (elapsed_ms mod 100) / 100`. The
//!   legacy model. It is piecewise-constant over each 100 ms window and
//!   correlates with fixed delays; a scenario whose delays are multiples of
//!   100 ms will see the same sample forever.
//! - [`FailureMode::Seeded`]: a `SmallRng` keyed by an explicit seed. Same
//!   seed and same call sequence produce the same outcomes.

use chrono::TimeDelta;
use lockstep_config::{EntropyConfig, FailureMode};
use rand::rngs::SmallRng;
use rand::{Rng as _, SeedableRng};

use crate::clock::scale;

/// Deterministic sample source.
#[derive(Debug, Clone)]
pub struct EntropySource {
    mode: FailureMode,
    seed: u64,
    rng: SmallRng,
}

impl EntropySource {
    /// Seeded PRNG source.
    pub fn seeded(seed: u64) -> Self {
        Self {
            mode: FailureMode::Seeded,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Legacy `elapsed mod 100` source.
    pub fn virtual_time() -> Self {
        Self {
            mode: FailureMode::VirtualTime,
            seed: 0,
            rng: SmallRng::seed_from_u64(0),
        }
    }

    pub fn from_config(config: &EntropyConfig) -> Self {
        match config.mode {
            FailureMode::Seeded => Self::seeded(config.seed),
            FailureMode::VirtualTime => Self::virtual_time(),
        }
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Returns a sample in `[0, 1)`.
    ///
    /// `elapsed` is virtual time since the clock's origin; only the
    /// time-derived model reads it.
    pub fn sample(&mut self, elapsed: TimeDelta) -> f64 {
        match self.mode {
            FailureMode::VirtualTime => elapsed.num_milliseconds().rem_euclid(100) as f64 / 100.0,
            FailureMode::Seeded => self.rng.gen_range(0.0..1.0),
        }
    }

    /// Whether to inject a failure at `elapsed` under `failure_rate`.
    pub fn should_fail(&mut self, failure_rate: f64, elapsed: TimeDelta) -> bool {
        if failure_rate <= 0.0 {
            return false;
        }
        self.sample(elapsed) < failure_rate
    }

    /// Signed jitter offset in `[-bound, bound)`.
    pub fn jitter(&mut self, bound: TimeDelta, elapsed: TimeDelta) -> TimeDelta {
        if bound <= TimeDelta::zero() {
            return TimeDelta::zero();
        }
        let sample = self.sample(elapsed);
        scale(bound, 2.0 * sample - 1.0)
    }

    /// Restarts the seeded stream from its original seed.
    pub fn reset(&mut self) {
        self.rng = SmallRng::seed_from_u64(self.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_is_reproducible() {
        let mut a = EntropySource::seeded(12345);
        let mut b = EntropySource::seeded(12345);
        for _ in 0..100 {
            assert_eq!(a.sample(TimeDelta::zero()), b.sample(TimeDelta::zero()));
        }
    }

    #[test]
    fn seeded_reset_replays_stream() {
        let mut source = EntropySource::seeded(7);
        let first: Vec<f64> = (0..10).map(|_| source.sample(TimeDelta::zero())).collect();
        source.reset();
        let replay: Vec<f64> = (0..10).map(|_| source.sample(TimeDelta::zero())).collect();
        assert_eq!(first, replay);
    }

    #[test]
    fn virtual_time_sample_is_elapsed_modulo_100() {
        let mut source = EntropySource::virtual_time();
        assert_eq!(source.sample(TimeDelta::milliseconds(0)), 0.0);
        assert_eq!(source.sample(TimeDelta::milliseconds(1_250)), 0.5);
        assert_eq!(source.sample(TimeDelta::milliseconds(399)), 0.99);
    }

    #[test]
    fn virtual_time_failure_threshold() {
        let mut source = EntropySource::virtual_time();
        // 30% failure rate: ms 0..=29 of each window fail
        assert!(source.should_fail(0.3, TimeDelta::milliseconds(429)));
        assert!(!source.should_fail(0.3, TimeDelta::milliseconds(430)));
        assert!(!source.should_fail(0.0, TimeDelta::milliseconds(400)));
        assert!(source.should_fail(1.0, TimeDelta::milliseconds(499)));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut source = EntropySource::seeded(99);
        let bound = TimeDelta::milliseconds(20);
        for _ in 0..1_000 {
            let offset = source.jitter(bound, TimeDelta::zero());
            assert!(offset >= -bound && offset <= bound, "offset {offset}");
        }
        assert_eq!(
            source.jitter(TimeDelta::zero(), TimeDelta::zero()),
            TimeDelta::zero()
        );
    }

    #[test]
    fn from_config_selects_mode() {
        let source = EntropySource::from_config(&EntropyConfig {
            mode: FailureMode::VirtualTime,
            seed: 3,
        });
        assert_eq!(source.mode(), FailureMode::VirtualTime);
        let source = EntropySource::from_config(&EntropyConfig::default());
        assert_eq!(source.mode(), FailureMode::Seeded);
    }
}
