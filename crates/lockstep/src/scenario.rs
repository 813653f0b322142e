//! Named latency and failure profiles.
//!
//! A [`DelayScenario`] describes how long a simulated operation takes, how
//! much that varies, and how often it fails. The [`ScenarioCatalog`] ships
//! presets from fast and stable to slow and unreliable; tests can add or
//! override entries at any time. Lookups hand out copies, so a scenario in
//! use is never changed underneath a running execution.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::TimeDelta;
use lockstep_config::ScenarioDefinition;

use crate::error::{EngineError, Result};

/// Lower bound on any simulated delay, as a fraction of the base delay.
pub const DELAY_FLOOR_RATIO: f64 = 0.8;

/// A latency/failure profile.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayScenario {
    pub name: String,
    pub base_delay: TimeDelta,
    pub jitter_bound: TimeDelta,
    /// Probability in `[0, 1]` that an attempt fails after its delay.
    pub failure_rate: f64,
    /// Exponential backoff multiplier between retries.
    pub retry_multiplier: f64,
    pub max_retries: u32,
}

impl DelayScenario {
    /// Creates a scenario with a 2.0 retry multiplier and 3 retries.
    pub fn new(
        name: impl Into<String>,
        base_delay: TimeDelta,
        jitter_bound: TimeDelta,
        failure_rate: f64,
    ) -> Self {
        Self {
            name: name.into(),
            base_delay,
            jitter_bound,
            failure_rate,
            retry_multiplier: 2.0,
            max_retries: 3,
        }
    }

    pub fn with_retry_multiplier(mut self, retry_multiplier: f64) -> Self {
        self.retry_multiplier = retry_multiplier;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builds a scenario from a configuration entry.
    pub fn from_definition(name: impl Into<String>, definition: &ScenarioDefinition) -> Self {
        Self::new(
            name,
            TimeDelta::milliseconds(definition.base_delay_ms as i64),
            TimeDelta::milliseconds(definition.jitter_ms as i64),
            definition.failure_rate,
        )
        .with_retry_multiplier(definition.retry_multiplier)
        .with_max_retries(definition.max_retries)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| EngineError::InvalidScenario {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.base_delay < TimeDelta::zero() {
            return Err(invalid(format!(
                "base delay must be non-negative, got {}ms",
                self.base_delay.num_milliseconds()
            )));
        }
        if self.jitter_bound < TimeDelta::zero() {
            return Err(invalid(format!(
                "jitter bound must be non-negative, got {}ms",
                self.jitter_bound.num_milliseconds()
            )));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(invalid(format!(
                "failure rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if !(self.retry_multiplier >= 1.0 && self.retry_multiplier.is_finite()) {
            return Err(invalid(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.retry_multiplier
            )));
        }
        Ok(())
    }

    /// Smallest delay this scenario can produce.
    pub fn min_delay(&self) -> TimeDelta {
        (self.base_delay - self.jitter_bound).max(self.delay_floor())
    }

    /// Largest delay this scenario can produce.
    pub fn max_delay(&self) -> TimeDelta {
        self.base_delay + self.jitter_bound
    }

    fn delay_floor(&self) -> TimeDelta {
        crate::clock::scale(self.base_delay, DELAY_FLOOR_RATIO).max(TimeDelta::zero())
    }

    /// Applies a jitter offset, flooring at 80% of the base delay.
    pub fn delay_with_jitter(&self, jitter: TimeDelta) -> TimeDelta {
        (self.base_delay + jitter).max(self.delay_floor())
    }

    /// Built-in presets.
    pub fn presets() -> Vec<DelayScenario> {
        let ms = TimeDelta::milliseconds;
        vec![
            Self::new("instant", TimeDelta::zero(), TimeDelta::zero(), 0.0),
            Self::new("fast", ms(25), ms(5), 0.0),
            Self::new("normal", ms(100), ms(20), 0.01),
            Self::new("slow", ms(1_000), ms(200), 0.05),
            Self::new("network_unreliable", ms(500), ms(250), 0.30).with_max_retries(5),
            Self::new("degraded", ms(3_000), ms(1_000), 0.15),
            Self::new("offline_recovery", ms(5_000), ms(2_000), 0.20)
                .with_retry_multiplier(1.5)
                .with_max_retries(5),
        ]
    }
}

/// Mutable registry of delay scenarios.
#[derive(Debug)]
pub struct ScenarioCatalog {
    scenarios: RwLock<BTreeMap<String, DelayScenario>>,
}

impl ScenarioCatalog {
    /// Catalog with no scenarios.
    pub fn empty() -> Self {
        Self {
            scenarios: RwLock::new(BTreeMap::new()),
        }
    }

    /// Catalog seeded with [`DelayScenario::presets`].
    pub fn with_presets() -> Self {
        let scenarios = DelayScenario::presets()
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Self {
            scenarios: RwLock::new(scenarios),
        }
    }

    /// Presets plus (overridden by) configured definitions.
    pub fn from_definitions(definitions: &BTreeMap<String, ScenarioDefinition>) -> Result<Self> {
        let catalog = Self::with_presets();
        for (name, definition) in definitions {
            catalog.register(DelayScenario::from_definition(name.clone(), definition))?;
        }
        Ok(catalog)
    }

    /// Adds or replaces a scenario, returning the one it replaced.
    pub fn register(&self, scenario: DelayScenario) -> Result<Option<DelayScenario>> {
        scenario.validate()?;
        let name = scenario.name.clone();
        let previous = self
            .scenarios
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), scenario);
        if previous.is_some() {
            tracing::info!(scenario = %name, "delay scenario overridden");
        }
        Ok(previous)
    }

    /// Returns a copy of the named scenario.
    pub fn get(&self, name: &str) -> Result<DelayScenario> {
        let scenarios = self.scenarios.read().unwrap_or_else(PoisonError::into_inner);
        scenarios
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownScenario {
                name: name.to_string(),
                known: scenarios.keys().cloned().collect(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scenarios
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Sorted scenario names.
    pub fn names(&self) -> Vec<String> {
        self.scenarios
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::with_presets()
    }
}
