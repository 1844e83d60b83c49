//! Step configuration.
//!
//! Configuration has two tiers: pipeline-wide [`StepConfig`] defaults and a
//! sparse per-step [`StepOverride`]. Overlaying one on the other yields the
//! [`EffectiveConfig`] an executor runs with. [`StepSettings`] owns that
//! resolution for one step instance, including the override the step pinned
//! on its first initialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Retries performed when nothing opts in.
pub const DEFAULT_RETRY_LIMIT: u32 = 0;

/// Base wait before the first retry.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(2000);

/// Upper bound for the doubling backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// In-flight bound for parallel mode.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1024;

/// Errors raised while validating or loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unknown step in configuration: {0}")]
    UnknownStep(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
}

/// How parallel results are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyStrategy {
    /// Emit in completion order.
    #[default]
    Merge,
    /// Emit in input order, buffering early finishers.
    Concatenate,
}

/// Pipeline-wide step defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// Additional attempts after the first failure.
    pub retry_limit: u32,
    /// Wait before the first retry; doubles on each subsequent retry.
    #[serde(rename = "retry_wait_ms", with = "duration_ms")]
    pub retry_wait: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    /// Randomize each backoff wait by up to half in either direction.
    pub jitter: bool,
    /// Log every attempt with its number and cause.
    pub debug: bool,
    /// Hand exhausted items to the step's recovery hook.
    pub recover_on_failure: bool,
    pub parallel: bool,
    pub concurrency_strategy: ConcurrencyStrategy,
    pub max_concurrency: usize,
    /// Window size for many-to-one steps; `None` reduces the whole upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Close a partial window after this long.
    #[serde(
        rename = "batch_timeout_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_timeout: Option<Duration>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_wait: DEFAULT_RETRY_WAIT,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: false,
            debug: false,
            recover_on_failure: false,
            parallel: false,
            concurrency_strategy: ConcurrencyStrategy::Merge,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            batch_size: None,
            batch_timeout: None,
        }
    }
}

impl StepConfig {
    /// Check that the values can drive an executor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_wait.is_zero() {
            return Err(ConfigError::Invalid {
                field: "retry_wait",
                reason: "must be greater than zero",
            });
        }
        if self.max_backoff.is_zero() {
            return Err(ConfigError::Invalid {
                field: "max_backoff",
                reason: "must be greater than zero",
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be greater than zero",
            });
        }
        if self.batch_size == Some(0) {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be greater than zero",
            });
        }
        match self.batch_timeout {
            Some(timeout) if timeout.is_zero() => {
                return Err(ConfigError::Invalid {
                    field: "batch_timeout",
                    reason: "must be greater than zero",
                })
            }
            Some(_) if self.batch_size.is_none() => {
                return Err(ConfigError::Invalid {
                    field: "batch_timeout",
                    reason: "requires batch_size",
                })
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve field by field: a field set in `patch` wins, otherwise the
    /// default applies.
    pub fn overlay(&self, patch: &StepOverride) -> EffectiveConfig {
        EffectiveConfig(StepConfig {
            retry_limit: patch.retry_limit.unwrap_or(self.retry_limit),
            retry_wait: patch.retry_wait.unwrap_or(self.retry_wait),
            max_backoff: patch.max_backoff.unwrap_or(self.max_backoff),
            jitter: patch.jitter.unwrap_or(self.jitter),
            debug: patch.debug.unwrap_or(self.debug),
            recover_on_failure: patch.recover_on_failure.unwrap_or(self.recover_on_failure),
            parallel: patch.parallel.unwrap_or(self.parallel),
            concurrency_strategy: patch
                .concurrency_strategy
                .unwrap_or(self.concurrency_strategy),
            max_concurrency: patch.max_concurrency.unwrap_or(self.max_concurrency),
            batch_size: patch.batch_size.or(self.batch_size),
            batch_timeout: patch.batch_timeout.or(self.batch_timeout),
        })
    }
}

/// A sparse patch over [`StepConfig`] for one step instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(
        rename = "retry_wait_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_wait: Option<Duration>,
    #[serde(
        rename = "max_backoff_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_backoff: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover_on_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency_strategy: Option<ConcurrencyStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(
        rename = "batch_timeout_ms",
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_timeout: Option<Duration>,
}

impl StepOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = Some(wait);
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = Some(enabled);
        self
    }

    pub fn recover_on_failure(mut self, enabled: bool) -> Self {
        self.recover_on_failure = Some(enabled);
        self
    }

    pub fn parallel(mut self, enabled: bool) -> Self {
        self.parallel = Some(enabled);
        self
    }

    pub fn concurrency_strategy(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.concurrency_strategy = Some(strategy);
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Reduce many-to-one input in windows of `size` items.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combine two patches; fields set in `winner` take precedence.
    pub fn merged_with(&self, winner: &StepOverride) -> StepOverride {
        StepOverride {
            retry_limit: winner.retry_limit.or(self.retry_limit),
            retry_wait: winner.retry_wait.or(self.retry_wait),
            max_backoff: winner.max_backoff.or(self.max_backoff),
            jitter: winner.jitter.or(self.jitter),
            debug: winner.debug.or(self.debug),
            recover_on_failure: winner.recover_on_failure.or(self.recover_on_failure),
            parallel: winner.parallel.or(self.parallel),
            concurrency_strategy: winner.concurrency_strategy.or(self.concurrency_strategy),
            max_concurrency: winner.max_concurrency.or(self.max_concurrency),
            batch_size: winner.batch_size.or(self.batch_size),
            batch_timeout: winner.batch_timeout.or(self.batch_timeout),
        }
    }

    /// Keep only the fields whose value differs from `baseline`.
    pub fn differing_from(&self, baseline: &StepConfig) -> StepOverride {
        fn keep<T: PartialEq + Copy>(value: Option<T>, base: T) -> Option<T> {
            value.filter(|v| *v != base)
        }
        StepOverride {
            retry_limit: keep(self.retry_limit, baseline.retry_limit),
            retry_wait: keep(self.retry_wait, baseline.retry_wait),
            max_backoff: keep(self.max_backoff, baseline.max_backoff),
            jitter: keep(self.jitter, baseline.jitter),
            debug: keep(self.debug, baseline.debug),
            recover_on_failure: keep(self.recover_on_failure, baseline.recover_on_failure),
            parallel: keep(self.parallel, baseline.parallel),
            concurrency_strategy: keep(self.concurrency_strategy, baseline.concurrency_strategy),
            max_concurrency: keep(self.max_concurrency, baseline.max_concurrency),
            batch_size: self.batch_size.filter(|v| Some(*v) != baseline.batch_size),
            batch_timeout: self.batch_timeout.filter(|v| Some(*v) != baseline.batch_timeout),
        }
    }
}

/// The resolved configuration of one step, read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EffectiveConfig(StepConfig);

impl EffectiveConfig {
    pub fn retry_limit(&self) -> u32 {
        self.0.retry_limit
    }

    pub fn retry_wait(&self) -> Duration {
        self.0.retry_wait
    }

    pub fn max_backoff(&self) -> Duration {
        self.0.max_backoff
    }

    pub fn jitter(&self) -> bool {
        self.0.jitter
    }

    pub fn debug(&self) -> bool {
        self.0.debug
    }

    pub fn recover_on_failure(&self) -> bool {
        self.0.recover_on_failure
    }

    pub fn parallel(&self) -> bool {
        self.0.parallel
    }

    pub fn concurrency_strategy(&self) -> ConcurrencyStrategy {
        self.0.concurrency_strategy
    }

    pub fn max_concurrency(&self) -> usize {
        self.0.max_concurrency
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.0.batch_size
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.0.batch_timeout
    }

    pub fn as_config(&self) -> &StepConfig {
        &self.0
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self(StepConfig::default())
    }
}

impl From<StepConfig> for EffectiveConfig {
    fn from(config: StepConfig) -> Self {
        Self(config)
    }
}

/// Per-step configuration state across (re)initializations.
///
/// The first initialization captures every incoming field that differs from
/// [`StepConfig::default`]. Later initializations reapply that capture on
/// top of whatever the pipeline passes in.
#[derive(Debug, Clone, Default)]
pub struct StepSettings {
    initialized: bool,
    captured: Option<StepOverride>,
    effective: EffectiveConfig,
}

impl StepSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the effective configuration for this step.
    ///
    /// Must not be called while items are in flight: executors snapshot the
    /// returned configuration when they are built.
    pub fn initialize(
        &mut self,
        defaults: &StepConfig,
        incoming: &StepOverride,
    ) -> Result<&EffectiveConfig, ConfigError> {
        if !self.initialized {
            let pinned = incoming.differing_from(&StepConfig::default());
            if !pinned.is_empty() {
                self.captured = Some(pinned);
            }
        }

        let patch = match &self.captured {
            Some(captured) => incoming.merged_with(captured),
            None => incoming.clone(),
        };
        let effective = defaults.overlay(&patch);
        effective.as_config().validate()?;

        self.effective = effective;
        self.initialized = true;
        Ok(&self.effective)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The override pinned on first initialization, if any.
    pub fn captured(&self) -> Option<&StepOverride> {
        self.captured.as_ref()
    }

    pub fn effective(&self) -> &EffectiveConfig {
        &self.effective
    }
}

/// Configuration tree for a whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub defaults: StepConfig,
    /// Overrides keyed by step name.
    pub steps: HashMap<String, StepOverride>,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.defaults.validate()?;
        Ok(config)
    }

    pub fn with_defaults(mut self, defaults: StepConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, patch: StepOverride) -> Self {
        self.steps.insert(name.into(), patch);
        self
    }

    pub fn override_for(&self, name: &str) -> Option<&StepOverride> {
        self.steps.get(name)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
