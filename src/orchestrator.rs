//! Multi-stage remote orchestration.
//!
//! Many independent work units are processed concurrently, one task per
//! unit. Each unit's records are streamed out of a source step and driven,
//! one task per record, through three remote stages:
//! *send → acknowledge → status*. The send stage's executor dispatches the
//! per-record chains in parallel `MERGE` mode, so its `max_concurrency`
//! caps the records in flight per unit. Once every record has resolved, the
//! results are handed as one batch to a many-to-one aggregation step.

use futures::future;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ConcurrencyStrategy, ConfigError, EffectiveConfig, StepConfig, StepOverride};
use crate::executor::{ExecutionError, ExecutionResult, StepExecutor, TransienceClassifier};
use crate::remote::throttling_classifier;
use crate::step::{Step, StepError};

/// Environment prefix for [`OrchestratorConfig::from_env`].
pub const ENV_PREFIX: &str = "PIPESTEP_";

/// Settings for unit orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum records in flight per unit.
    pub concurrency_limit_records: usize,
    /// Total attempts for each retrying remote stage.
    pub max_retries: u32,
    /// Wait before the first retry; doubles once, then stays capped.
    pub initial_retry_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit_records: 1000,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Load from `PIPESTEP_*` environment variables, defaulting unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_prefixed(ENV_PREFIX)
    }

    /// Load from environment variables named `<prefix><FIELD>`.
    pub fn from_env_prefixed(prefix: &str) -> Result<Self, ConfigError> {
        let config: Self = envy::prefixed(prefix).from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit_records == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency_limit_records",
                reason: "must be greater than zero",
            });
        }
        if self.initial_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "initial_retry_delay_ms",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Throttling retry for the send and acknowledge stages.
    fn retry_override(&self) -> StepOverride {
        let initial = self.initial_retry_delay();
        StepOverride::new()
            .retry_limit(self.max_retries.saturating_sub(1))
            .retry_wait(initial)
            .max_backoff(initial.saturating_mul(2))
    }

    /// Send stage: retries throttling and dispatches record chains in
    /// parallel `MERGE` mode, capped per unit.
    fn send_config(&self) -> EffectiveConfig {
        let dispatch = StepOverride::new()
            .parallel(true)
            .concurrency_strategy(ConcurrencyStrategy::Merge)
            .max_concurrency(self.concurrency_limit_records);
        StepConfig::default().overlay(&self.retry_override().merged_with(&dispatch))
    }

    fn acknowledge_config(&self) -> EffectiveConfig {
        StepConfig::default().overlay(&self.retry_override())
    }
}

/// An independently schedulable top-level item, such as one input file.
pub trait WorkUnit: Send + Sync + Clone + 'static {
    /// Returns a stable identifier for logging and outcomes.
    fn unit_id(&self) -> String;
}

impl WorkUnit for String {
    fn unit_id(&self) -> String {
        self.clone()
    }
}

impl WorkUnit for &'static str {
    fn unit_id(&self) -> String {
        self.to_string()
    }
}

/// Why a unit failed.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("unit '{unit}': record source failed: {source}")]
    Source {
        unit: String,
        #[source]
        source: ExecutionError,
    },

    #[error("unit '{unit}': {failed} of {total} records failed, first: {first}")]
    Records {
        unit: String,
        failed: usize,
        total: usize,
        #[source]
        first: ExecutionError,
    },

    #[error("unit '{unit}': aggregation failed: {source}")]
    Aggregate {
        unit: String,
        #[source]
        source: ExecutionError,
    },

    #[error("unit '{unit}' cancelled")]
    Cancelled { unit: String },

    #[error("unit '{unit}' aborted: {reason}")]
    Aborted { unit: String, reason: String },
}

/// Result of processing one unit.
#[derive(Debug)]
pub struct UnitOutcome<O> {
    pub unit_id: String,
    pub result: Result<O, OrchestrationError>,
}

/// Runs every record a source produced through the remote stages.
type Dispatch<R, C> = Arc<
    dyn Fn(BoxStream<'static, ExecutionResult<R>>) -> BoxStream<'static, Resolved<C>> + Send + Sync,
>;

/// How one item pulled from the source resolved.
enum Resolved<C> {
    /// The source failed to produce a record.
    Unread(ExecutionError),
    /// The record went through the remote stages.
    Record(ExecutionResult<C>),
}

/// Configures a [`UnitOrchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    classifier: TransienceClassifier,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    /// Replace the default throttling classifier.
    pub fn retry_if<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&StepError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Assemble the orchestrator from its five steps.
    ///
    /// `send` and `acknowledge` retry transient failures; `status` does not.
    pub fn build<U, R, A, S, C, O>(
        self,
        source: Step<U, R>,
        send: Step<R, A>,
        acknowledge: Step<A, S>,
        status: Step<S, C>,
        aggregate: Step<C, O>,
    ) -> Result<UnitOrchestrator<U, R, C, O>, ConfigError>
    where
        U: WorkUnit,
        R: Send + Clone + 'static,
        A: Send + Clone + 'static,
        S: Send + Clone + 'static,
        C: Send + Clone + 'static,
        O: Send + 'static,
    {
        self.config.validate()?;

        let send = StepExecutor::new(send, self.config.send_config())
            .with_classifier(self.classifier.clone())
            .with_cancellation(self.cancel.clone());
        let acknowledge = StepExecutor::new(acknowledge, self.config.acknowledge_config())
            .with_classifier(self.classifier.clone())
            .with_cancellation(self.cancel.clone());
        let status = StepExecutor::new(status, EffectiveConfig::default())
            .with_cancellation(self.cancel.clone());

        let dispatch: Dispatch<R, C> = Arc::new(move |records| {
            let acknowledge = acknowledge.clone();
            let status = status.clone();
            send.schedule(
                records,
                move |send, record| {
                    let acknowledge = acknowledge.clone();
                    let status = status.clone();
                    async move {
                        let record = match record {
                            Ok(record) => record,
                            Err(e) => return Resolved::Unread(e),
                        };
                        let chained = async {
                            let sent = send.execute(record).await?;
                            let acked = acknowledge.execute(sent).await?;
                            status.execute(acked).await
                        };
                        Resolved::Record(chained.await)
                    }
                },
                |e| Resolved::Record(Err(e)),
            )
        });

        Ok(UnitOrchestrator {
            config: self.config,
            source: StepExecutor::new(source, EffectiveConfig::default())
                .with_cancellation(self.cancel.clone()),
            dispatch,
            aggregate: StepExecutor::new(aggregate, EffectiveConfig::default())
                .with_cancellation(self.cancel.clone()),
            cancel: self.cancel,
        })
    }
}

/// Drives work units through source, three remote stages and aggregation.
pub struct UnitOrchestrator<U, R, C, O>
where
    U: WorkUnit,
    R: Send + Clone + 'static,
    C: Send + Clone + 'static,
    O: Send + 'static,
{
    config: OrchestratorConfig,
    source: StepExecutor<U, R>,
    dispatch: Dispatch<R, C>,
    aggregate: StepExecutor<C, O>,
    cancel: CancellationToken,
}

impl<U, R, C, O> Clone for UnitOrchestrator<U, R, C, O>
where
    U: WorkUnit,
    R: Send + Clone + 'static,
    C: Send + Clone + 'static,
    O: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            source: self.source.clone(),
            dispatch: self.dispatch.clone(),
            aggregate: self.aggregate.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl UnitOrchestrator<String, (), (), ()> {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            classifier: throttling_classifier(),
            cancel: CancellationToken::new(),
        }
    }
}

impl<U, R, C, O> UnitOrchestrator<U, R, C, O>
where
    U: WorkUnit,
    R: Send + Clone + 'static,
    C: Send + Clone + 'static,
    O: Send + 'static,
{
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Token that stops every unit's in-flight work when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process one unit to completion.
    ///
    /// Every record resolves before the unit does. Aggregation runs only if
    /// all records succeeded.
    pub async fn process_unit(&self, unit: U) -> UnitOutcome<O> {
        let unit_id = unit.unit_id();
        info!(unit = %unit_id, "Processing unit");

        let result = self.drive(&unit_id, unit).await;
        match &result {
            Ok(_) => info!(unit = %unit_id, "Unit completed"),
            Err(e) => error!(unit = %unit_id, error = %e, "Unit failed"),
        }
        UnitOutcome { unit_id, result }
    }

    async fn drive(&self, unit_id: &str, unit: U) -> Result<O, OrchestrationError> {
        let records = self.source.run(stream::once(future::ready(unit)).boxed());
        let mut resolved = (self.dispatch)(records);
        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut source_failure = None;
        let mut total = 0usize;

        while let Some(outcome) = resolved.next().await {
            match outcome {
                Resolved::Unread(e) => {
                    source_failure.get_or_insert(e);
                }
                Resolved::Record(result) => {
                    total += 1;
                    match result {
                        Ok(output) => results.push(output),
                        Err(e) => failures.push(e),
                    }
                }
            }
        }
        debug!(unit = %unit_id, total, failed = failures.len(), "Records resolved");

        if self.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled {
                unit: unit_id.to_string(),
            });
        }
        if let Some(source) = source_failure {
            return Err(OrchestrationError::Source {
                unit: unit_id.to_string(),
                source,
            });
        }
        let failed = failures.len();
        if let Some(first) = failures.into_iter().next() {
            return Err(OrchestrationError::Records {
                unit: unit_id.to_string(),
                failed,
                total,
                first,
            });
        }

        self.aggregate
            .execute_batch(results)
            .await
            .map_err(|source| OrchestrationError::Aggregate {
                unit: unit_id.to_string(),
                source,
            })
    }

    /// Process every unit concurrently, one task per unit.
    ///
    /// Resolves once every unit has succeeded or failed; outcomes are in
    /// completion order.
    pub async fn process_all<It>(&self, units: It) -> Vec<UnitOutcome<O>>
    where
        It: IntoIterator<Item = U>,
    {
        let pending: FuturesUnordered<_> = units
            .into_iter()
            .map(|unit| {
                let unit_id = unit.unit_id();
                let this = self.clone();
                let handle = tokio::spawn(async move { this.process_unit(unit).await });
                async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(unit = %unit_id, error = %e, "Unit task aborted");
                            UnitOutcome {
                                result: Err(OrchestrationError::Aborted {
                                    unit: unit_id.clone(),
                                    reason: e.to_string(),
                                }),
                                unit_id,
                            }
                        }
                    }
                }
            })
            .collect();

        pending.collect().await
    }
}
