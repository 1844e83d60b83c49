//! # Pipestep
//!
//! Reactive step pipelines that run in your process.
//!
//! Compose units of work ("steps") into typed chains, and let the execution
//! engine decide how each step runs: one item at a time or concurrently,
//! with completion-order or input-order results, doubling backoff retries,
//! and optional dead-letter recovery.
//!
//! ## Step shapes
//!
//! - [`OneToOne`] - one input, one output
//! - [`OneToMany`] - one input, a stream of outputs
//! - [`ManyToOne`] - the whole upstream reduced to one output
//! - [`ManyToMany`] - a streaming transform
//! - [`BlockingOneToOne`] - like one-to-one, run on the blocking pool
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipestep::{Pipeline, StepOverride, ConcurrencyStrategy};
//!
//! let pipeline = Pipeline::new("payments")
//!     .start_with(ParseRecord.into_step())
//!     .then(Enrich.into_step())
//!     .with_override(
//!         StepOverride::new()
//!             .parallel(true)
//!             .concurrency_strategy(ConcurrencyStrategy::Concatenate)
//!             .retry_limit(2),
//!     )
//!     .then(Summarize.into_step())
//!     .build()?;
//!
//! let summary = pipeline.run(input).await?;
//! ```
//!
//! ## Remote orchestration
//!
//! [`UnitOrchestrator`] processes many work units concurrently, driving
//! each unit's records through *send → acknowledge → status* remote stages
//! with a bounded number of records in flight and throttling-aware retry.

pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod step;

pub use config::{
    ConcurrencyStrategy, ConfigError, EffectiveConfig, PipelineConfig, StepConfig, StepOverride,
    StepSettings,
};
pub use executor::{run_step, ExecutionError, ExecutionResult, StepExecutor, TransienceClassifier};
pub use orchestrator::{
    OrchestrationError, OrchestratorBuilder, OrchestratorConfig, UnitOrchestrator, UnitOutcome,
    WorkUnit,
};
pub use pipeline::{
    run_pipeline, BuiltPipeline, FlowStream, Pipeline, PipelineError, PipelineGraph, PipelineStep,
    StepBuilder, StepNode,
};
pub use remote::{is_throttling, throttling_classifier, RemoteError, RemoteInvoker, RemoteStep, StatusCode};
pub use retry::RetryPolicy;
pub use step::{
    BlockingFnStep, BlockingOneToOne, FnStep, ManyToMany, ManyToOne, OneToMany, OneToOne, Step,
    StepError, StepShape,
};
