//! Pipeline builder and chain runner.

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{ConfigError, EffectiveConfig, PipelineConfig, StepConfig, StepOverride, StepSettings};
use crate::executor::{ExecutionError, ExecutionResult, StepExecutor, TransienceClassifier};
use crate::step::{Step, StepError, StepShape};

/// Stream of per-element chain results.
pub type FlowStream<T> = BoxStream<'static, Result<T, PipelineError>>;

/// Errors that can occur during pipeline execution.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline step failed: {0}")]
    StepFailed(#[from] ExecutionError),

    #[error("pipeline '{pipeline}' produced no output")]
    NoOutput { pipeline: &'static str },

    #[error("pipeline configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// The step that failed, if a step failed.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Self::StepFailed(e) => Some(e.step()),
            _ => None,
        }
    }
}

/// Graph representation of a pipeline, for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineGraph {
    pub name: String,
    pub steps: Vec<StepNode>,
}

/// A step in the pipeline graph.
#[derive(Debug, Clone, Serialize)]
pub struct StepNode {
    pub name: String,
    pub index: usize,
    pub shape: StepShape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: EffectiveConfig,
}

/// Per-run state shared by every stage.
#[doc(hidden)]
#[derive(Clone)]
pub struct RunContext {
    pub pipeline: &'static str,
    pub cancel: CancellationToken,
    pub runtime: Option<Handle>,
}

/// Builder-time options for one stage.
#[doc(hidden)]
#[derive(Clone, Default)]
pub struct StageOptions {
    manual: StepOverride,
    classifier: Option<TransienceClassifier>,
    description: Option<String>,
}

/// A step at a fixed position in a chain.
pub struct PipelineStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    index: usize,
    name: &'static str,
    step: Step<I, O>,
    settings: StepSettings,
    classifier: Option<TransienceClassifier>,
    description: Option<String>,
}

impl<I, O> PipelineStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    pub fn new(index: usize, step: Step<I, O>) -> Self {
        Self {
            index,
            name: step.name(),
            step,
            settings: StepSettings::new(),
            classifier: None,
            description: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    fn executor(&self, ctx: &RunContext) -> StepExecutor<I, O> {
        let mut executor = StepExecutor::new(self.step.clone(), self.settings.effective().clone())
            .with_cancellation(ctx.cancel.clone());
        if let Some(classifier) = &self.classifier {
            executor = executor.with_classifier(classifier.clone());
        }
        if let Some(handle) = &ctx.runtime {
            executor = executor.with_runtime(handle.clone());
        }
        executor
    }

    /// Run this stage over the upstream, adapting to the step's shape.
    ///
    /// Upstream failures pass through element-wise stages untouched, abort
    /// the many-to-one window they fall into, and are forwarded after a
    /// many-to-many stage's outputs.
    fn run(&self, upstream: FlowStream<I>, ctx: &RunContext) -> FlowStream<O> {
        let executor = self.executor(ctx);
        let stage_log = StageLog {
            pipeline: ctx.pipeline,
            step: self.name,
            index: self.index,
        };

        match self.step.shape() {
            StepShape::OneToOne | StepShape::BlockingOneToOne => executor.schedule(
                upstream,
                move |executor, item| async move {
                    match item {
                        Ok(input) => {
                            stage_log.enter();
                            stage_log.exit(executor.execute(input).await)
                        }
                        Err(e) => Err(e),
                    }
                },
                |e| Err(PipelineError::from(e)),
            ),
            StepShape::OneToMany => {
                let merges = executor.merges();
                let limit = executor.config().max_concurrency();
                let opened = executor.schedule(
                    upstream,
                    move |executor, item| async move {
                        let input = match item {
                            Ok(input) => input,
                            Err(e) => return stream::iter([Err(e)]).boxed(),
                        };
                        stage_log.enter();
                        executor
                            .open(input)
                            .await
                            .map(move |element| stage_log.exit(element))
                            .boxed()
                    },
                    |e| stream::iter([Err(PipelineError::from(e))]).boxed(),
                );
                if merges {
                    opened.flatten_unordered(limit).boxed()
                } else {
                    opened.flatten().boxed()
                }
            }
            StepShape::ManyToOne => executor
                .windows(upstream)
                .then(move |window| {
                    let executor = executor.clone();
                    async move {
                        match window.into_iter().collect::<Result<Vec<I>, PipelineError>>() {
                            Ok(batch) => {
                                stage_log.enter();
                                stage_log.exit(executor.execute_batch(batch).await)
                            }
                            Err(e) => Err(e),
                        }
                    }
                })
                .boxed(),
            StepShape::ManyToMany => {
                // Failed upstream elements skip the transform and are
                // reported once its outputs are exhausted.
                let failures: Arc<Mutex<Vec<PipelineError>>> = Arc::new(Mutex::new(Vec::new()));
                let writer = failures.clone();
                let inputs = upstream
                    .filter_map(move |item| {
                        future::ready(match item {
                            Ok(input) => Some(input),
                            Err(e) => {
                                if let Ok(mut failed) = writer.lock() {
                                    failed.push(e);
                                }
                                None
                            }
                        })
                    })
                    .boxed();

                let outputs = stream::once(async move {
                    stage_log.enter();
                    executor.transform(inputs)
                })
                .flatten()
                .map(move |element| stage_log.exit(element));
                let upstream_failures = stream::once(async move {
                    let drained = failures
                        .lock()
                        .map(|mut failed| std::mem::take(&mut *failed))
                        .unwrap_or_default();
                    stream::iter(drained)
                })
                .flatten()
                .map(Err);

                outputs.chain(upstream_failures).boxed()
            }
        }
    }

    fn node(&self) -> StepNode {
        StepNode {
            name: self.name.to_string(),
            index: self.index,
            shape: self.step.shape(),
            description: self.description.clone(),
            config: self.settings.effective().clone(),
        }
    }
}

/// Logging for one stage.
#[derive(Clone, Copy)]
struct StageLog {
    pipeline: &'static str,
    step: &'static str,
    index: usize,
}

impl StageLog {
    fn enter(&self) {
        debug!(pipeline = self.pipeline, step = self.step, index = self.index, "Step started");
    }

    fn exit<T>(&self, result: ExecutionResult<T>) -> Result<T, PipelineError> {
        match result {
            Ok(output) => {
                debug!(pipeline = self.pipeline, step = self.step, index = self.index, "Step completed");
                Ok(output)
            }
            Err(e) => {
                error!(pipeline = self.pipeline, step = self.step, index = self.index, error = %e, "Step failed");
                Err(e.into())
            }
        }
    }
}

/// A chain of stages that transforms a stream of I into a stream of O.
#[doc(hidden)]
pub trait StepChain<I, O>: Send + Sync {
    fn run(&self, upstream: FlowStream<I>, ctx: &RunContext) -> FlowStream<O>;

    /// Initialize every stage from its builder options.
    fn prepare(&mut self, defaults: &StepConfig, options: &[StageOptions]) -> Result<(), ConfigError>;

    /// Re-initialize every stage from a pipeline configuration.
    fn reconfigure(&mut self, config: &PipelineConfig) -> Result<(), ConfigError>;

    /// Returns the number of steps in this chain.
    fn step_count(&self) -> usize;

    /// Collect graph nodes in order.
    fn collect_nodes(&self, nodes: &mut Vec<StepNode>);
}

/// Terminal chain - identity transform.
#[doc(hidden)]
pub struct Identity;

impl<T: Send + 'static> StepChain<T, T> for Identity {
    fn run(&self, upstream: FlowStream<T>, _ctx: &RunContext) -> FlowStream<T> {
        upstream
    }

    fn prepare(&mut self, _defaults: &StepConfig, _options: &[StageOptions]) -> Result<(), ConfigError> {
        Ok(())
    }

    fn reconfigure(&mut self, _config: &PipelineConfig) -> Result<(), ConfigError> {
        Ok(())
    }

    fn step_count(&self) -> usize {
        0
    }

    fn collect_nodes(&self, _nodes: &mut Vec<StepNode>) {}
}

/// Chain that runs the first chain, then one more stage.
#[doc(hidden)]
pub struct ThenChain<First, I, M, O>
where
    M: Send + Clone + 'static,
    O: Send + 'static,
{
    pub first: First,
    pub stage: PipelineStep<M, O>,
    pub _phantom: PhantomData<fn(I) -> M>,
}

impl<First, I, M, O> StepChain<I, O> for ThenChain<First, I, M, O>
where
    I: Send + 'static,
    M: Send + Clone + 'static,
    O: Send + 'static,
    First: StepChain<I, M>,
{
    fn run(&self, upstream: FlowStream<I>, ctx: &RunContext) -> FlowStream<O> {
        let mid = self.first.run(upstream, ctx);
        self.stage.run(mid, ctx)
    }

    fn prepare(&mut self, defaults: &StepConfig, options: &[StageOptions]) -> Result<(), ConfigError> {
        self.first.prepare(defaults, options)?;
        let stage = &mut self.stage;
        let options = options.get(stage.index).cloned().unwrap_or_default();
        stage.classifier = options.classifier;
        stage.description = options.description;
        stage.settings.initialize(defaults, &options.manual)?;
        Ok(())
    }

    fn reconfigure(&mut self, config: &PipelineConfig) -> Result<(), ConfigError> {
        self.first.reconfigure(config)?;
        let incoming = config
            .override_for(self.stage.name)
            .cloned()
            .unwrap_or_default();
        self.stage.settings.initialize(&config.defaults, &incoming)?;
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.first.step_count() + 1
    }

    fn collect_nodes(&self, nodes: &mut Vec<StepNode>) {
        self.first.collect_nodes(nodes);
        nodes.push(self.stage.node());
    }
}

/// Builder for constructing pipelines.
pub struct Pipeline<I, O, Chain> {
    name: &'static str,
    chain: Chain,
    defaults: StepConfig,
    options: Vec<StageOptions>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl Pipeline<(), (), Identity> {
    /// Create a new pipeline builder with the given name.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            chain: Identity,
            defaults: StepConfig::default(),
            options: Vec::new(),
            cancel: CancellationToken::new(),
            runtime: None,
            _phantom: PhantomData,
        }
    }

    /// Add the first step to the pipeline.
    pub fn start_with<I, O>(self, step: Step<I, O>) -> StepBuilder<I, O, ThenChain<Identity, I, I, O>>
    where
        I: Send + Clone + 'static,
        O: Send + 'static,
    {
        let pipeline = Pipeline {
            name: self.name,
            chain: ThenChain {
                first: Identity,
                stage: PipelineStep::new(0, step),
                _phantom: PhantomData,
            },
            defaults: self.defaults,
            options: vec![StageOptions::default()],
            cancel: self.cancel,
            runtime: self.runtime,
            _phantom: PhantomData,
        };
        StepBuilder { pipeline }
    }
}

impl<I, O, Chain> Pipeline<I, O, Chain> {
    /// Set the pipeline-wide step defaults.
    pub fn with_defaults(mut self, defaults: StepConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Stop in-flight work when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Dispatch step work onto `handle`.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

/// Builder returned after adding a step, configuring that step.
pub struct StepBuilder<I, O, Chain> {
    pipeline: Pipeline<I, O, Chain>,
}

impl<I, O, Chain> StepBuilder<I, O, Chain>
where
    I: Send + 'static,
    O: Send + Clone + 'static,
    Chain: StepChain<I, O> + 'static,
{
    fn last(&mut self) -> Option<&mut StageOptions> {
        self.pipeline.options.last_mut()
    }

    /// Pin a configuration override on the last added step.
    ///
    /// Values differing from the defaults survive later reconfiguration.
    pub fn with_override(mut self, manual: StepOverride) -> Self {
        if let Some(options) = self.last() {
            options.manual = manual;
        }
        self
    }

    /// Only retry failures of the last added step that `classifier` accepts.
    pub fn retry_if<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&StepError) -> bool + Send + Sync + 'static,
    {
        if let Some(options) = self.last() {
            options.classifier = Some(Arc::new(classifier));
        }
        self
    }

    /// Add a description to the last added step.
    pub fn desc(mut self, description: &str) -> Self {
        if let Some(options) = self.last() {
            options.description = Some(description.to_string());
        }
        self
    }

    /// Add another step to the pipeline.
    pub fn then<P>(self, step: Step<O, P>) -> StepBuilder<I, P, ThenChain<Chain, I, O, P>>
    where
        P: Send + 'static,
    {
        let index = self.pipeline.chain.step_count();
        let mut options = self.pipeline.options;
        options.push(StageOptions::default());
        StepBuilder {
            pipeline: Pipeline {
                name: self.pipeline.name,
                chain: ThenChain {
                    first: self.pipeline.chain,
                    stage: PipelineStep::new(index, step),
                    _phantom: PhantomData,
                },
                defaults: self.pipeline.defaults,
                options,
                cancel: self.pipeline.cancel,
                runtime: self.pipeline.runtime,
                _phantom: PhantomData,
            },
        }
    }

    pub fn with_defaults(mut self, defaults: StepConfig) -> Self {
        self.pipeline = self.pipeline.with_defaults(defaults);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.pipeline = self.pipeline.with_cancellation(token);
        self
    }

    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.pipeline = self.pipeline.with_runtime(handle);
        self
    }

    /// Build the pipeline, resolving every step's effective configuration.
    pub fn build(self) -> Result<BuiltPipeline<I, O, Chain>, ConfigError> {
        let Pipeline {
            name,
            mut chain,
            defaults,
            options,
            cancel,
            runtime,
            ..
        } = self.pipeline;

        defaults.validate()?;
        chain.prepare(&defaults, &options)?;

        Ok(BuiltPipeline {
            name,
            chain,
            cancel,
            runtime,
            _phantom: PhantomData,
        })
    }
}

/// A built pipeline ready for execution.
pub struct BuiltPipeline<I, O, Chain> {
    name: &'static str,
    chain: Chain,
    cancel: CancellationToken,
    runtime: Option<Handle>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, Chain> BuiltPipeline<I, O, Chain>
where
    I: Send + 'static,
    O: Send + 'static,
    Chain: StepChain<I, O>,
{
    /// Get the pipeline name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Token that stops this pipeline's in-flight work when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Re-initialize every step from `config`.
    ///
    /// Runs already started keep the configuration they started with.
    pub fn configure(&mut self, config: &PipelineConfig) -> Result<(), ConfigError> {
        config.defaults.validate()?;
        let mut nodes = Vec::new();
        self.chain.collect_nodes(&mut nodes);
        if let Some(unknown) = config
            .steps
            .keys()
            .find(|name| !nodes.iter().any(|node| &node.name == *name))
        {
            return Err(ConfigError::UnknownStep(unknown.clone()));
        }
        self.chain.reconfigure(config)
    }

    fn context(&self) -> RunContext {
        RunContext {
            pipeline: self.name,
            cancel: self.cancel.clone(),
            runtime: self.runtime.clone(),
        }
    }

    /// Stream every input through the chain.
    ///
    /// Each element's failure is reported in place; siblings keep flowing.
    pub fn run_stream<S>(&self, inputs: S) -> FlowStream<O>
    where
        S: Stream<Item = I> + Send + 'static,
    {
        debug!(pipeline = self.name, "Pipeline started");
        self.chain.run(inputs.map(Ok).boxed(), &self.context())
    }

    /// Execute the pipeline for one input, returning its first output or
    /// its first unrecovered failure.
    pub async fn run(&self, input: I) -> Result<O, PipelineError> {
        let mut outputs = self.run_stream(stream::iter([input]));
        match outputs.next().await {
            Some(result) => result,
            None => Err(PipelineError::NoOutput {
                pipeline: self.name,
            }),
        }
    }

    /// Execute the pipeline for many inputs, collecting every result.
    pub async fn run_all(&self, inputs: Vec<I>) -> Vec<Result<O, PipelineError>> {
        self.run_stream(stream::iter(inputs)).collect().await
    }

    /// Export the pipeline structure as a graph.
    pub fn to_graph(&self) -> PipelineGraph {
        let mut steps = Vec::with_capacity(self.chain.step_count());
        self.chain.collect_nodes(&mut steps);
        PipelineGraph {
            name: self.name.to_string(),
            steps,
        }
    }
}

/// Run a built pipeline for one input.
pub async fn run_pipeline<I, O, Chain>(
    pipeline: &BuiltPipeline<I, O, Chain>,
    input: I,
) -> Result<O, PipelineError>
where
    I: Send + 'static,
    O: Send + 'static,
    Chain: StepChain<I, O>,
{
    pipeline.run(input).await
}
