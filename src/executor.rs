//! Execution engine.
//!
//! A [`StepExecutor`] drives one step over a sequence of items using that
//! step's [`EffectiveConfig`]:
//!
//! - `parallel = false` processes items strictly one at a time, in order.
//! - `parallel = true` dispatches items as tasks, bounded by
//!   `max_concurrency`, emitting in completion order (`MERGE`) or input
//!   order (`CONCATENATE`).
//! - Each item is retried with a doubling backoff up to `retry_limit`
//!   extra attempts, then handed to the step's recovery hook when
//!   `recover_on_failure` is set.
//!
//! One item's failure never affects its siblings; it surfaces as an
//! [`ExecutionError`] at that item's position in the output.

use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConcurrencyStrategy, EffectiveConfig};
use crate::retry::RetryPolicy;
use crate::step::{Step, StepError, StepShape};

/// Predicate deciding whether a failure is transient and worth retrying.
pub type TransienceClassifier = Arc<dyn Fn(&StepError) -> bool + Send + Sync>;

/// Terminal outcome of one item.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Why an item ended in failure.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("step '{step}' failed after {attempts} attempt(s): {source}")]
    Exhausted {
        step: &'static str,
        attempts: u32,
        /// Classification from the installed classifier, if any.
        transient: Option<bool>,
        #[source]
        source: StepError,
    },

    #[error("step '{step}' recovery failed: {source} (after: {cause})")]
    RecoveryFailed {
        step: &'static str,
        cause: StepError,
        #[source]
        source: StepError,
    },

    #[error("step '{step}' emitted a failed element: {source}")]
    ElementFailed {
        step: &'static str,
        #[source]
        source: StepError,
    },

    #[error("step '{step}' cancelled")]
    Cancelled { step: &'static str },

    #[error("step '{step}' aborted: {reason}")]
    Aborted { step: &'static str, reason: String },

    #[error("step '{step}' is {shape} and cannot process a single item")]
    Unsupported { step: &'static str, shape: StepShape },
}

impl ExecutionError {
    /// The step the failure belongs to.
    pub fn step(&self) -> &'static str {
        match self {
            Self::Exhausted { step, .. }
            | Self::RecoveryFailed { step, .. }
            | Self::ElementFailed { step, .. }
            | Self::Cancelled { step }
            | Self::Aborted { step, .. }
            | Self::Unsupported { step, .. } => step,
        }
    }

    /// The transience classification, when a classifier was installed.
    pub fn is_transient(&self) -> Option<bool> {
        match self {
            Self::Exhausted { transient, .. } => *transient,
            _ => None,
        }
    }

    /// The step error that ended the item, if there was one.
    pub fn cause(&self) -> Option<&StepError> {
        match self {
            Self::Exhausted { source, .. }
            | Self::RecoveryFailed { source, .. }
            | Self::ElementFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// How a retry loop ended without success.
enum Failure {
    Cancelled,
    Exhausted { cause: StepError, attempts: u32 },
}

/// Runs one step according to its effective configuration.
pub struct StepExecutor<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    step: Step<I, O>,
    config: EffectiveConfig,
    policy: RetryPolicy,
    classifier: Option<TransienceClassifier>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl<I, O> Clone for StepExecutor<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            step: self.step.clone(),
            config: self.config.clone(),
            policy: self.policy.clone(),
            classifier: self.classifier.clone(),
            cancel: self.cancel.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<I, O> StepExecutor<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    /// Snapshot `config` for the lifetime of this executor.
    pub fn new(step: Step<I, O>, config: EffectiveConfig) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            step,
            config,
            policy,
            classifier: None,
            cancel: CancellationToken::new(),
            runtime: None,
        }
    }

    /// Only retry failures the classifier accepts.
    pub fn with_classifier(mut self, classifier: TransienceClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Dispatch tasks and blocking calls onto `handle` instead of the
    /// ambient runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn name(&self) -> &'static str {
        self.step.name()
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.config
    }

    /// Process one item through a one-to-one (or blocking) step.
    ///
    /// A many-to-one step treats the item as a batch of one.
    pub async fn execute(&self, input: I) -> ExecutionResult<O> {
        match &self.step {
            Step::OneToOne(step) => {
                let replay = input.clone();
                match self.retrying(move || step.apply(replay.clone())).await {
                    Ok(output) => Ok(output),
                    Err(Failure::Cancelled) => Err(self.cancelled()),
                    Err(Failure::Exhausted { cause, attempts }) => {
                        if !self.config.recover_on_failure() {
                            return Err(self.exhausted(cause, attempts));
                        }
                        let outcome = step.recover(input, &cause).await;
                        self.recovered(cause, attempts, outcome)
                    }
                }
            }
            Step::Blocking(step) => {
                let replay = input.clone();
                let attempt = move || {
                    let step = step.clone();
                    let input = replay.clone();
                    let task = self.spawn_blocking(move || step.apply(input));
                    async move {
                        match task.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(StepError::Join(e.to_string())),
                        }
                    }
                };
                match self.retrying(attempt).await {
                    Ok(output) => Ok(output),
                    Err(Failure::Cancelled) => Err(self.cancelled()),
                    Err(Failure::Exhausted { cause, attempts }) => {
                        if !self.config.recover_on_failure() {
                            return Err(self.exhausted(cause, attempts));
                        }
                        let hook = step.clone();
                        let task = self.spawn_blocking(move || {
                            let outcome = hook.recover(input, &cause);
                            (cause, outcome)
                        });
                        match task.await {
                            Ok((cause, outcome)) => self.recovered(cause, attempts, outcome),
                            Err(e) => Err(ExecutionError::Aborted {
                                step: self.name(),
                                reason: e.to_string(),
                            }),
                        }
                    }
                }
            }
            Step::ManyToOne(_) => self.execute_batch(vec![input]).await,
            Step::OneToMany(_) | Step::ManyToMany(_) => Err(ExecutionError::Unsupported {
                step: self.name(),
                shape: self.step.shape(),
            }),
        }
    }

    /// Reduce a materialized batch through a many-to-one step.
    ///
    /// Every retry replays the whole batch; the recovery hook receives it too.
    pub async fn execute_batch(&self, batch: Vec<I>) -> ExecutionResult<O> {
        let Step::ManyToOne(step) = &self.step else {
            return Err(ExecutionError::Unsupported {
                step: self.name(),
                shape: self.step.shape(),
            });
        };

        let replay = batch.clone();
        let attempt = move || step.apply(stream::iter(replay.clone()).boxed());
        match self.retrying(attempt).await {
            Ok(output) => Ok(output),
            Err(Failure::Cancelled) => Err(self.cancelled()),
            Err(Failure::Exhausted { cause, attempts }) => {
                if !self.config.recover_on_failure() {
                    return Err(self.exhausted(cause, attempts));
                }
                let outcome = step.recover(batch, &cause).await;
                self.recovered(cause, attempts, outcome)
            }
        }
    }

    /// Open the output stream of a one-to-many step for one input.
    ///
    /// Opening is retried; elements failing afterwards surface in place as
    /// [`ExecutionError::ElementFailed`].
    pub async fn open(&self, input: I) -> BoxStream<'static, ExecutionResult<O>> {
        let Step::OneToMany(step) = &self.step else {
            let err = ExecutionError::Unsupported {
                step: self.name(),
                shape: self.step.shape(),
            };
            return stream::once(async move { Err(err) }).boxed();
        };

        let replay = input.clone();
        match self.retrying(move || step.apply(replay.clone())).await {
            Ok(elements) => {
                let name = self.name();
                elements
                    .map(move |element| {
                        element.map_err(|source| match source {
                            StepError::Cancelled => ExecutionError::Cancelled { step: name },
                            source => ExecutionError::ElementFailed { step: name, source },
                        })
                    })
                    .take_until(self.cancel.clone().cancelled_owned())
                    .boxed()
            }
            Err(Failure::Cancelled) => stream::iter([Err(self.cancelled())]).boxed(),
            Err(Failure::Exhausted { cause, attempts }) => {
                if !self.config.recover_on_failure() {
                    return stream::iter([Err(self.exhausted(cause, attempts))]).boxed();
                }
                let outcome = step.recover(input, &cause).await;
                match self.recovered(cause, attempts, outcome) {
                    Ok(outputs) => stream::iter(outputs.into_iter().map(Ok)).boxed(),
                    Err(e) => stream::iter([Err(e)]).boxed(),
                }
            }
        }
    }

    /// Stream inputs through a many-to-many step.
    ///
    /// The transform is never re-invoked; with `recover_on_failure` each
    /// failed element is offered to the recovery hook.
    pub fn transform(&self, inputs: BoxStream<'static, I>) -> BoxStream<'static, ExecutionResult<O>> {
        let Step::ManyToMany(step) = &self.step else {
            let err = ExecutionError::Unsupported {
                step: self.name(),
                shape: self.step.shape(),
            };
            return stream::once(async move { Err(err) }).boxed();
        };

        let this = self.clone();
        let hook = step.clone();
        step.apply(inputs)
            .then(move |element| {
                let this = this.clone();
                let hook = hook.clone();
                async move {
                    let cause = match element {
                        Ok(output) => return Ok(output),
                        Err(StepError::Cancelled) => return Err(this.cancelled()),
                        Err(cause) => cause,
                    };
                    if this.config.debug() {
                        debug!(step = this.name(), error = %cause, "Element failed");
                    }
                    if !this.config.recover_on_failure() {
                        return Err(ExecutionError::ElementFailed {
                            step: this.name(),
                            source: cause,
                        });
                    }
                    match hook.recover(&cause).await {
                        Some(Ok(output)) => Ok(output),
                        Some(Err(source)) => Err(ExecutionError::RecoveryFailed {
                            step: this.name(),
                            cause,
                            source,
                        }),
                        None => Err(ExecutionError::ElementFailed {
                            step: this.name(),
                            source: cause,
                        }),
                    }
                }
            })
            .take_until(self.cancel.clone().cancelled_owned())
            .boxed()
    }

    /// Process a stream of items according to the step's shape and config.
    pub fn run(&self, inputs: BoxStream<'static, I>) -> BoxStream<'static, ExecutionResult<O>> {
        match &self.step {
            Step::OneToOne(_) | Step::Blocking(_) => {
                self.schedule(inputs, |this, item| async move { this.execute(item).await }, Err)
            }
            Step::OneToMany(_) => {
                let opened = self.schedule(
                    inputs,
                    |this, item| async move { this.open(item).await },
                    |e| stream::iter([Err(e)]).boxed(),
                );
                if self.merges() {
                    opened.flatten_unordered(self.config.max_concurrency()).boxed()
                } else {
                    opened.flatten().boxed()
                }
            }
            Step::ManyToOne(_) => {
                let this = self.clone();
                self.windows(inputs)
                    .then(move |batch| {
                        let this = this.clone();
                        async move { this.execute_batch(batch).await }
                    })
                    .boxed()
            }
            Step::ManyToMany(_) => self.transform(inputs),
        }
    }

    /// Group many-to-one input into the windows the step reduces.
    ///
    /// Without a `batch_size` the whole upstream is one window. With one,
    /// each window closes when full or, if `batch_timeout` is set, when the
    /// timeout elapses with at least one item buffered.
    pub(crate) fn windows<T>(&self, inputs: BoxStream<'static, T>) -> BoxStream<'static, Vec<T>>
    where
        T: Send + 'static,
    {
        match (self.config.batch_size(), self.config.batch_timeout()) {
            (None, _) => stream::once(inputs.collect::<Vec<T>>()).boxed(),
            (Some(size), None) => inputs.chunks(size.max(1)).boxed(),
            (Some(size), Some(timeout)) => {
                tokio_stream::StreamExt::chunks_timeout(inputs, size.max(1), timeout).boxed()
            }
        }
    }

    /// Whether streamed outputs may interleave across inputs.
    pub(crate) fn merges(&self) -> bool {
        self.config.parallel() && self.config.concurrency_strategy() == ConcurrencyStrategy::Merge
    }

    /// Apply the concurrency mode to per-item work.
    ///
    /// Sequential mode awaits each item before pulling the next. Parallel
    /// mode spawns each item as a task, at most `max_concurrency` at once.
    pub(crate) fn schedule<T, R, F, Fut, A>(
        &self,
        inputs: BoxStream<'static, T>,
        work: F,
        on_abort: A,
    ) -> BoxStream<'static, R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Self, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        A: Fn(ExecutionError) -> R + Send + Sync + 'static,
    {
        let this = self.clone();
        if !self.config.parallel() {
            return inputs.then(move |item| work(this.clone(), item)).boxed();
        }

        let name = self.name();
        let limit = self.config.max_concurrency();
        let on_abort = Arc::new(on_abort);
        let tasks = inputs.map(move |item| {
            let handle = this.spawn(work(this.clone(), item));
            let on_abort = on_abort.clone();
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(step = name, error = %e, "Item task aborted");
                        on_abort(ExecutionError::Aborted {
                            step: name,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        });

        match self.config.concurrency_strategy() {
            ConcurrencyStrategy::Merge => tasks.buffer_unordered(limit).boxed(),
            ConcurrencyStrategy::Concatenate => tasks.buffered(limit).boxed(),
        }
    }

    /// Invoke `attempt` until it succeeds, the retry budget is spent, the
    /// classifier rejects the failure, or processing is cancelled.
    async fn retrying<T, F, Fut>(&self, mut attempt: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let name = self.name();
        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Failure::Cancelled);
            }
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Failure::Cancelled),
                outcome = attempt() => outcome,
            };

            let cause = match outcome {
                Ok(output) => {
                    if self.config.debug() {
                        debug!(step = name, attempt = attempts, "Attempt succeeded");
                    }
                    return Ok(output);
                }
                Err(StepError::Cancelled) => return Err(Failure::Cancelled),
                Err(cause) => cause,
            };

            if self.config.debug() {
                debug!(step = name, attempt = attempts, error = %cause, "Attempt failed");
            }

            if let Some(classify) = &self.classifier {
                if !classify(&cause) {
                    return Err(Failure::Exhausted { cause, attempts });
                }
            }

            let Some(delay) = self.policy.delay_for_attempt(attempts) else {
                return Err(Failure::Exhausted { cause, attempts });
            };

            if self.config.debug() {
                debug!(step = name, attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying");
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Failure::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn exhausted(&self, cause: StepError, attempts: u32) -> ExecutionError {
        let transient = self.classifier.as_ref().map(|classify| classify(&cause));
        warn!(step = self.name(), attempts, error = %cause, "Retries exhausted");
        ExecutionError::Exhausted {
            step: self.name(),
            attempts,
            transient,
            source: cause,
        }
    }

    fn recovered<T>(
        &self,
        cause: StepError,
        attempts: u32,
        outcome: Option<Result<T, StepError>>,
    ) -> ExecutionResult<T> {
        match outcome {
            Some(Ok(output)) => {
                if self.config.debug() {
                    debug!(step = self.name(), attempts, error = %cause, "Recovered failed item");
                }
                Ok(output)
            }
            Some(Err(source)) => {
                warn!(step = self.name(), error = %source, "Recovery failed");
                Err(ExecutionError::RecoveryFailed {
                    step: self.name(),
                    cause,
                    source,
                })
            }
            None => Err(self.exhausted(cause, attempts)),
        }
    }

    fn cancelled(&self) -> ExecutionError {
        ExecutionError::Cancelled { step: self.name() }
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(handle) => handle.spawn(future),
            None => tokio::spawn(future),
        }
    }

    fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match &self.runtime {
            Some(handle) => handle.spawn_blocking(f),
            None => tokio::task::spawn_blocking(f),
        }
    }
}

/// Run a single step over `inputs` outside of a chain.
pub fn run_step<I, O, S>(
    step: Step<I, O>,
    config: EffectiveConfig,
    inputs: S,
) -> BoxStream<'static, ExecutionResult<O>>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
    S: futures::Stream<Item = I> + Send + 'static,
{
    StepExecutor::new(step, config).run(inputs.boxed())
}
