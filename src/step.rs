//! Step shapes and error types.
//!
//! A [`Step`] is one of five cardinality shapes. Each shape is a trait with
//! exactly one invocation method plus an optional `recover` hook that the
//! executor consults after retries are exhausted.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a step invocation.
#[derive(Error, Debug)]
pub enum StepError {
    /// The step's logic (or the remote call behind it) failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// A blocking invocation panicked or was dropped by the blocking pool.
    #[error("blocking task failed: {0}")]
    Join(String),

    /// Processing was cancelled before the invocation completed.
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Wrap any error as a step failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    /// Create a step failure from a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(message))
    }

    /// Returns the underlying cause as `T`, if it is one.
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Failed(err) => err.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Returns true if this error represents cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The cardinality shape of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepShape {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
    BlockingOneToOne,
}

impl fmt::Display for StepShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OneToOne => "1:1",
            Self::OneToMany => "1:N",
            Self::ManyToOne => "N:1",
            Self::ManyToMany => "N:M",
            Self::BlockingOneToOne => "1:1 (blocking)",
        };
        f.write_str(s)
    }
}

/// One input, one asynchronous output.
#[async_trait]
pub trait OneToOne: Send + Sync {
    /// The input type this step accepts.
    type Input: Send + Clone + 'static;

    /// The output type this step produces.
    type Output: Send + 'static;

    /// The name of this step for logging.
    fn name(&self) -> &'static str;

    /// Transform one input.
    async fn apply(&self, input: Self::Input) -> Result<Self::Output, StepError>;

    /// Dead-letter hook, called once retries are exhausted and recovery is
    /// enabled. `None` means the step defines no hook.
    async fn recover(
        &self,
        input: Self::Input,
        cause: &StepError,
    ) -> Option<Result<Self::Output, StepError>> {
        let _ = (input, cause);
        None
    }
}

/// One input, an incrementally consumable stream of outputs.
#[async_trait]
pub trait OneToMany: Send + Sync {
    type Input: Send + Clone + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Open the output stream for one input.
    ///
    /// Failing here is retried; elements that fail after the stream is open
    /// are reported in place.
    async fn apply(
        &self,
        input: Self::Input,
    ) -> Result<BoxStream<'static, Result<Self::Output, StepError>>, StepError>;

    /// Dead-letter hook returning replacement outputs for the failed input.
    async fn recover(
        &self,
        input: Self::Input,
        cause: &StepError,
    ) -> Option<Result<Vec<Self::Output>, StepError>> {
        let _ = (input, cause);
        None
    }
}

/// A whole stream of inputs reduced to one output.
#[async_trait]
pub trait ManyToOne: Send + Sync {
    type Input: Send + Clone + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Reduce the complete input stream to a single output.
    async fn apply(
        &self,
        inputs: BoxStream<'static, Self::Input>,
    ) -> Result<Self::Output, StepError>;

    /// Dead-letter hook receiving the whole failed batch.
    async fn recover(
        &self,
        inputs: Vec<Self::Input>,
        cause: &StepError,
    ) -> Option<Result<Self::Output, StepError>> {
        let _ = (inputs, cause);
        None
    }
}

/// A streaming transform from many inputs to many outputs.
#[async_trait]
pub trait ManyToMany: Send + Sync {
    type Input: Send + Clone + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Transform the input stream without materializing it.
    fn apply(
        &self,
        inputs: BoxStream<'static, Self::Input>,
    ) -> BoxStream<'static, Result<Self::Output, StepError>>;

    /// Dead-letter hook for one failed output element. Streaming transforms
    /// have no per-element input, so only the cause is available.
    async fn recover(&self, cause: &StepError) -> Option<Result<Self::Output, StepError>> {
        let _ = cause;
        None
    }
}

/// A one-to-one step whose invocation blocks the calling thread.
///
/// The executor always runs it on the blocking pool.
pub trait BlockingOneToOne: Send + Sync + 'static {
    type Input: Send + Clone + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn apply(&self, input: Self::Input) -> Result<Self::Output, StepError>;

    fn recover(
        &self,
        input: Self::Input,
        cause: &StepError,
    ) -> Option<Result<Self::Output, StepError>> {
        let _ = (input, cause);
        None
    }
}

/// A unit of pipeline work: one of the five shapes.
///
/// Cloning is cheap; every variant shares its implementation through an `Arc`.
pub enum Step<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    OneToOne(Arc<dyn OneToOne<Input = I, Output = O>>),
    OneToMany(Arc<dyn OneToMany<Input = I, Output = O>>),
    ManyToOne(Arc<dyn ManyToOne<Input = I, Output = O>>),
    ManyToMany(Arc<dyn ManyToMany<Input = I, Output = O>>),
    Blocking(Arc<dyn BlockingOneToOne<Input = I, Output = O>>),
}

impl<I, O> Clone for Step<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::OneToOne(s) => Self::OneToOne(s.clone()),
            Self::OneToMany(s) => Self::OneToMany(s.clone()),
            Self::ManyToOne(s) => Self::ManyToOne(s.clone()),
            Self::ManyToMany(s) => Self::ManyToMany(s.clone()),
            Self::Blocking(s) => Self::Blocking(s.clone()),
        }
    }
}

impl<I, O> Step<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    pub fn one_to_one<S>(step: S) -> Self
    where
        S: OneToOne<Input = I, Output = O> + 'static,
    {
        Self::OneToOne(Arc::new(step))
    }

    pub fn one_to_many<S>(step: S) -> Self
    where
        S: OneToMany<Input = I, Output = O> + 'static,
    {
        Self::OneToMany(Arc::new(step))
    }

    pub fn many_to_one<S>(step: S) -> Self
    where
        S: ManyToOne<Input = I, Output = O> + 'static,
    {
        Self::ManyToOne(Arc::new(step))
    }

    pub fn many_to_many<S>(step: S) -> Self
    where
        S: ManyToMany<Input = I, Output = O> + 'static,
    {
        Self::ManyToMany(Arc::new(step))
    }

    pub fn blocking<S>(step: S) -> Self
    where
        S: BlockingOneToOne<Input = I, Output = O>,
    {
        Self::Blocking(Arc::new(step))
    }

    /// The name of the wrapped step.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OneToOne(s) => s.name(),
            Self::OneToMany(s) => s.name(),
            Self::ManyToOne(s) => s.name(),
            Self::ManyToMany(s) => s.name(),
            Self::Blocking(s) => s.name(),
        }
    }

    /// The cardinality shape of the wrapped step.
    pub fn shape(&self) -> StepShape {
        match self {
            Self::OneToOne(_) => StepShape::OneToOne,
            Self::OneToMany(_) => StepShape::OneToMany,
            Self::ManyToOne(_) => StepShape::ManyToOne,
            Self::ManyToMany(_) => StepShape::ManyToMany,
            Self::Blocking(_) => StepShape::BlockingOneToOne,
        }
    }
}

impl<I, O> fmt::Debug for Step<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("shape", &self.shape())
            .finish()
    }
}

type AsyncFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, StepError>> + Send + Sync>;
type RecoverFn<I, O> = Arc<dyn Fn(I, &StepError) -> Result<O, StepError> + Send + Sync>;
type BlockingFn<I, O> = Arc<dyn Fn(I) -> Result<O, StepError> + Send + Sync>;

/// A one-to-one step backed by an async closure.
pub struct FnStep<I, O> {
    name: &'static str,
    apply: AsyncFn<I, O>,
    recover: Option<RecoverFn<I, O>>,
}

impl<I, O> FnStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StepError>> + Send + 'static,
    {
        Self {
            name,
            apply: Arc::new(move |input| Box::pin(f(input))),
            recover: None,
        }
    }

    /// Attach a dead-letter hook.
    pub fn with_recovery<R>(mut self, recover: R) -> Self
    where
        R: Fn(I, &StepError) -> Result<O, StepError> + Send + Sync + 'static,
    {
        self.recover = Some(Arc::new(recover));
        self
    }

    /// Wrap into a [`Step`].
    pub fn into_step(self) -> Step<I, O> {
        Step::one_to_one(self)
    }
}

#[async_trait]
impl<I, O> OneToOne for FnStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn apply(&self, input: I) -> Result<O, StepError> {
        (self.apply)(input).await
    }

    async fn recover(&self, input: I, cause: &StepError) -> Option<Result<O, StepError>> {
        self.recover.as_ref().map(|f| f(input, cause))
    }
}

/// A blocking one-to-one step backed by a plain closure.
pub struct BlockingFnStep<I, O> {
    name: &'static str,
    apply: BlockingFn<I, O>,
    recover: Option<RecoverFn<I, O>>,
}

impl<I, O> BlockingFnStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(I) -> Result<O, StepError> + Send + Sync + 'static,
    {
        Self {
            name,
            apply: Arc::new(f),
            recover: None,
        }
    }

    pub fn with_recovery<R>(mut self, recover: R) -> Self
    where
        R: Fn(I, &StepError) -> Result<O, StepError> + Send + Sync + 'static,
    {
        self.recover = Some(Arc::new(recover));
        self
    }

    pub fn into_step(self) -> Step<I, O> {
        Step::blocking(self)
    }
}

impl<I, O> BlockingOneToOne for BlockingFnStep<I, O>
where
    I: Send + Clone + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, input: I) -> Result<O, StepError> {
        (self.apply)(input)
    }

    fn recover(&self, input: I, cause: &StepError) -> Option<Result<O, StepError>> {
        self.recover.as_ref().map(|f| f(input, cause))
    }
}
