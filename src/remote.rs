//! Remote calls and their failure taxonomy.
//!
//! The core never interprets a transport's wire format. A remote service is
//! any [`RemoteInvoker`]; failures come back as a [`RemoteError`] carrying a
//! transport-neutral [`StatusCode`], which [`is_throttling`] classifies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

use crate::executor::TransienceClassifier;
use crate::step::{OneToOne, Step, StepError};

/// Status of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Whether the remote side is asking the caller to back off.
    pub fn is_throttling(self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::Unavailable | Self::Aborted
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "remote call failed with {code}{}",
    .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
)]
pub struct RemoteError {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl RemoteError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// An error with a status code but no description.
    pub fn bare(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Connection-level failures arrive as `Unknown` with no description;
    /// report them as `Unavailable`.
    pub fn normalized(self) -> Self {
        match (self.code, &self.message) {
            (StatusCode::Unknown, None) => Self {
                code: StatusCode::Unavailable,
                message: None,
            },
            _ => self,
        }
    }

    pub fn is_throttling(&self) -> bool {
        self.clone().normalized().code.is_throttling()
    }
}

/// Default transience classifier: only throttling remote errors are
/// transient.
pub fn is_throttling(err: &StepError) -> bool {
    err.downcast_ref::<RemoteError>()
        .is_some_and(RemoteError::is_throttling)
}

/// [`is_throttling`] as a shareable classifier.
pub fn throttling_classifier() -> TransienceClassifier {
    Arc::new(is_throttling)
}

/// An asynchronous remote call.
#[async_trait]
pub trait RemoteInvoker<Req, Resp>: Send + Sync {
    async fn invoke(&self, request: Req) -> Result<Resp, RemoteError>;
}

#[async_trait]
impl<Req, Resp, F, Fut> RemoteInvoker<Req, Resp> for F
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, RemoteError>> + Send + 'static,
{
    async fn invoke(&self, request: Req) -> Result<Resp, RemoteError> {
        (self)(request).await
    }
}

/// A one-to-one step whose work is a single remote call.
pub struct RemoteStep<Req, Resp> {
    name: &'static str,
    invoker: Arc<dyn RemoteInvoker<Req, Resp>>,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> RemoteStep<Req, Resp>
where
    Req: Send + Clone + 'static,
    Resp: Send + 'static,
{
    pub fn new<R>(name: &'static str, invoker: R) -> Self
    where
        R: RemoteInvoker<Req, Resp> + 'static,
    {
        Self {
            name,
            invoker: Arc::new(invoker),
            _phantom: PhantomData,
        }
    }

    pub fn into_step(self) -> Step<Req, Resp> {
        Step::one_to_one(self)
    }
}

#[async_trait]
impl<Req, Resp> OneToOne for RemoteStep<Req, Resp>
where
    Req: Send + Clone + 'static,
    Resp: Send + 'static,
{
    type Input = Req;
    type Output = Resp;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn apply(&self, input: Req) -> Result<Resp, StepError> {
        self.invoker
            .invoke(input)
            .await
            .map_err(|e| StepError::failed(e.normalized()))
    }
}
