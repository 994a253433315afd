//! Handler contract.
//!
//! A handler is an async function of a `JobContext` returning
//! `Result<(), HandlerError>`. It must watch the context's cancellation
//! token and return promptly once it fires; the scheduler cancels on
//! timeout and on shutdown, and aborts handlers that ignore it.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::Trigger;

/// Error returned by a handler, classified by the handler itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the retry policy decides whether to try again
    #[error("{0}")]
    Retryable(String),

    /// The handler asks not to be retried
    #[error("{0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Retryable(err.to_string())
    }
}

/// Per-attempt context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_name: String,
    execution_id: Ulid,
    attempt: u32,
    scheduled_at: DateTime<Utc>,
    trigger: Trigger,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job_name: &str,
        execution_id: Ulid,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_name: job_name.to_string(),
            execution_id,
            attempt,
            scheduled_at,
            trigger,
            cancel,
        }
    }

    /// A context outside any scheduler, for invoking handlers directly
    /// (tests, one-off runs from a CLI).
    pub fn detached(job_name: &str, cancel: CancellationToken) -> Self {
        Self::new(job_name, Ulid::new(), 1, Utc::now(), Trigger::Manual, cancel)
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn execution_id(&self) -> Ulid {
        self.execution_id
    }

    /// 1-based attempt number within the current firing.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled (timeout or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Work performed when a job fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a `JobHandler`.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler.
///
/// ```ignore
/// let handler = handler_fn(|ctx: JobContext| async move {
///     tracing::info!(job = %ctx.job_name(), "tick");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn execute(&self, ctx: JobContext) -> Result<(), HandlerError> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_handler_error_classification() {
        assert!(HandlerError::retryable("timeout talking to db").is_retryable());
        assert!(!HandlerError::fatal("bad input").is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(HandlerError::from(io).is_retryable());
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |ctx: JobContext| {
            let counter = counter.clone();
            async move {
                assert_eq!(ctx.job_name(), "report");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let ctx = JobContext::detached("report", CancellationToken::new());
        handler.execute(ctx.clone()).await.unwrap();
        handler.execute(ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = JobContext::detached("report", token.clone());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.trigger(), Trigger::Manual);

        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
