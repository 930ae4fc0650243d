//! Job handler contract.

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use taskhub_core::JobId;

use crate::repository::RepositoryError;

/// What a handler sees of the job it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl JobContext {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// A handler failure. Retryable unless built with [`permanent`](Self::permanent).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure retrying cannot fix; the job fails without using its retry budget.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<RepositoryError> for HandlerError {
    fn from(err: RepositoryError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("invalid job arguments: {err}"))
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// Callable bound to a handler name.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::StoreError;
    use serde_json::json;

    #[tokio::test]
    async fn closures_adapt_to_handlers() {
        let handler = handler_fn(|ctx: JobContext| async move {
            let n = ctx.arg(0).and_then(Value::as_i64).ok_or("missing argument")?;
            Ok::<_, HandlerError>(json!(n * 2))
        });

        let ctx = JobContext {
            job_id: JobId::new(),
            name: "double".to_string(),
            attempt: 1,
            args: vec![json!(21)],
            kwargs: Map::new(),
        };
        assert_eq!(handler.handle(ctx.clone()).await, Ok(json!(42)));

        let empty = JobContext { args: Vec::new(), ..ctx };
        let err = handler.handle(empty).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "missing argument");
    }

    #[test]
    fn repository_errors_keep_their_classification() {
        let transient: HandlerError = RepositoryError::from(StoreError::Timeout("t".into())).into();
        assert!(transient.is_retryable());

        let missing: HandlerError = RepositoryError::not_found("tasks", "x").into();
        assert!(!missing.is_retryable());
        assert!(!HandlerError::permanent("bad input").is_retryable());
    }
}
