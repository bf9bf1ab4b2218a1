//! Executor port: the side-effecting delivery itself.
//!
//! The scheduler is agnostic to how delivery happens. It only looks at whether
//! the call succeeded and, on failure, at the error text to decide on a retry.

use async_trait::async_trait;

use crate::domain::{ExecutionReport, Task};

/// Raised delivery failures.
///
/// The display strings of `Timeout` and `Unavailable` line up with entries in
/// the default retryable-error list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("network timeout: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<ExecutionReport, ExecutorError>;
}
