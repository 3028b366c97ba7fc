use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ExecutionReport, WorkerRequest};

/// An isolated execution context reachable only through worker requests.
///
/// This trait abstracts how the worker is hosted, allowing a child process
/// or an in-process task to be used interchangeably.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Isolation kind (e.g., "process", "task")
    fn kind(&self) -> &str;

    /// Send one request and wait for its correlated reply
    async fn call(&self, request: &WorkerRequest) -> Result<ExecutionReport>;

    /// Stop the context. Work in flight is abandoned.
    async fn terminate(&self) -> Result<()>;
}

/// Creates fresh execution contexts for new sandboxes.
#[async_trait]
pub trait ContextSpawner: Send + Sync {
    async fn spawn(&self) -> Result<Arc<dyn ExecutionContext>>;
}
