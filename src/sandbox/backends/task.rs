use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{ExecutionReport, WorkerRequest};
use crate::sandbox::rpc::RpcChannel;
use crate::sandbox::traits::{ContextSpawner, ExecutionContext};
use crate::worker::{self, InterpreterLoader, PythonRuntime};

/// Size of the in-memory pipe between host and worker task.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Worker hosted on a tokio task behind an in-memory byte pipe.
///
/// The task shares no state with the host: it owns its runtime and is
/// reached only through the same line protocol a worker process speaks.
pub struct TaskWorker {
    channel: RpcChannel,
    task: JoinHandle<()>,
}

impl TaskWorker {
    pub fn spawn(
        loader: Arc<dyn InterpreterLoader>,
        index_url: String,
        timeout: Option<Duration>,
    ) -> Self {
        let (host, guest) = tokio::io::duplex(PIPE_CAPACITY);
        let (guest_read, guest_write) = tokio::io::split(guest);
        let runtime = PythonRuntime::new(loader, index_url);

        let task = tokio::spawn(async move {
            if let Err(e) = worker::serve(guest_read, guest_write, runtime).await {
                warn!(error = %e, "Worker task stopped");
            }
        });

        let (host_read, host_write) = tokio::io::split(host);
        Self {
            channel: RpcChannel::new(host_read, host_write, timeout),
            task,
        }
    }
}

#[async_trait]
impl ExecutionContext for TaskWorker {
    fn kind(&self) -> &str {
        "task"
    }

    async fn call(&self, request: &WorkerRequest) -> Result<ExecutionReport> {
        self.channel.call(request).await
    }

    async fn terminate(&self) -> Result<()> {
        debug!("Aborting worker task");
        self.task.abort();
        Ok(())
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns [`TaskWorker`]s sharing one interpreter loader.
pub struct TaskSpawner {
    loader: Arc<dyn InterpreterLoader>,
    index_url: String,
    timeout: Option<Duration>,
}

impl TaskSpawner {
    pub fn new(
        loader: Arc<dyn InterpreterLoader>,
        index_url: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            loader,
            index_url: index_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ContextSpawner for TaskSpawner {
    async fn spawn(&self) -> Result<Arc<dyn ExecutionContext>> {
        let worker = TaskWorker::spawn(Arc::clone(&self.loader), self.index_url.clone(), self.timeout);
        Ok(Arc::new(worker))
    }
}
