use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PyletError, Result};
use crate::protocol::{ExecutionReport, WorkerRequest};
use crate::sandbox::rpc::RpcChannel;
use crate::sandbox::traits::{ContextSpawner, ExecutionContext};

/// Worker hosted in a `pylet-worker` child process.
///
/// Requests go to the child's stdin and replies come back on its stdout.
/// The child is killed on `terminate` or when this is dropped.
pub struct WorkerProcess {
    channel: RpcChannel,
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl WorkerProcess {
    pub async fn spawn(
        binary: &Path,
        index_url: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut cmd = Command::new(binary);
        if let Some(url) = index_url {
            cmd.arg("--index-url").arg(url);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PyletError::SandboxInit(format!(
                "Failed to start worker {}: {}",
                binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PyletError::SandboxInit("Worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PyletError::SandboxInit("Worker stdout unavailable".to_string()))?;

        let pid = child.id();
        info!(pid = ?pid, binary = %binary.display(), "Worker process started");

        Ok(Self {
            channel: RpcChannel::new(stdout, stdin, timeout),
            child: Mutex::new(child),
            pid,
        })
    }
}

#[async_trait]
impl ExecutionContext for WorkerProcess {
    fn kind(&self) -> &str {
        "process"
    }

    async fn call(&self, request: &WorkerRequest) -> Result<ExecutionReport> {
        self.channel.call(request).await
    }

    async fn terminate(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        debug!(pid = ?self.pid, "Killing worker process");
        child.kill().await?;
        Ok(())
    }
}

/// Spawns [`WorkerProcess`]es from a resolved worker binary.
pub struct ProcessSpawner {
    binary: PathBuf,
    index_url: Option<String>,
    timeout: Option<Duration>,
}

impl ProcessSpawner {
    pub fn new(binary: PathBuf, index_url: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            index_url,
            timeout,
        }
    }
}

#[async_trait]
impl ContextSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<Arc<dyn ExecutionContext>> {
        let worker =
            WorkerProcess::spawn(&self.binary, self.index_url.as_deref(), self.timeout).await?;
        Ok(Arc::new(worker))
    }
}
