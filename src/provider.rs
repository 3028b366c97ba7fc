//! Sandbox provider: lifecycle, code execution and file access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::loader::get_data_dir;
use crate::config::types::PyletConfig;
use crate::error::{PyletError, Result};
use crate::fs::{DiskVfs, FilesystemFacade, VirtualFs};
use crate::protocol::{ExecutionReport, WorkerRequest};
use crate::sandbox::{
    create_spawner, ContextSpawner, ExecutionResult, RuntimeKind, Sandbox, SandboxInfo,
    SandboxRegistry, SandboxStatus,
};

/// Name reported in results and sandbox info.
pub const PROVIDER_NAME: &str = "pylet";

/// Exit code reported for shell commands, which no sandbox can run.
pub const COMMAND_NOT_SUPPORTED: i32 = 127;

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Runtime kind; the configured default when unset
    pub runtime: Option<String>,
    /// Caller-chosen id; a fresh one is generated when unset
    pub sandbox_id: Option<String>,
    /// Location the Python runtime is loaded from
    pub index_url: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatedSandbox {
    pub sandbox: Arc<Sandbox>,
    pub sandbox_id: String,
}

pub struct PyletProvider {
    config: PyletConfig,
    spawner: Arc<dyn ContextSpawner>,
    registry: SandboxRegistry,
    filesystem: FilesystemFacade,
}

impl PyletProvider {
    pub fn new(config: PyletConfig, spawner: Arc<dyn ContextSpawner>, vfs: Arc<dyn VirtualFs>) -> Self {
        Self {
            config,
            spawner,
            registry: SandboxRegistry::new(),
            filesystem: FilesystemFacade::new(vfs),
        }
    }

    /// Build a provider with the configured isolation and a disk-backed
    /// filesystem.
    pub fn from_config(config: PyletConfig) -> Result<Self> {
        let spawner = create_spawner(&config)?;
        let root = config
            .filesystem
            .root
            .clone()
            .unwrap_or_else(|| get_data_dir().join("fs"));
        let vfs = DiskVfs::new(root)?;

        Ok(Self::new(config, spawner, Arc::new(vfs)))
    }

    pub fn config(&self) -> &PyletConfig {
        &self.config
    }

    /// Create a sandbox and bring its runtime up.
    pub async fn create(&self, options: CreateOptions) -> Result<CreatedSandbox> {
        let runtime: RuntimeKind = options
            .runtime
            .as_deref()
            .unwrap_or(&self.config.sandbox.runtime)
            .parse()?;

        if let Some(id) = &options.sandbox_id {
            if self.registry.contains(id) {
                return Err(PyletError::SandboxExists { id: id.clone() });
            }
        }

        let sandbox_id = options
            .sandbox_id
            .clone()
            .unwrap_or_else(|| format!("pylet-{}", uuid::Uuid::new_v4()));

        let context = self.spawner.spawn().await?;
        debug!(sandbox_id = %sandbox_id, isolation = context.kind(), "Spawned execution context");

        let index_url = options
            .index_url
            .clone()
            .or_else(|| self.config.worker.index_url.clone());

        let probe = match context.call(&WorkerRequest::Init { index_url }).await {
            Ok(report) if report.ok => Ok(()),
            Ok(report) => Err(PyletError::SandboxInit(describe_failure(&report))),
            Err(e) => Err(PyletError::SandboxInit(e.to_string())),
        };

        if let Err(e) = probe {
            if let Err(term) = context.terminate().await {
                warn!(sandbox_id = %sandbox_id, error = %term, "Failed to stop context after init failure");
            }
            return Err(e);
        }

        // Another create may have claimed the id while this one was initializing.
        if self.registry.contains(&sandbox_id) {
            if let Err(term) = context.terminate().await {
                warn!(sandbox_id = %sandbox_id, error = %term, "Failed to stop context for duplicate sandbox");
            }
            return Err(PyletError::SandboxExists { id: sandbox_id });
        }

        let sandbox = Arc::new(Sandbox::new(
            sandbox_id.clone(),
            runtime,
            options.metadata,
            context,
        ));
        self.registry.insert(Arc::clone(&sandbox));

        info!(sandbox_id = %sandbox_id, runtime = %runtime, "Sandbox created");
        Ok(CreatedSandbox {
            sandbox,
            sandbox_id,
        })
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.registry.get(id)
    }

    /// Live sandboxes in creation order.
    pub fn list(&self) -> Vec<Arc<Sandbox>> {
        self.registry.list()
    }

    /// Forget a sandbox and stop its context. Returns whether it existed.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(sandbox) = self.registry.remove(id) else {
            debug!(sandbox_id = %id, "Destroy requested for unknown sandbox");
            return false;
        };

        if let Err(e) = sandbox.context().terminate().await {
            warn!(sandbox_id = %id, error = %e, "Failed to terminate sandbox context");
        }

        info!(sandbox_id = %id, "Sandbox destroyed");
        true
    }

    /// Execute Python source in the sandbox.
    ///
    /// Anything the worker reports, including a runtime that failed to load,
    /// comes back as a result. Only a lost or silent worker is an error.
    pub async fn run_code(&self, sandbox: &Sandbox, code: &str) -> Result<ExecutionResult> {
        let started = Instant::now();
        let report = sandbox
            .context()
            .call(&WorkerRequest::RunCode {
                code: code.to_string(),
            })
            .await?;
        let elapsed = started.elapsed();

        debug!(
            sandbox_id = %sandbox.id(),
            exit_code = report.exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "Code executed"
        );

        let ExecutionReport {
            exit_code,
            stdout,
            mut stderr,
            error,
            ..
        } = report;

        if let Some(error) = error {
            if stderr.is_empty() {
                stderr = error;
            }
        }

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            sandbox_id: sandbox.id().to_string(),
            provider: PROVIDER_NAME.to_string(),
            execution_time_ms: elapsed.as_millis() as u64,
        })
    }

    /// Sandboxes have no shell; every command is refused.
    pub async fn run_command(&self, sandbox: &Sandbox, command: &str, args: &[String]) -> ExecutionResult {
        debug!(sandbox_id = %sandbox.id(), command = %command, args = ?args, "Refusing shell command");

        ExecutionResult {
            exit_code: COMMAND_NOT_SUPPORTED,
            stdout: String::new(),
            stderr: "Shell commands are not supported in this sandbox; use run_code instead"
                .to_string(),
            sandbox_id: sandbox.id().to_string(),
            provider: PROVIDER_NAME.to_string(),
            execution_time_ms: 0,
        }
    }

    pub fn get_info(&self, sandbox: &Sandbox) -> SandboxInfo {
        let status = if self.registry.contains(sandbox.id()) {
            SandboxStatus::Running
        } else {
            SandboxStatus::Stopped
        };

        SandboxInfo {
            id: sandbox.id().to_string(),
            provider: PROVIDER_NAME.to_string(),
            runtime: sandbox.runtime(),
            status,
            created_at: sandbox.created_at(),
            timeout_ms: self
                .config
                .sandbox
                .rpc_timeout()
                .map(|t| t.as_millis() as u64),
            isolation: sandbox.context().kind().to_string(),
            metadata: sandbox.metadata().clone(),
        }
    }

    /// Sandboxes expose no network ports.
    pub fn get_url(&self, _sandbox: &Sandbox, _port: u16) -> Option<String> {
        None
    }

    pub fn filesystem(&self) -> &FilesystemFacade {
        &self.filesystem
    }
}

fn describe_failure(report: &ExecutionReport) -> String {
    if let Some(error) = &report.error {
        return error.clone();
    }
    let stderr = report.stderr.trim();
    if stderr.is_empty() {
        format!("runtime probe exited with code {}", report.exit_code)
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_failure_prefers_error_text() {
        let report = ExecutionReport::failed("no python here");
        assert_eq!(describe_failure(&report), "no python here");

        let report = ExecutionReport::completed(2, String::new(), "boom\n".to_string());
        assert_eq!(describe_failure(&report), "boom");

        let report = ExecutionReport::completed(4, String::new(), String::new());
        assert_eq!(describe_failure(&report), "runtime probe exited with code 4");
    }
}
