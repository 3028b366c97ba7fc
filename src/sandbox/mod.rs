mod backends;
mod factory;
mod registry;
mod rpc;
mod traits;

pub use backends::{ProcessSpawner, TaskSpawner, TaskWorker, WorkerProcess};
pub use factory::{create_spawner, resolve_worker_binary, WORKER_BINARY};
pub use registry::SandboxRegistry;
pub use rpc::RpcChannel;
pub use traits::{ContextSpawner, ExecutionContext};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PyletError;

/// Language runtimes a sandbox can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = PyletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            _ => Err(PyletError::UnsupportedRuntime {
                runtime: s.to_string(),
            }),
        }
    }
}

/// A live sandbox: an id bound to one isolated execution context.
pub struct Sandbox {
    id: String,
    runtime: RuntimeKind,
    created_at: DateTime<Utc>,
    metadata: HashMap<String, String>,
    context: Arc<dyn ExecutionContext>,
}

impl Sandbox {
    pub fn new(
        id: String,
        runtime: RuntimeKind,
        metadata: HashMap<String, String>,
        context: Arc<dyn ExecutionContext>,
    ) -> Self {
        Self {
            id,
            runtime,
            created_at: Utc::now(),
            metadata,
            context,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .field("created_at", &self.created_at)
            .field("isolation", &self.context.kind())
            .finish()
    }
}

/// Result of running code (or refusing a command) in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub sandbox_id: String,
    pub provider: String,
    /// Wall-clock time of the round trip in milliseconds
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
}

/// Information about a sandbox instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub provider: String,
    pub runtime: RuntimeKind,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    /// Per-call bound on worker round trips, if any
    pub timeout_ms: Option<u64>,
    /// Isolation kind of the execution context
    pub isolation: String,
    pub metadata: HashMap<String, String>,
}
