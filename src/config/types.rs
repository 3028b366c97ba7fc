use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PyletConfig {
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
    pub filesystem: FilesystemConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Runtime requested when `create` does not name one
    pub runtime: String,
    /// Bound on every worker round trip in seconds (0 waits forever)
    pub rpc_timeout_seconds: u64,
}

impl SandboxConfig {
    pub fn rpc_timeout(&self) -> Option<Duration> {
        match self.rpc_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "python".to_string(),
            rpc_timeout_seconds: 300,
        }
    }
}

/// How a sandbox's worker is hosted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// `pylet-worker` child process
    #[default]
    Process,
    /// In-process tokio task behind an in-memory pipe
    Task,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub isolation: Isolation,
    /// Path to the `pylet-worker` binary (auto-detected if not set)
    pub binary: Option<PathBuf>,
    /// Base location the Python runtime is loaded from
    pub index_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Directory backing the virtual filesystem (defaults to the data dir)
    pub root: Option<PathBuf>,
}
