use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::config::types::{Isolation, PyletConfig};
use crate::error::{PyletError, Result};
use crate::sandbox::backends::{ProcessSpawner, TaskSpawner};
use crate::sandbox::traits::ContextSpawner;
use crate::worker::{ProcessLoader, DEFAULT_INDEX_URL};

/// Name of the worker executable.
pub const WORKER_BINARY: &str = "pylet-worker";

/// Create a context spawner based on the configuration.
///
/// Process isolation needs the worker binary; task isolation runs the worker
/// loop inside this process and loads interpreters directly.
pub fn create_spawner(config: &PyletConfig) -> Result<Arc<dyn ContextSpawner>> {
    let timeout = config.sandbox.rpc_timeout();

    match config.worker.isolation {
        Isolation::Process => {
            let binary = resolve_worker_binary(config.worker.binary.as_deref())?;
            debug!(binary = %binary.display(), "Using worker process isolation");
            Ok(Arc::new(ProcessSpawner::new(
                binary,
                config.worker.index_url.clone(),
                timeout,
            )))
        }
        Isolation::Task => {
            let index_url = config
                .worker
                .index_url
                .clone()
                .unwrap_or_else(|| DEFAULT_INDEX_URL.to_string());
            debug!(index_url = %index_url, "Using worker task isolation");
            Ok(Arc::new(TaskSpawner::new(
                Arc::new(ProcessLoader),
                index_url,
                timeout,
            )))
        }
    }
}

/// Locate the worker binary.
///
/// Checks in order:
/// 1. The configured path
/// 2. Next to the current executable (and its parent, for test harnesses)
/// 3. System PATH
pub fn resolve_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(PyletError::SandboxInit(format!(
            "Worker binary not found: {}",
            path.display()
        )));
    }

    let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);

    if let Ok(exe) = std::env::current_exe() {
        let candidates = exe
            .ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&file_name));
        for candidate in candidates {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    which::which(&file_name).map_err(|_| {
        PyletError::SandboxInit(format!(
            "{} not found next to the executable or on PATH; set worker.binary",
            WORKER_BINARY
        ))
    })
}
