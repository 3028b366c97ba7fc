use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::protocol::ExecutionReport;
use crate::worker::interpreter::{Interpreter, InterpreterLoader};

/// Trivial statement run by `init` to prove the runtime answers.
pub const PROBE_SOURCE: &str = "import sys";

type Loaded = std::result::Result<Mutex<Box<dyn Interpreter>>, String>;

/// Lazily loaded Python runtime owned by one worker.
///
/// The runtime moves from uninitialized to ready exactly once, on the first
/// `init` or `run_code`. Concurrent first callers share a single load, and a
/// failed load is remembered: every later call reports the same error.
pub struct PythonRuntime {
    loader: Arc<dyn InterpreterLoader>,
    default_index_url: String,
    index_url: StdMutex<Option<String>>,
    loaded: OnceCell<Loaded>,
}

impl PythonRuntime {
    pub fn new(loader: Arc<dyn InterpreterLoader>, default_index_url: impl Into<String>) -> Self {
        Self {
            loader,
            default_index_url: default_index_url.into(),
            index_url: StdMutex::new(None),
            loaded: OnceCell::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.loaded.get(), Some(Ok(_)))
    }

    /// Establish the loading location, load the runtime and run the probe.
    pub async fn init(&self, index_url: Option<String>) -> ExecutionReport {
        if let Some(url) = index_url {
            if self.loaded.initialized() {
                debug!(index_url = %url, "Runtime already loaded, ignoring index URL");
            } else {
                *self.index_url.lock().unwrap_or_else(PoisonError::into_inner) = Some(url);
            }
        }

        self.execute(PROBE_SOURCE).await
    }

    pub async fn run_code(&self, source: &str) -> ExecutionReport {
        self.execute(source).await
    }

    async fn execute(&self, source: &str) -> ExecutionReport {
        let interpreter = match self.ready().await {
            Ok(interpreter) => interpreter,
            Err(message) => return ExecutionReport::failed(message),
        };

        let mut interpreter = interpreter.lock().await;
        match interpreter.run(source).await {
            Ok(run) => {
                debug!(exit_code = run.exit_code, "Program finished");
                ExecutionReport::completed(run.exit_code, run.stdout, run.stderr)
            }
            Err(e) => {
                warn!(error = %e, "Interpreter unreachable");
                ExecutionReport::failed(e.to_string())
            }
        }
    }

    async fn ready(&self) -> std::result::Result<&Mutex<Box<dyn Interpreter>>, String> {
        self.loaded
            .get_or_init(|| self.load())
            .await
            .as_ref()
            .map_err(Clone::clone)
    }

    async fn load(&self) -> Loaded {
        let index_url = self
            .index_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.default_index_url.clone());

        info!(index_url = %index_url, "Loading Python runtime");

        let interpreter = match self.loader.load_primary(&index_url).await {
            Ok(interpreter) => interpreter,
            Err(primary) => {
                warn!(index_url = %index_url, error = %primary, "Primary runtime location failed, trying fallback");
                self.loader.load_fallback().await.map_err(|fallback| {
                    format!("{} (index URL {}); fallback: {}", primary, index_url, fallback)
                })?
            }
        };

        info!(version = %interpreter.version(), "Python runtime ready");
        Ok(Mutex::new(interpreter))
    }
}
