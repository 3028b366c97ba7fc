use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Sandbox errors
    #[error("Unsupported runtime '{runtime}' (only 'python' is available)")]
    UnsupportedRuntime { runtime: String },

    #[error("Sandbox already exists: {id}")]
    SandboxExists { id: String },

    #[error("Sandbox initialization failed: {0}")]
    SandboxInit(String),

    // Interpreter errors (inside the worker)
    #[error("Failed to load Python runtime: {0}")]
    InterpreterLoad(String),

    #[error("Python interpreter failure: {0}")]
    Interpreter(String),

    // Worker channel errors
    #[error("Worker did not reply within {millis} ms")]
    RpcTimeout { millis: u64 },

    #[error("Worker channel closed before a reply arrived")]
    WorkerClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Filesystem errors
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Invalid watch pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PyletError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RpcTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PyletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(PyletError::RpcTimeout { millis: 10 }.is_retryable());
        assert!(!PyletError::WorkerClosed.is_retryable());
        assert!(!PyletError::UnsupportedRuntime {
            runtime: "node".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = PyletError::UnsupportedRuntime {
            runtime: "node".to_string(),
        };
        assert!(err.to_string().contains("node"));
        assert_eq!(
            PyletError::RpcTimeout { millis: 250 }.to_string(),
            "Worker did not reply within 250 ms"
        );
    }
}
