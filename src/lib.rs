pub mod config;
pub mod error;
pub mod fs;
pub mod protocol;
pub mod provider;
pub mod sandbox;
pub mod worker;

pub use error::{PyletError, Result};
pub use provider::{CreateOptions, CreatedSandbox, PyletProvider, PROVIDER_NAME};
pub use sandbox::{ExecutionResult, RuntimeKind, Sandbox, SandboxInfo, SandboxStatus};
