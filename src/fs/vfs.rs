use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Change record as published by a filesystem service.
///
/// Services are only loosely typed, so every field is optional here; the
/// facade decides which records are well formed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFsEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

impl RawFsEvent {
    pub fn single(kind: &str, path: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    pub fn rename(from: &str, to: &str) -> Self {
        Self {
            kind: Some("rename".to_string()),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Include events below subdirectories, not just direct children
    pub recursive: bool,
    /// Glob patterns (`*`, `**`, `?`); empty means everything
    pub include: Vec<String>,
}

/// Virtual filesystem service backing a provider's file operations.
///
/// Paths handed to a service are always absolute (`/`-prefixed). Directory
/// listings and metadata are loosely typed JSON records.
#[async_trait]
pub trait VirtualFs: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// Entries such as `{"name": "a.txt", "isDirectory": false, "size": 1, "mtime": 1700000000000}`
    async fn read_dir(&self, path: &str) -> Result<Vec<Value>>;

    async fn stat(&self, path: &str) -> Result<Value>;

    async fn remove(&self, path: &str, recursive: bool) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Register interest in changes below `path`.
    async fn watch(&self, path: &str, options: &WatchOptions) -> Result<()>;

    /// Broadcast channel carrying every change the service observes.
    fn subscribe(&self) -> broadcast::Receiver<RawFsEvent>;
}
