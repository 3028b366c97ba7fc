use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{PyletError, Result};
use crate::fs::normalize_path;
use crate::fs::vfs::{RawFsEvent, VirtualFs, WatchOptions};

/// Capacity of the change broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Virtual filesystem persisted under a host directory.
///
/// Virtual `/` maps to the root directory; `..` components are rejected so
/// no path can leave it. Every mutation is published on the change channel.
pub struct DiskVfs {
    root: PathBuf,
    events: broadcast::Sender<RawFsEvent>,
}

impl DiskVfs {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Opened virtual filesystem");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { root, events })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let virtual_path = normalize_path(path);
        let mut resolved = self.root.clone();

        for component in Path::new(&virtual_path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(PyletError::InvalidPath {
                        path: path.to_string(),
                    })
                }
            }
        }

        Ok(resolved)
    }

    fn publish(&self, event: RawFsEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn describe(metadata: &std::fs::Metadata) -> Value {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64);

    json!({
        "isDirectory": metadata.is_dir(),
        "size": metadata.len(),
        "mtime": mtime,
    })
}

#[async_trait]
impl VirtualFs for DiskVfs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)?).await?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        let existed = fs::try_exists(&target).await?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, data).await?;

        debug!(path = %path, bytes = data.len(), "Wrote file");
        let kind = if existed { "modify" } else { "create" };
        self.publish(RawFsEvent::single(kind, &normalize_path(path)));
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        let existed = fs::try_exists(&target).await?;

        if recursive {
            fs::create_dir_all(&target).await?;
        } else {
            fs::create_dir(&target).await?;
        }

        if !existed {
            self.publish(RawFsEvent::single("create", &normalize_path(path)));
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<Value>> {
        let mut entries = fs::read_dir(self.resolve(path)?).await?;
        let mut listing = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let mut record = match entry.metadata().await {
                Ok(metadata) => describe(&metadata),
                Err(e) => {
                    debug!(entry = ?entry.path(), error = %e, "Listing entry without metadata");
                    json!({})
                }
            };
            record["name"] = Value::String(entry.file_name().to_string_lossy().into_owned());
            listing.push(record);
        }

        listing.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(listing)
    }

    async fn stat(&self, path: &str) -> Result<Value> {
        let metadata = fs::metadata(self.resolve(path)?).await?;
        Ok(describe(&metadata))
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(PyletError::InvalidPath {
                path: path.to_string(),
            });
        }

        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            if recursive {
                fs::remove_dir_all(&target).await?;
            } else {
                fs::remove_dir(&target).await?;
            }
        } else {
            fs::remove_file(&target).await?;
        }

        self.publish(RawFsEvent::single("remove", &normalize_path(path)));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;

        self.publish(RawFsEvent::rename(&normalize_path(from), &normalize_path(to)));
        Ok(())
    }

    async fn watch(&self, path: &str, options: &WatchOptions) -> Result<()> {
        fs::metadata(self.resolve(path)?).await?;
        debug!(path = %path, recursive = options.recursive, include = ?options.include, "Watch registered");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RawFsEvent> {
        self.events.subscribe()
    }
}
