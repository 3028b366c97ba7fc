//! File access for sandboxes.
//!
//! File operations never go through a worker: the [`FilesystemFacade`] talks
//! straight to a [`VirtualFs`] service, normalizing paths and turning the
//! service's loosely typed records into [`FileEntry`] and [`FsEvent`] values.

mod disk;
mod facade;
mod vfs;
mod watch;

pub use disk::DiskVfs;
pub use facade::FilesystemFacade;
pub use vfs::{RawFsEvent, VirtualFs, WatchOptions};
pub use watch::{FsWatcher, WatchScope};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Make a path absolute by ensuring it starts with `/`.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Join a directory and an entry name into an absolute path.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileEntry {
    /// Decode a directory-listing record found in `dir`.
    ///
    /// Entries without a name are unusable and yield `None`. Everything else
    /// is coerced: missing size is 0, a missing or invalid timestamp is now.
    pub fn from_record(dir: &str, record: &Value) -> Option<Self> {
        let name = record.get("name")?.as_str()?.to_string();
        if name.is_empty() {
            return None;
        }

        let is_directory = record
            .get("isDirectory")
            .and_then(Value::as_bool)
            .or_else(|| {
                record
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|kind| kind == "directory" || kind == "dir")
            })
            .unwrap_or(false);

        let size = record
            .get("size")
            .and_then(|size| size.as_u64().or_else(|| size.as_f64().map(|f| f.max(0.0) as u64)))
            .unwrap_or(0);

        let modified = record
            .get("mtime")
            .or_else(|| record.get("lastModified"))
            .and_then(Value::as_f64)
            .and_then(|millis| DateTime::from_timestamp_millis(millis as i64))
            .unwrap_or_else(Utc::now);

        Some(Self {
            path: join_path(dir, &name),
            name,
            is_directory,
            size,
            modified,
        })
    }
}

/// A well-formed change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FsEvent {
    Create { path: String },
    Modify { path: String },
    Remove { path: String },
    Rename { from: String, to: String },
}

impl FsEvent {
    /// Decode a raw service event; malformed records yield `None`.
    pub fn from_raw(raw: &RawFsEvent) -> Option<Self> {
        let path = || raw.path.as_deref().filter(|p| !p.is_empty()).map(normalize_path);

        match raw.kind.as_deref()? {
            "create" => Some(Self::Create { path: path()? }),
            "modify" => Some(Self::Modify { path: path()? }),
            "remove" => Some(Self::Remove { path: path()? }),
            "rename" => {
                let from = raw.from.as_deref().filter(|p| !p.is_empty())?;
                let to = raw.to.as_deref().filter(|p| !p.is_empty())?;
                Some(Self::Rename {
                    from: normalize_path(from),
                    to: normalize_path(to),
                })
            }
            _ => None,
        }
    }

    /// Paths this event touches.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Create { path } | Self::Modify { path } | Self::Remove { path } => {
                vec![path.as_str()]
            }
            Self::Rename { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}
