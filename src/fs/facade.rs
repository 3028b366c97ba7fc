use std::sync::Arc;

use tracing::debug;

use crate::error::{PyletError, Result};
use crate::fs::vfs::{VirtualFs, WatchOptions};
use crate::fs::watch::{FsWatcher, WatchScope};
use crate::fs::{normalize_path, FileEntry};

/// Sandbox-facing file operations over a [`VirtualFs`] service.
#[derive(Clone)]
pub struct FilesystemFacade {
    vfs: Arc<dyn VirtualFs>,
}

impl FilesystemFacade {
    pub fn new(vfs: Arc<dyn VirtualFs>) -> Self {
        Self { vfs }
    }

    /// Read a file as UTF-8 text.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let path = normalize_path(path);
        let bytes = self.vfs.read_file(&path).await?;
        String::from_utf8(bytes)
            .map_err(|e| PyletError::Protocol(format!("{} is not valid UTF-8: {}", path, e)))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.vfs
            .write_file(&normalize_path(path), content.as_bytes())
            .await
    }

    /// Create a directory along with any missing parents.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.vfs.mkdir(&normalize_path(path), true).await
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        let records = self.vfs.read_dir(&path).await?;
        let total = records.len();

        let entries: Vec<FileEntry> = records
            .iter()
            .filter_map(|record| FileEntry::from_record(&path, record))
            .collect();

        if entries.len() < total {
            debug!(
                path = %path,
                skipped = total - entries.len(),
                "Skipped unnamed directory records"
            );
        }
        Ok(entries)
    }

    /// True when the service can stat the path. Any fault reads as absent.
    pub async fn exists(&self, path: &str) -> bool {
        self.vfs.stat(&normalize_path(path)).await.is_ok()
    }

    /// Remove a file or a directory tree.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.vfs.remove(&normalize_path(path), true).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.vfs
            .rename(&normalize_path(from), &normalize_path(to))
            .await
    }

    /// Watch `path` for changes.
    ///
    /// The broadcast subscription is taken before the watch is registered, so
    /// nothing published after this call returns is missed.
    pub async fn watch(&self, path: &str, options: WatchOptions) -> Result<FsWatcher> {
        let path = normalize_path(path);
        let scope = WatchScope::new(&path, &options)?;

        let source = self.vfs.subscribe();
        self.vfs.watch(&path, &options).await?;

        Ok(FsWatcher::spawn(source, scope))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fs::{DiskVfs, FsEvent};

    fn facade() -> (tempfile::TempDir, FilesystemFacade) {
        let dir = tempfile::tempdir().unwrap();
        let vfs = DiskVfs::new(dir.path()).unwrap();
        (dir, FilesystemFacade::new(Arc::new(vfs)))
    }

    #[tokio::test]
    async fn test_readdir_after_write() {
        let (_dir, fs) = facade();
        fs.write_file("/a.txt", "x").await.unwrap();

        let entries = fs.readdir("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].path, "/a.txt");
        assert!(!entries[0].is_directory);
        assert_eq!(entries[0].size, 1);
    }

    #[tokio::test]
    async fn test_relative_and_absolute_paths_are_the_same_file() {
        let (_dir, fs) = facade();
        fs.write_file("foo.txt", "hello").await.unwrap();
        assert_eq!(fs.read_file("/foo.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_exists() {
        let (_dir, fs) = facade();
        assert!(!fs.exists("/missing").await);
        assert!(!fs.exists("/../escape").await);

        fs.mkdir("/a/b/c").await.unwrap();
        assert!(fs.exists("a/b").await);
        assert!(fs.exists("/a/b/c").await);
    }

    #[tokio::test]
    async fn test_remove_and_rename() {
        let (_dir, fs) = facade();
        fs.write_file("/d/one.txt", "1").await.unwrap();
        fs.rename("/d/one.txt", "/d/two.txt").await.unwrap();
        assert!(!fs.exists("/d/one.txt").await);
        assert_eq!(fs.read_file("/d/two.txt").await.unwrap(), "1");

        fs.remove("/d").await.unwrap();
        assert!(!fs.exists("/d").await);
    }

    #[tokio::test]
    async fn test_read_file_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Arc::new(DiskVfs::new(dir.path()).unwrap());
        vfs.write_file("/blob", &[0xff, 0xfe]).await.unwrap();

        let fs = FilesystemFacade::new(vfs);
        assert!(matches!(
            fs.read_file("/blob").await,
            Err(PyletError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_reports_changes_in_scope() {
        let (_dir, fs) = facade();
        fs.mkdir("/w").await.unwrap();

        let mut watcher = fs
            .watch(
                "w",
                WatchOptions {
                    recursive: false,
                    include: vec!["*.py".to_string()],
                },
            )
            .await
            .unwrap();

        fs.write_file("/elsewhere.py", "x").await.unwrap();
        fs.write_file("/w/notes.txt", "x").await.unwrap();
        fs.write_file("/w/main.py", "x").await.unwrap();
        fs.rename("/w/main.py", "/w/app.py").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap();
        assert_eq!(
            first,
            Some(FsEvent::Create {
                path: "/w/main.py".to_string()
            })
        );

        let second = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap();
        assert_eq!(
            second,
            Some(FsEvent::Rename {
                from: "/w/main.py".to_string(),
                to: "/w/app.py".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_watch_missing_path_fails() {
        let (_dir, fs) = facade();
        assert!(fs.watch("/nope", WatchOptions::default()).await.is_err());
    }
}
