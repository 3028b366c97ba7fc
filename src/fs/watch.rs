use regex::Regex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{PyletError, Result};
use crate::fs::vfs::{RawFsEvent, WatchOptions};
use crate::fs::{normalize_path, FsEvent};

/// Buffered events per watcher before the forwarder waits on the consumer.
const WATCH_BUFFER: usize = 64;

struct IncludePattern {
    full_path: bool,
    regex: Regex,
}

/// Which paths a watch is interested in.
pub struct WatchScope {
    root: String,
    recursive: bool,
    include: Vec<IncludePattern>,
}

impl WatchScope {
    pub fn new(path: &str, options: &WatchOptions) -> Result<Self> {
        let mut root = normalize_path(path);
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }

        let include = options
            .include
            .iter()
            .map(|pattern| -> Result<IncludePattern> {
                let full_path = pattern.contains('/');
                let source = if full_path {
                    normalize_path(pattern)
                } else {
                    pattern.clone()
                };
                Ok(IncludePattern {
                    full_path,
                    regex: glob_to_regex(&source).map_err(|e| PyletError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            recursive: options.recursive,
            include,
        })
    }

    /// Whether a normalized path falls under this watch.
    pub fn contains(&self, path: &str) -> bool {
        let relative = if self.root == "/" {
            path.strip_prefix('/')
        } else if path == self.root {
            Some("")
        } else {
            path.strip_prefix(self.root.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
        };

        let Some(relative) = relative else {
            return false;
        };

        if !self.recursive && relative.contains('/') {
            return false;
        }

        if self.include.is_empty() {
            return true;
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        self.include.iter().any(|pattern| {
            if pattern.full_path {
                pattern.regex.is_match(path)
            } else {
                pattern.regex.is_match(file_name)
            }
        })
    }

    pub fn matches(&self, event: &FsEvent) -> bool {
        event.paths().into_iter().any(|path| self.contains(path))
    }
}

/// Translate a glob into an anchored regex: `**` crosses directories, `*` and
/// `?` stay within one path segment.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut expr = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    expr.push_str("(?:.*/)?");
                } else {
                    expr.push_str(".*");
                }
            }
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }

    expr.push('$');
    Regex::new(&expr)
}

/// Stream of decoded change events for one watch.
///
/// A background task forwards well-formed, in-scope events from the service's
/// broadcast channel. Dropping the watcher stops the task.
pub struct FsWatcher {
    events: mpsc::Receiver<FsEvent>,
    task: JoinHandle<()>,
}

impl FsWatcher {
    pub(crate) fn spawn(mut source: broadcast::Receiver<RawFsEvent>, scope: WatchScope) -> Self {
        let (tx, events) = mpsc::channel(WATCH_BUFFER);

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(raw) => {
                        let Some(event) = FsEvent::from_raw(&raw) else {
                            trace!(raw = ?raw, "Dropping malformed change event");
                            continue;
                        };
                        if !scope.matches(&event) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Watcher fell behind, change events lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { events, task }
    }

    /// Next event, or `None` once the service stops publishing.
    pub async fn recv(&mut self) -> Option<FsEvent> {
        self.events.recv().await
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
