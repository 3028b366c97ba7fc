use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sandbox::Sandbox;

/// Live sandboxes in creation order.
///
/// The lock is never held across an await; callers get `Arc` snapshots.
#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: Mutex<Vec<Arc<Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sandbox: Arc<Sandbox>) {
        self.entries().push(sandbox);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().iter().any(|s| s.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.entries().iter().find(|s| s.id() == id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Sandbox>> {
        self.entries().clone()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Sandbox>> {
        let mut entries = self.entries();
        let index = entries.iter().position(|s| s.id() == id)?;
        Some(entries.remove(index))
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<Sandbox>>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
