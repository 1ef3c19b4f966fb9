//! Set of paths discovered since the last flush.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Deduplicated, shared queue of discovered file paths.
///
/// Cloning yields another handle to the same set. The watcher callback
/// thread inserts; the scheduler snapshots and removes.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryQueue {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl DiscoveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the path was not already queued.
    pub fn insert(&self, path: PathBuf) -> bool {
        self.paths.lock().expect("queue lock poisoned").insert(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.lock().expect("queue lock poisoned").contains(path)
    }

    /// Current contents in path order.
    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn remove_all<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        let mut guard = self.paths.lock().expect("queue lock poisoned");
        for path in paths {
            guard.remove(path);
        }
    }

    pub fn clear(&self) {
        self.paths.lock().expect("queue lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.paths.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
