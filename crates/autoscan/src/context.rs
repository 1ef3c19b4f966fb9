//! Handles shared by every autoscan component.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use canvas_core::WorkerConfig;

use crate::error::Result;
use crate::events::EventBus;
use crate::ledger::TransferLedger;
use crate::mover::FileMover;
use crate::queue::DiscoveryQueue;

/// Directory layout under a storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged files awaiting a disposition.
    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    /// Confirmed, permanently managed files.
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }
}

/// Ledger, mover, queue and event bus plus the active storage layout.
///
/// The filesystem guard serialises passes that move staged files around:
/// scheduler flushes, finalizer actions, relocation and startup recovery.
#[derive(Debug)]
pub struct AutoscanContext {
    ledger: TransferLedger,
    mover: FileMover,
    queue: DiscoveryQueue,
    events: EventBus,
    layout: RwLock<StorageLayout>,
    fs_guard: Mutex<()>,
}

impl AutoscanContext {
    pub fn new(ledger: TransferLedger, mover: FileMover, events: EventBus, layout: StorageLayout) -> Self {
        Self {
            ledger,
            mover,
            queue: DiscoveryQueue::new(),
            events,
            layout: RwLock::new(layout),
            fs_guard: Mutex::new(()),
        }
    }

    /// Build a context from host settings: opens the ledger under the data
    /// directory and keeps the fallback trash there too.
    pub fn open(worker: &WorkerConfig, storage_location: &Path) -> Result<Self> {
        let ledger = TransferLedger::open(worker.ledger_path())?;
        let mover = FileMover::new(worker.trash_dir(), Duration::from_secs(worker.fs_timeout_secs))
            .with_system_trash(worker.system_trash);
        let events = EventBus::new(worker.event_capacity);
        Ok(Self::new(ledger, mover, events, StorageLayout::new(storage_location)))
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub fn mover(&self) -> &FileMover {
        &self.mover
    }

    pub fn queue(&self) -> &DiscoveryQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn layout(&self) -> StorageLayout {
        self.layout.read().expect("layout lock poisoned").clone()
    }

    pub(crate) fn set_layout(&self, layout: StorageLayout) {
        *self.layout.write().expect("layout lock poisoned") = layout;
    }

    /// Acquire the filesystem guard for one pass.
    pub async fn lock_fs(&self) -> MutexGuard<'_, ()> {
        self.fs_guard.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_subdirectories() {
        let layout = StorageLayout::new("/srv/canvas");
        assert_eq!(layout.pending_dir(), PathBuf::from("/srv/canvas/pending"));
        assert_eq!(layout.files_dir(), PathBuf::from("/srv/canvas/files"));
        assert_eq!(layout.root(), Path::new("/srv/canvas"));
    }

    #[test]
    fn open_places_ledger_and_trash_under_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let worker = WorkerConfig {
            profile: String::new(),
            data_dir: dir.path().to_path_buf(),
            settings_path: dir.path().join("autoscan.toml"),
            coalesce_ms: 10,
            fs_timeout_secs: 5,
            event_capacity: 8,
            system_trash: false,
        };
        let ctx = AutoscanContext::open(&worker, &dir.path().join("store")).unwrap();
        assert_eq!(ctx.ledger().path(), dir.path().join("pending-transfers.json"));
        assert_eq!(ctx.mover().trash_dir(), dir.path().join("trash"));
        assert_eq!(ctx.layout().root(), dir.path().join("store"));
    }
}
