//! Fixtures shared by the unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;

use canvas_core::{AutoscanSettings, FileDescriptor, IngestConfig, ManagerSettings, ManagerTarget, Notice};

use crate::context::{AutoscanContext, StorageLayout};
use crate::events::{AutoscanEvent, EventBus};
use crate::ledger::TransferLedger;
use crate::mover::FileMover;

/// A temp directory with `watch/`, `store/` and `data/` inside.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub ctx: Arc<AutoscanContext>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_mover(|trash| FileMover::new(trash, Duration::from_secs(5)))
    }

    /// Moves time out after `timeout` and block while `gate` is held.
    pub fn gated(timeout: Duration, gate: Arc<Mutex<()>>) -> Self {
        Self::with_mover(|trash| FileMover::new(trash, timeout).with_gate(gate))
    }

    fn with_mover(build: impl FnOnce(PathBuf) -> FileMover) -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let root = fs::canonicalize(dir.path()).expect("canonicalize tempdir");
        fs::create_dir_all(root.join("watch")).unwrap();
        let ledger = TransferLedger::open(root.join("data/pending-transfers.json")).unwrap();
        let mover = build(root.join("data/trash"));
        let ctx = AutoscanContext::new(ledger, mover, EventBus::new(64), StorageLayout::new(root.join("store")));
        Self {
            dir,
            ctx: Arc::new(ctx),
        }
    }

    pub fn root(&self) -> PathBuf {
        fs::canonicalize(self.dir.path()).unwrap()
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.root().join("watch")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root().join("store")
    }

    /// Write a file under the watched directory and return its path.
    pub fn drop_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.watch_dir().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn config(&self, enabled: bool, interval_seconds: u64) -> IngestConfig {
        IngestConfig {
            autoscan: AutoscanSettings {
                enabled,
                path: self.watch_dir(),
                interval_seconds,
            },
            manager: ManagerSettings {
                enabled: true,
                storage_location: self.store_dir(),
                target: ManagerTarget::Autoscan,
            },
        }
    }
}

pub(crate) fn files_in(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut out: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            out.sort();
            out
        }
        Err(_) => Vec::new(),
    }
}

/// Drain everything currently buffered on a receiver.
pub(crate) fn drain(rx: &mut broadcast::Receiver<AutoscanEvent>) -> Vec<AutoscanEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub(crate) fn staged_batches(events: &[AutoscanEvent]) -> Vec<Vec<FileDescriptor>> {
    events
        .iter()
        .filter_map(|e| match e {
            AutoscanEvent::FilesStaged(batch) => Some(batch.clone()),
            _ => None,
        })
        .collect()
}

pub(crate) fn notices(events: &[AutoscanEvent]) -> Vec<Notice> {
    events
        .iter()
        .filter_map(|e| match e {
            AutoscanEvent::Notice(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}
