//! Outbound notifications to the knowledge-ingestion consumer.
//!
//! Everything the subsystem reports leaves through one broadcast channel:
//! staged-file batches, confirmations of added files, and warning/error
//! notices. Notices are also written to the log at the matching level, so a
//! process without subscribers still records them.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, warn};

use canvas_core::{FileDescriptor, Notice, Severity, TransferId};

/// An event published to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AutoscanEvent {
    /// One or more files were moved into pending storage.
    FilesStaged(Vec<FileDescriptor>),
    /// A transfer was finalized as "add" and now lives at `path`.
    TransferConfirmed { id: TransferId, path: PathBuf },
    /// A recoverable anomaly or failure.
    Notice(Notice),
}

/// Publish/subscribe handle for [`AutoscanEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AutoscanEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutoscanEvent> {
        self.tx.subscribe()
    }

    /// Publish a batch of staged files. Empty batches are not sent.
    pub fn files_staged(&self, batch: Vec<FileDescriptor>) {
        if batch.is_empty() {
            return;
        }
        self.publish(AutoscanEvent::FilesStaged(batch));
    }

    pub fn transfer_confirmed(&self, id: TransferId, path: PathBuf) {
        self.publish(AutoscanEvent::TransferConfirmed { id, path });
    }

    pub fn notice(&self, notice: Notice) {
        match notice.severity {
            Severity::Warn => warn!(label = %notice.label, "{}", notice.message),
            Severity::Error => error!(label = %notice.label, "{}", notice.message),
        }
        self.publish(AutoscanEvent::Notice(notice));
    }

    pub fn warn(&self, label: &str, message: impl Into<String>) {
        self.notice(Notice::warn(label, message));
    }

    pub fn error(&self, label: &str, message: impl Into<String>) {
        self.notice(Notice::error(label, message));
    }

    fn publish(&self, event: AutoscanEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
