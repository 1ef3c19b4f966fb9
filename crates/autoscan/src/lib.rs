//! Autoscan: watches a directory, stages new files into pending storage,
//! and waits for the knowledge-ingestion consumer to add, remove or delay
//! each one.

pub mod context;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod ledger;
pub mod mover;
pub mod queue;
pub mod reconciler;
pub mod recovery;
pub mod scheduler;
pub mod settings;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::{AutoscanContext, StorageLayout};
pub use error::{AutoscanError, Result};
pub use events::{AutoscanEvent, EventBus};
pub use finalizer::{FinalizeOutcome, Finalizer};
pub use ledger::TransferLedger;
pub use mover::{DirMoveReport, FileMover, MoveAttempt, StalledMove, Trashed};
pub use queue::DiscoveryQueue;
pub use reconciler::{SettingsReconciler, DEFAULT_COALESCE};
pub use recovery::{RecoveryReport, StartupReconciler};
pub use scheduler::{FlushReport, IngestScheduler};
pub use settings::{SettingsFile, SettingsStream, SettingsWriter};
pub use watcher::DirectoryWatcher;
