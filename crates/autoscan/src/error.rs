//! Error types for the autoscan subsystem.

use std::path::PathBuf;
use std::time::Duration;

use canvas_core::ConfigError;

/// Errors that can occur while staging, finalizing or recovering transfers.
#[derive(Debug, thiserror::Error)]
pub enum AutoscanError {
    /// Filesystem I/O error on a single path.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A move could not be completed. No partial file is left at `to`.
    #[error("failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The move target already exists.
    #[error("destination already exists: {0}")]
    DestinationOccupied(PathBuf),

    /// The move or delete source does not exist.
    #[error("source does not exist: {0}")]
    SourceMissing(PathBuf),

    /// The ledger document could not be written or read.
    #[error("ledger I/O error at {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ledger document could not be encoded or decoded.
    #[error("ledger format error: {0}")]
    LedgerFormat(#[from] serde_json::Error),

    /// Filesystem watcher error.
    #[error("notify watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// A filesystem operation did not finish in time.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Settings could not be loaded or written.
    #[error("settings error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias for autoscan operations.
pub type Result<T> = std::result::Result<T, AutoscanError>;

impl AutoscanError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AutoscanError::Io {
            path: path.into(),
            source,
        }
    }
}
