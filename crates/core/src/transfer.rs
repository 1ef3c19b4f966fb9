use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a staged file. Becomes the permanent id once the file is added.
pub type TransferId = Uuid;

/// A file moved out of the watched directory and awaiting a disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFileTransfer {
    pub id: TransferId,
    /// Original base name, for display and logging only.
    pub filename: String,
    /// Where the file lived in the watched directory.
    pub old_path: PathBuf,
    /// Where the staged copy lives under pending storage.
    pub new_path: PathBuf,
}

/// Payload describing one newly staged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: TransferId,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub mime_type: String,
    pub access_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
}

/// Terminal decision for a pending transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Keep the file in managed storage.
    Add,
    /// Discard the staged file.
    Remove,
    /// Return the file to the watched directory for a later pass.
    Delay,
}

impl Disposition {
    /// Parse a disposition name. Anything unrecognised is treated as `Delay`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" => Disposition::Add,
            "remove" => Disposition::Remove,
            _ => Disposition::Delay,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Add => "add",
            Disposition::Remove => "remove",
            Disposition::Delay => "delay",
        }
    }
}

impl From<&str> for Disposition {
    fn from(s: &str) -> Self {
        Disposition::parse(s)
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
