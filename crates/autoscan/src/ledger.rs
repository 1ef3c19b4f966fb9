//! Durable record of in-flight file transfers.
//!
//! The ledger is a single JSON document. Every mutation rewrites the whole
//! document through a synced temp file and a rename, so a crash leaves either
//! the old or the new version on disk, never a torn one. The in-memory map
//! is only changed after the write succeeded.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use canvas_core::{PendingFileTransfer, TransferId};

use crate::error::{AutoscanError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    transfers: Vec<PendingFileTransfer>,
}

/// Keyed, crash-safe store of [`PendingFileTransfer`]s.
#[derive(Debug)]
pub struct TransferLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<TransferId, PendingFileTransfer>>,
}

impl TransferLedger {
    /// Open the ledger at `path`.
    ///
    /// A missing file yields an empty ledger. A file that cannot be parsed is
    /// moved aside to `<name>.corrupt` and the ledger starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AutoscanError::Ledger {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<LedgerDocument>(&contents) {
                Ok(doc) => doc.transfers.into_iter().map(|t| (t.id, t)).collect(),
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        moved_to = %aside.display(),
                        error = %e,
                        "ledger document is unreadable, starting empty"
                    );
                    fs::rename(&path, &aside).map_err(|e| AutoscanError::Ledger {
                        path: path.clone(),
                        source: e,
                    })?;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(AutoscanError::Ledger { path, source: e }),
        };

        info!(path = %path.display(), entries = entries.len(), "opened transfer ledger");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Insert or overwrite a transfer. Durable before returning.
    pub fn append(&self, transfer: PendingFileTransfer) -> Result<()> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        let mut next = entries.clone();
        let id = transfer.id;
        next.insert(id, transfer);
        self.persist(&next)?;
        *entries = next;
        debug!(id = %id, "ledger append");
        Ok(())
    }

    /// Remove a transfer. Returns `false` when the id was not present.
    pub fn remove(&self, id: TransferId) -> Result<bool> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        if !entries.contains_key(&id) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(&id);
        self.persist(&next)?;
        *entries = next;
        debug!(id = %id, "ledger remove");
        Ok(true)
    }

    /// Rewrite the staged location of a transfer after relocation.
    pub fn update_new_path(&self, id: TransferId, new_path: PathBuf) -> Result<bool> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");
        let mut next = entries.clone();
        match next.get_mut(&id) {
            Some(t) if t.new_path != new_path => t.new_path = new_path,
            Some(_) => return Ok(true),
            None => return Ok(false),
        }
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    pub fn find(&self, id: TransferId) -> Option<PendingFileTransfer> {
        self.entries
            .lock()
            .expect("ledger lock poisoned")
            .get(&id)
            .cloned()
    }

    /// All transfers, ordered by id.
    pub fn all(&self) -> Vec<PendingFileTransfer> {
        self.entries
            .lock()
            .expect("ledger lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the document to a hidden temp file, sync it, then rename it over
    /// the ledger and sync the directory entry.
    fn persist(&self, entries: &BTreeMap<TransferId, PendingFileTransfer>) -> Result<()> {
        let doc = LedgerDocument {
            transfers: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("ledger.json");
        let tmp_path = dir.join(format!(".{file_name}.tmp"));

        let ledger_err = |path: &Path, source: std::io::Error| AutoscanError::Ledger {
            path: path.to_path_buf(),
            source,
        };

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(ledger_err(tmp_path.as_path(), e));
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(ledger_err(self.path.as_path(), e));
        }
        sync_dir(dir).map_err(|e| ledger_err(dir, e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
