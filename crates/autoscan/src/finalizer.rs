//! Terminal actions for pending transfers, plus manual file commands.
//!
//! The ledger entry of a transfer is removed only after its filesystem
//! action has completed, or has failed and been reported. A crash in
//! between leaves the entry for startup recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use canvas_core::{Disposition, PendingFileTransfer, TransferId};

use crate::context::AutoscanContext;
use crate::error::{AutoscanError, Result};
use crate::mover::Trashed;

/// What `finalize` did with a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No transfer with that id is pending.
    Unknown,
    /// Moved into managed storage at the given path.
    Added(PathBuf),
    /// Moved to the host trash or the trash directory.
    Removed(Trashed),
    /// Moved back to its original location.
    Reverted(PathBuf),
    /// The action failed and was abandoned; the entry was still cleared.
    Abandoned,
}

/// Applies consumer decisions to staged files.
#[derive(Debug, Clone)]
pub struct Finalizer {
    ctx: Arc<AutoscanContext>,
}

impl Finalizer {
    pub fn new(ctx: Arc<AutoscanContext>) -> Self {
        Self { ctx }
    }

    /// Apply a disposition to the transfer with `id`.
    ///
    /// Unknown ids are a no-op, so repeating a call is safe.
    pub async fn finalize(&self, id: TransferId, disposition: Disposition) -> Result<FinalizeOutcome> {
        let _guard = self.ctx.lock_fs().await;

        let Some(pending) = self.ctx.ledger().find(id) else {
            return Ok(FinalizeOutcome::Unknown);
        };
        info!(id = %id, disposition = %disposition, file = %pending.filename, "finalizing transfer");

        let outcome = match disposition {
            Disposition::Add => self.add(&pending).await,
            Disposition::Remove => self.remove(&pending).await,
            Disposition::Delay => self.revert(&pending).await,
        };

        self.ctx.ledger().remove(id)?;
        Ok(outcome)
    }

    async fn add(&self, pending: &PendingFileTransfer) -> FinalizeOutcome {
        let Some(name) = pending.new_path.file_name() else {
            self.ctx.events().error(
                "Exception",
                format!("Staged path has no file name: {}", pending.new_path.display()),
            );
            return FinalizeOutcome::Abandoned;
        };
        let target = self.ctx.layout().files_dir().join(name);
        match self.ctx.mover().move_file(&pending.new_path, &target).await {
            Ok(()) => {
                self.ctx.events().transfer_confirmed(pending.id, target.clone());
                FinalizeOutcome::Added(target)
            }
            Err(e) => {
                self.ctx.events().error(
                    "Exception",
                    format!(
                        "Failed to move file from {} to {}: {e}",
                        pending.new_path.display(),
                        target.display()
                    ),
                );
                FinalizeOutcome::Abandoned
            }
        }
    }

    async fn remove(&self, pending: &PendingFileTransfer) -> FinalizeOutcome {
        match self.ctx.mover().delete(&pending.new_path).await {
            Ok(trashed) => FinalizeOutcome::Removed(trashed),
            Err(e) => {
                self.ctx.events().error(
                    "Exception",
                    format!("Failed to delete file at {}: {e}", pending.new_path.display()),
                );
                FinalizeOutcome::Abandoned
            }
        }
    }

    /// Best-effort move back into the watched directory.
    async fn revert(&self, pending: &PendingFileTransfer) -> FinalizeOutcome {
        match self.ctx.mover().move_file(&pending.new_path, &pending.old_path).await {
            Ok(()) => {
                info!(from = %pending.new_path.display(), to = %pending.old_path.display(), "reverted transfer");
                FinalizeOutcome::Reverted(pending.old_path.clone())
            }
            Err(AutoscanError::DestinationOccupied(path)) => {
                self.ctx.events().warn(
                    "Revert Skipped",
                    format!(
                        "{} already exists; staged copy left at {}",
                        path.display(),
                        pending.new_path.display()
                    ),
                );
                FinalizeOutcome::Abandoned
            }
            Err(e) => {
                self.ctx.events().warn(
                    "Revert Failed",
                    format!("Could not return {} to {}: {e}", pending.filename, pending.old_path.display()),
                );
                FinalizeOutcome::Abandoned
            }
        }
    }

    /// Move an arbitrary file to the trash.
    pub async fn delete(&self, path: &Path) -> Result<Trashed> {
        let _guard = self.ctx.lock_fs().await;
        self.ctx
            .events()
            .warn("Deleting Autoscan File", path.display().to_string());
        self.ctx.mover().delete(path).await.inspect_err(|e| {
            self.ctx.events().error(
                "Exception",
                format!("Failed to delete file at {}: {e}", path.display()),
            );
        })
    }

    /// Move an arbitrary file into managed storage under its own name.
    pub async fn move_to_managed(&self, path: &Path) -> Result<PathBuf> {
        let _guard = self.ctx.lock_fs().await;
        let name = path
            .file_name()
            .ok_or_else(|| AutoscanError::SourceMissing(path.to_path_buf()))?;
        let target = self.ctx.layout().files_dir().join(name);
        match self.ctx.mover().move_file(path, &target).await {
            Ok(()) => {
                info!(from = %path.display(), to = %target.display(), "moved file into managed storage");
                Ok(target)
            }
            Err(e) => {
                warn!(from = %path.display(), error = %e, "manual move failed");
                self.ctx.events().error(
                    "Exception",
                    format!("Failed to move file from {} to {}: {e}", path.display(), target.display()),
                );
                Err(e)
            }
        }
    }
}
