//! Startup consistency pass between pending storage and the ledger.
//!
//! A crash can leave a staged file without a ledger entry (between the move
//! and the append) or an entry without a file (between a finalizer action
//! and the entry removal). Both are resolved here before autoscan starts so
//! every file in pending storage has exactly one entry and vice versa.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use canvas_core::{IngestConfig, PendingFileTransfer};

use crate::context::AutoscanContext;
use crate::scheduler::{describe, detect_type};

/// Names in pending storage that are never treated as orphans.
const WHITELIST: &[&str] = &[".DS_Store"];

/// Counts from one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transfers whose file is present, offered again to the consumer.
    pub reoffered: usize,
    /// Unrecorded files moved back into the watched directory.
    pub orphan_files_returned: usize,
    /// Unrecorded files that could not be moved and stay in pending storage.
    pub orphan_files_left: usize,
    /// Ledger entries dropped because their file is gone.
    pub orphan_entries_removed: usize,
}

pub struct StartupReconciler;

impl StartupReconciler {
    /// Reconcile the active layout's pending directory with the ledger.
    pub async fn run(ctx: &AutoscanContext, config: &IngestConfig) -> RecoveryReport {
        let _guard = ctx.lock_fs().await;
        let pending_dir = ctx.layout().pending_dir();
        let mut report = RecoveryReport::default();

        let mut by_name: HashMap<OsString, PendingFileTransfer> = ctx
            .ledger()
            .all()
            .into_iter()
            .filter_map(|t| t.new_path.file_name().map(|n| (n.to_os_string(), t.clone())))
            .collect();

        let mut reoffer = Vec::new();
        for path in list_pending(&pending_dir).await {
            let Some(name) = path.file_name().map(|n| n.to_os_string()) else {
                continue;
            };
            match by_name.remove(&name) {
                Some(mut transfer) => {
                    if transfer.new_path != path {
                        match ctx.ledger().update_new_path(transfer.id, path.clone()) {
                            Ok(_) => transfer.new_path = path,
                            Err(e) => {
                                warn!(id = %transfer.id, error = %e, "could not update staged path");
                                continue;
                            }
                        }
                    }
                    reoffer.push(transfer);
                }
                None => Self::return_orphan(ctx, config, &path, &mut report).await,
            }
        }

        // Entries left over have no file in the current pending directory.
        for transfer in by_name.into_values() {
            if transfer.new_path.is_file() {
                if let Some(adopted) = Self::adopt(ctx, &transfer, &pending_dir).await {
                    reoffer.push(adopted);
                }
                continue;
            }
            match ctx.ledger().remove(transfer.id) {
                Ok(_) => {
                    report.orphan_entries_removed += 1;
                    ctx.events().warn(
                        "Orphaned Transfer Record",
                        format!(
                            "{} is no longer in pending storage; its transfer record was removed",
                            transfer.filename
                        ),
                    );
                }
                Err(e) => warn!(id = %transfer.id, error = %e, "could not remove orphaned transfer record"),
            }
        }

        let mut batch = Vec::with_capacity(reoffer.len());
        for transfer in reoffer {
            match tokio::fs::metadata(&transfer.new_path).await {
                Ok(meta) => {
                    let (mime_type, _) = detect_type(&transfer.new_path).await;
                    batch.push(describe(transfer.id, transfer.filename, transfer.new_path, mime_type, &meta));
                }
                Err(e) => warn!(path = %transfer.new_path.display(), error = %e, "staged file unreadable"),
            }
        }
        report.reoffered = batch.len();
        ctx.events().files_staged(batch);

        info!(
            reoffered = report.reoffered,
            orphans_returned = report.orphan_files_returned,
            orphans_left = report.orphan_files_left,
            entries_removed = report.orphan_entries_removed,
            "startup recovery complete"
        );
        report
    }

    async fn return_orphan(ctx: &AutoscanContext, config: &IngestConfig, path: &Path, report: &mut RecoveryReport) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = config.autoscan.path.join(name);
        match ctx.mover().move_file(path, &target).await {
            Ok(()) => {
                report.orphan_files_returned += 1;
                ctx.events().warn(
                    "Orphaned Pending File",
                    format!("{} had no transfer record and was returned to {}", path.display(), target.display()),
                );
            }
            Err(e) => {
                report.orphan_files_left += 1;
                ctx.events().warn(
                    "Orphaned Pending File",
                    format!("{} has no transfer record and could not be returned: {e}", path.display()),
                );
            }
        }
    }

    /// Pull a staged file left under an older storage location into the
    /// current pending directory.
    async fn adopt(
        ctx: &AutoscanContext,
        transfer: &PendingFileTransfer,
        pending_dir: &Path,
    ) -> Option<PendingFileTransfer> {
        let name = transfer.new_path.file_name()?;
        let target = pending_dir.join(name);
        if let Err(e) = ctx.mover().move_file(&transfer.new_path, &target).await {
            ctx.events().warn(
                "Relocation Incomplete",
                format!("{} stays at {}: {e}", transfer.filename, transfer.new_path.display()),
            );
            return Some(transfer.clone());
        }
        if let Err(e) = ctx.ledger().update_new_path(transfer.id, target.clone()) {
            warn!(id = %transfer.id, error = %e, "could not record adopted staged path");
            return None;
        }
        info!(id = %transfer.id, to = %target.display(), "adopted staged file from previous storage");
        Some(PendingFileTransfer {
            new_path: target,
            ..transfer.clone()
        })
    }
}

/// Visible regular files directly under `dir`. Missing means empty.
async fn list_pending(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return out,
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if WHITELIST.contains(&name.as_ref()) || name.starts_with('.') {
                    continue;
                }
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    out.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to list pending storage");
                break;
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use uuid::Uuid;

    use super::*;
    use crate::scheduler::IngestScheduler;
    use crate::test_support::{drain, files_in, notices, staged_batches, Fixture};

    #[tokio::test]
    async fn staged_transfers_are_reoffered_with_same_ids() {
        let fx = Fixture::new();
        for name in ["one.txt", "two.pdf"] {
            let p = fx.drop_file(name, b"data");
            fx.ctx.queue().insert(p);
        }
        IngestScheduler::new(fx.ctx.clone()).flush_once().await;
        let mut rx = fx.ctx.events().subscribe();

        let report = StartupReconciler::run(&fx.ctx, &fx.config(false, 15)).await;

        assert_eq!(report.reoffered, 2);
        let batches = staged_batches(&drain(&mut rx));
        assert_eq!(batches.len(), 1);
        let mut ids: Vec<_> = batches[0].iter().map(|d| d.id).collect();
        ids.sort();
        let mut recorded: Vec<_> = fx.ctx.ledger().all().iter().map(|t| t.id).collect();
        recorded.sort();
        assert_eq!(ids, recorded);
    }

    #[tokio::test]
    async fn unrecorded_file_returns_to_watched_directory() {
        let fx = Fixture::new();
        let pending = fx.store_dir().join("pending");
        fs::create_dir_all(&pending).unwrap();
        let stray = pending.join(format!("{}.txt", Uuid::new_v4()));
        fs::write(&stray, b"stray").unwrap();
        fs::write(pending.join(".DS_Store"), b"").unwrap();
        fs::write(pending.join(".x.partial-1"), b"").unwrap();
        let mut rx = fx.ctx.events().subscribe();

        let report = StartupReconciler::run(&fx.ctx, &fx.config(false, 15)).await;

        assert_eq!(report.orphan_files_returned, 1);
        assert_eq!(report.orphan_files_left, 0);
        assert!(!stray.exists());
        assert!(fx.watch_dir().join(stray.file_name().unwrap()).exists());
        assert!(pending.join(".DS_Store").exists());
        assert_eq!(notices(&drain(&mut rx))[0].label, "Orphaned Pending File");
    }

    #[tokio::test]
    async fn entry_without_file_is_removed() {
        let fx = Fixture::new();
        let id = Uuid::new_v4();
        fx.ctx
            .ledger()
            .append(PendingFileTransfer {
                id,
                filename: "lost.txt".into(),
                old_path: fx.watch_dir().join("lost.txt"),
                new_path: fx.store_dir().join(format!("pending/{id}.txt")),
            })
            .unwrap();
        let mut rx = fx.ctx.events().subscribe();

        let report = StartupReconciler::run(&fx.ctx, &fx.config(false, 15)).await;

        assert_eq!(report.orphan_entries_removed, 1);
        assert!(fx.ctx.ledger().is_empty());
        let events = drain(&mut rx);
        assert_eq!(notices(&events)[0].label, "Orphaned Transfer Record");
        assert!(staged_batches(&events).is_empty());
    }

    #[tokio::test]
    async fn file_under_previous_storage_is_adopted() {
        let fx = Fixture::new();
        let id = Uuid::new_v4();
        let old = fx.root().join("old-store/pending");
        fs::create_dir_all(&old).unwrap();
        let staged = old.join(format!("{id}.md"));
        fs::write(&staged, b"# moved").unwrap();
        fx.ctx
            .ledger()
            .append(PendingFileTransfer {
                id,
                filename: "notes.md".into(),
                old_path: fx.watch_dir().join("notes.md"),
                new_path: staged.clone(),
            })
            .unwrap();

        let report = StartupReconciler::run(&fx.ctx, &fx.config(false, 15)).await;

        let expected = fx.store_dir().join(format!("pending/{id}.md"));
        assert_eq!(report.reoffered, 1);
        assert!(expected.exists());
        assert!(!staged.exists());
        assert_eq!(fx.ctx.ledger().find(id).unwrap().new_path, expected);
        assert_eq!(files_in(&fx.store_dir().join("pending")), vec![expected]);
    }

    #[tokio::test]
    async fn missing_pending_directory_is_a_no_op() {
        let fx = Fixture::new();
        let report = StartupReconciler::run(&fx.ctx, &fx.config(false, 15)).await;
        assert_eq!(report, RecoveryReport::default());
    }
}
