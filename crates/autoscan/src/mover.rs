//! Move and delete primitives for staged files.
//!
//! A move is a `rename` when source and destination share a volume. When the
//! rename is refused (cross-device, or any other reason than a missing
//! source) the file is copied into a hidden partial file beside the
//! destination, synced, and renamed into place before the source is removed.
//! A failed copy removes the partial file, so a half-written file is never
//! visible under the destination name.
//!
//! Deletes are recoverable: files go to the host trash when enabled, and to
//! the trash directory otherwise or when the host trash refuses them.
//!
//! All filesystem work runs on the blocking pool and is bounded by a
//! timeout. A move that outlives its timeout keeps running; callers that
//! must account for its result use [`FileMover::try_move_file`].

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AutoscanError, Result};

/// Filesystem primitives with bounded execution time.
#[derive(Debug, Clone)]
pub struct FileMover {
    trash_dir: PathBuf,
    timeout: Duration,
    system_trash: bool,
    #[cfg(test)]
    gate: Option<std::sync::Arc<std::sync::Mutex<()>>>,
}

/// Outcome of moving the contents of one directory into another.
#[derive(Debug, Default)]
pub struct DirMoveReport {
    /// `(from, to)` for every entry that was moved.
    pub moved: Vec<(PathBuf, PathBuf)>,
    /// Entries that could not be moved, with the reason.
    pub failed: Vec<(PathBuf, AutoscanError)>,
}

/// Where a deleted file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trashed {
    /// The host trash (recycle bin).
    System,
    /// The fallback trash directory, at this path.
    Folder(PathBuf),
}

/// Result of a move bounded by the mover's timeout.
#[derive(Debug)]
pub enum MoveAttempt {
    Finished(Result<()>),
    /// Still running on the blocking pool after the timeout.
    Stalled(StalledMove),
}

/// A move that outlived its timeout.
#[derive(Debug)]
pub struct StalledMove {
    pub from: PathBuf,
    pub to: PathBuf,
    pub after: Duration,
    handle: JoinHandle<Result<()>>,
}

impl StalledMove {
    /// Wait for the move to complete and return its result.
    pub async fn finish(self) -> Result<()> {
        self.handle.await?
    }
}

impl FileMover {
    pub fn new(trash_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            trash_dir: trash_dir.into(),
            timeout,
            system_trash: false,
            #[cfg(test)]
            gate: None,
        }
    }

    /// Send deletes to the host trash, keeping the trash directory as fallback.
    pub fn with_system_trash(mut self, enabled: bool) -> Self {
        self.system_trash = enabled;
        self
    }

    /// Hold every blocking move until `gate` is free.
    #[cfg(test)]
    pub(crate) fn with_gate(mut self, gate: std::sync::Arc<std::sync::Mutex<()>>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    /// Move a file to `to`. Fails if `to` already exists.
    ///
    /// On timeout the move is left running and `Timeout` is returned.
    pub async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        match self.try_move_file(from, to).await {
            MoveAttempt::Finished(result) => result,
            MoveAttempt::Stalled(stalled) => Err(AutoscanError::Timeout {
                op: format!("move {} to {}", from.display(), to.display()),
                after: stalled.after,
            }),
        }
    }

    /// Move a file to `to`, handing back the running task on timeout.
    pub async fn try_move_file(&self, from: &Path, to: &Path) -> MoveAttempt {
        let (src, dst) = (from.to_path_buf(), to.to_path_buf());
        #[cfg(test)]
        let gate = self.gate.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            #[cfg(test)]
            let _held = gate.as_ref().map(|g| g.lock());
            move_file_blocking(&src, &dst)
        });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => MoveAttempt::Finished(joined.map_err(AutoscanError::from).and_then(|r| r)),
            Err(_) => {
                warn!(from = %from.display(), to = %to.display(), "move still running after timeout");
                MoveAttempt::Stalled(StalledMove {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                    after: self.timeout,
                    handle,
                })
            }
        }
    }

    /// Recoverably delete a file. Returns where it went.
    pub async fn delete(&self, path: &Path) -> Result<Trashed> {
        let path = path.to_path_buf();
        let trash_dir = self.trash_dir.clone();
        let system_trash = self.system_trash;
        let op = format!("delete {}", path.display());
        self.run_blocking(op, move || trash_blocking(&path, &trash_dir, system_trash))
            .await
    }

    /// Move every top-level entry of `from_dir` into `to_dir`.
    ///
    /// Individual failures are collected; the remaining entries are still
    /// moved. A missing `from_dir` yields an empty report.
    pub async fn move_dir_contents(&self, from_dir: &Path, to_dir: &Path) -> Result<DirMoveReport> {
        let mut entries = match tokio::fs::read_dir(from_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DirMoveReport::default()),
            Err(e) => return Err(AutoscanError::io(from_dir, e)),
        };
        tokio::fs::create_dir_all(to_dir)
            .await
            .map_err(|e| AutoscanError::io(to_dir, e))?;

        let mut report = DirMoveReport::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AutoscanError::io(from_dir, e))?
        {
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            match self.move_file(&from, &to).await {
                Ok(()) => report.moved.push((from, to)),
                Err(e) => {
                    warn!(from = %from.display(), to = %to.display(), error = %e, "failed to relocate entry");
                    report.failed.push((from, e));
                }
            }
        }
        info!(
            from = %from_dir.display(),
            to = %to_dir.display(),
            moved = report.moved.len(),
            failed = report.failed.len(),
            "relocated directory contents"
        );
        Ok(report)
    }

    async fn run_blocking<T, F>(&self, op: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f)).await {
            Ok(joined) => joined?,
            Err(_) => Err(AutoscanError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }
}

fn move_file_blocking(from: &Path, to: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(from) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AutoscanError::SourceMissing(from.to_path_buf()))
        }
        Err(e) => return Err(AutoscanError::io(from, e)),
    };
    if to.exists() {
        return Err(AutoscanError::DestinationOccupied(to.to_path_buf()));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| AutoscanError::io(parent, e))?;
    }

    match fs::rename(from, to) {
        Ok(()) => {
            debug!(from = %from.display(), to = %to.display(), "renamed");
            return Ok(());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound && !from.exists() => {
            return Err(AutoscanError::SourceMissing(from.to_path_buf()))
        }
        Err(e) if meta.is_dir() => {
            return Err(AutoscanError::Move {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source: e,
            })
        }
        Err(e) => {
            debug!(from = %from.display(), to = %to.display(), error = %e, "rename refused, copying");
        }
    }

    copy_then_remove(from, to).map_err(|source| AutoscanError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Copy through a hidden partial file, then drop the source.
fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    let dir = to.parent().unwrap_or_else(|| Path::new("."));
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = dir.join(format!(".{name}.partial-{}", Uuid::new_v4().simple()));

    let copy = || -> io::Result<()> {
        fs::copy(from, &partial)?;
        File::open(&partial)?.sync_all()?;
        fs::rename(&partial, to)
    };
    if let Err(e) = copy() {
        if let Err(cleanup) = fs::remove_file(&partial) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(path = %partial.display(), error = %cleanup, "failed to remove partial copy");
            }
        }
        return Err(e);
    }

    if let Err(e) = fs::remove_file(from) {
        // The copy is complete; keep exactly one file by undoing it.
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}

fn trash_blocking(path: &Path, trash_dir: &Path, system_trash: bool) -> Result<Trashed> {
    if !path.exists() {
        return Err(AutoscanError::SourceMissing(path.to_path_buf()));
    }
    if system_trash {
        match trash::delete(path) {
            Ok(()) => {
                info!(path = %path.display(), "moved file to system trash");
                return Ok(Trashed::System);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "system trash refused file, using trash directory"),
        }
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let mut target = trash_dir.join(&name);
    if target.exists() {
        target = trash_dir.join(format!("{}-{name}", Uuid::new_v4().simple()));
    }
    move_file_blocking(path, &target)?;
    info!(path = %path.display(), trashed = %target.display(), "moved file to trash directory");
    Ok(Trashed::Folder(target))
}
