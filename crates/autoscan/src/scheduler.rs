//! Periodic flush of the discovery queue into pending storage.
//!
//! Each tick takes every queued path, moves the file to
//! `pending/{id}.{ext}`, records the transfer in the ledger and collects a
//! [`FileDescriptor`]. The batch goes out as a single `FilesStaged` event so
//! a large drop does not produce one notification per file.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use canvas_core::{FileDescriptor, PendingFileTransfer};

use crate::context::AutoscanContext;
use crate::error::AutoscanError;
use crate::mover::{MoveAttempt, StalledMove};


/// Bytes read from the head of a file for content type detection.
const SNIFF_LEN: usize = 8192;
const SNIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Counts from a single flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Files moved to pending storage and recorded.
    pub staged: usize,
    /// Paths dropped because the file vanished or is not a regular file.
    pub dropped: usize,
    /// Paths left queued for the next tick after a failure.
    pub retained: usize,
    /// Paths whose move outlived the timeout and is finishing in the background.
    pub deferred: usize,
}

enum SchedulerState {
    Idle,
    Running {
        period: Duration,
        shutdown: Arc<Notify>,
        handle: JoinHandle<()>,
    },
}

/// Timer-driven stager. `Idle` until started, `Running` until stopped.
pub struct IngestScheduler {
    ctx: Arc<AutoscanContext>,
    state: SchedulerState,
}

impl std::fmt::Debug for IngestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestScheduler")
            .field("period", &self.period())
            .finish()
    }
}

impl IngestScheduler {
    pub fn new(ctx: Arc<AutoscanContext>) -> Self {
        Self {
            ctx,
            state: SchedulerState::Idle,
        }
    }

    /// Begin flushing every `period`. Restarts the timer if already running.
    pub async fn start(&mut self, period: Duration) {
        self.stop().await;

        let period = period.max(Duration::from_millis(1));
        let shutdown = Arc::new(Notify::new());
        let ctx = Arc::clone(&self.ctx);
        let signal = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        // A started flush always runs to completion.
                        flush_queue(&ctx).await;
                    }
                }
            }
            debug!("ingest scheduler loop exited");
        });

        info!(period_ms = period.as_millis() as u64, "ingest scheduler started");
        self.state = SchedulerState::Running {
            period,
            shutdown,
            handle,
        };
    }

    /// Stop scheduling flushes. Waits for an in-progress flush to finish.
    pub async fn stop(&mut self) {
        let state = std::mem::replace(&mut self.state, SchedulerState::Idle);
        if let SchedulerState::Running {
            shutdown, handle, ..
        } = state
        {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "ingest scheduler task ended abnormally");
            }
            info!("ingest scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SchedulerState::Running { .. })
    }

    pub fn period(&self) -> Option<Duration> {
        match &self.state {
            SchedulerState::Running { period, .. } => Some(*period),
            SchedulerState::Idle => None,
        }
    }

    /// Run one flush immediately.
    pub async fn flush_once(&self) -> FlushReport {
        flush_queue(&self.ctx).await
    }
}

impl Drop for IngestScheduler {
    fn drop(&mut self) {
        if let SchedulerState::Running { shutdown, .. } = &self.state {
            shutdown.notify_one();
        }
    }
}

enum StageOutcome {
    Staged(FileDescriptor),
    Dropped,
    Retry,
    /// The move outlived its timeout and finishes in the background.
    InFlight,
}

/// Everything needed to record a file once its move has landed.
struct Staging {
    id: Uuid,
    filename: String,
    old_path: PathBuf,
    new_path: PathBuf,
    mime_type: String,
    meta: Metadata,
}

/// Stage every queued path and publish the resulting batch.
pub(crate) async fn flush_queue(ctx: &Arc<AutoscanContext>) -> FlushReport {
    let _guard = ctx.lock_fs().await;

    let queued = ctx.queue().snapshot();
    if queued.is_empty() {
        return FlushReport::default();
    }

    let mut report = FlushReport::default();
    let mut done: Vec<PathBuf> = Vec::with_capacity(queued.len());
    let mut batch = Vec::new();

    for path in queued {
        match stage_file(ctx, &path).await {
            StageOutcome::Staged(desc) => {
                report.staged += 1;
                batch.push(desc);
                done.push(path);
            }
            StageOutcome::Dropped => {
                report.dropped += 1;
                done.push(path);
            }
            StageOutcome::InFlight => {
                report.deferred += 1;
                done.push(path);
            }
            StageOutcome::Retry => report.retained += 1,
        }
    }

    ctx.queue().remove_all(&done);
    if !batch.is_empty() {
        info!(count = batch.len(), "staged new files");
    }
    ctx.events().files_staged(batch);
    report
}

async fn stage_file(ctx: &Arc<AutoscanContext>, path: &Path) -> StageOutcome {
    if path.starts_with(ctx.layout().root()) {
        debug!(path = %path.display(), "ignoring path inside storage location");
        return StageOutcome::Dropped;
    }
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) => return StageOutcome::Dropped,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "queued file vanished before flush");
            return StageOutcome::Dropped;
        }
    };

    let id = Uuid::new_v4();
    let (mime_type, extension) = detect_type(path).await;
    let staged_name = match extension {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    };
    let new_path = ctx.layout().pending_dir().join(staged_name);
    let staging = Staging {
        id,
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        old_path: path.to_path_buf(),
        new_path: new_path.clone(),
        mime_type,
        meta,
    };

    match ctx.mover().try_move_file(path, &new_path).await {
        MoveAttempt::Finished(Ok(())) => {}
        MoveAttempt::Finished(Err(AutoscanError::SourceMissing(_))) => return StageOutcome::Dropped,
        MoveAttempt::Finished(Err(e)) => {
            ctx.events().error(
                "Exception",
                format!("Failed to move file from {} to {}: {e}", path.display(), new_path.display()),
            );
            return StageOutcome::Retry;
        }
        MoveAttempt::Stalled(stalled) => {
            ctx.events().warn(
                "Slow Transfer",
                format!(
                    "Still moving {} after {:?}; it will be staged once the move completes",
                    path.display(),
                    stalled.after
                ),
            );
            finish_in_background(Arc::clone(ctx), stalled, staging);
            return StageOutcome::InFlight;
        }
    }

    match record(ctx, staging).await {
        Some(desc) => StageOutcome::Staged(desc),
        None => StageOutcome::Retry,
    }
}

/// Append the ledger entry for a moved file.
///
/// On a ledger failure the file is moved back and `None` is returned.
async fn record(ctx: &AutoscanContext, staging: Staging) -> Option<FileDescriptor> {
    let transfer = PendingFileTransfer {
        id: staging.id,
        filename: staging.filename.clone(),
        old_path: staging.old_path.clone(),
        new_path: staging.new_path.clone(),
    };

    if let Err(e) = ctx.ledger().append(transfer) {
        ctx.events().error(
            "Ledger Write Failed",
            format!("Could not record transfer of {}: {e}", staging.old_path.display()),
        );
        if let Err(revert) = ctx.mover().move_file(&staging.new_path, &staging.old_path).await {
            ctx.events().error(
                "Revert Failed",
                format!(
                    "{} is stranded in pending storage at {}: {revert}",
                    staging.filename,
                    staging.new_path.display()
                ),
            );
        }
        return None;
    }

    Some(describe(
        staging.id,
        staging.filename,
        staging.new_path,
        staging.mime_type,
        &staging.meta,
    ))
}

/// Wait out a stalled move, then record and announce the file on its own.
///
/// A move that fails after all, or a ledger failure, puts the source back
/// in the queue for the next tick.
fn finish_in_background(ctx: Arc<AutoscanContext>, stalled: StalledMove, staging: Staging) {
    tokio::spawn(async move {
        let result = stalled.finish().await;
        let _guard = ctx.lock_fs().await;
        let source = staging.old_path.clone();
        match result {
            Ok(()) => match record(&ctx, staging).await {
                Some(desc) => {
                    info!(path = %desc.path.display(), "staged file after slow move");
                    ctx.events().files_staged(vec![desc]);
                }
                None => {
                    ctx.queue().insert(source);
                }
            },
            Err(AutoscanError::SourceMissing(_)) => {
                debug!(path = %source.display(), "source vanished during slow move");
            }
            Err(e) => {
                ctx.events().error(
                    "Exception",
                    format!(
                        "Failed to move file from {} to {}: {e}",
                        source.display(),
                        staging.new_path.display()
                    ),
                );
                ctx.queue().insert(source);
            }
        }
    });
}

/// Build the outbound descriptor for a staged file.
pub(crate) fn describe(
    id: Uuid,
    filename: String,
    path: PathBuf,
    mime_type: String,
    meta: &Metadata,
) -> FileDescriptor {
    FileDescriptor {
        id,
        filename,
        path,
        size: meta.len(),
        mime_type,
        access_time: meta.accessed().ok().map(DateTime::<Utc>::from),
        creation_time: meta.created().ok().map(DateTime::<Utc>::from),
        modification_time: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

/// Read the head of `path` and resolve its type with [`sniff_type`].
///
/// An unreadable file is typed from its path alone.
pub(crate) async fn detect_type(path: &Path) -> (String, Option<String>) {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    match tokio::time::timeout(SNIFF_TIMEOUT, read_head(path, &mut head)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(path = %path.display(), error = %e, "could not read file head");
            head.clear();
        }
        Err(_) => {
            debug!(path = %path.display(), "timed out reading file head");
            head.clear();
        }
    }
    sniff_type(path, &head)
}

async fn read_head(path: &Path, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    file.take(SNIFF_LEN as u64).read_to_end(buf).await?;
    Ok(())
}

/// Resolve the MIME type and the extension for the staged copy.
///
/// Magic bytes in `head` win. The file's own extension is kept when it is
/// one the detected type knows; otherwise the type's canonical extension is
/// used. Without a content match the type comes from the path, keeping a
/// known own extension, then the type's first registered extension, then
/// the raw path extension.
pub(crate) fn sniff_type(path: &Path, head: &[u8]) -> (String, Option<String>) {
    let own = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase());

    if let Some(kind) = infer::get(head) {
        let known = mime_guess::get_mime_extensions_str(kind.mime_type()).unwrap_or(&[]);
        let ext = match own {
            Some(e) if e == kind.extension() || known.contains(&e.as_str()) => e,
            _ => kind.extension().to_string(),
        };
        return (kind.mime_type().to_string(), Some(ext));
    }

    match mime_guess::from_path(path).first() {
        Some(mime) => {
            let known = mime_guess::get_mime_extensions(&mime).unwrap_or(&[]);
            let ext = match own {
                Some(e) if known.contains(&e.as_str()) => Some(e),
                other => known.first().map(|e| e.to_string()).or(other),
            };
            (mime.essence_str().to_string(), ext)
        }
        None => {
            warn!(
                path = %path.display(),
                fallback = own.as_deref().unwrap_or(""),
                "could not determine MIME type, using path extension"
            );
            (String::new(), own)
        }
    }
}
