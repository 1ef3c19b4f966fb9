//! Converges the running subsystem to the latest ingest settings.
//!
//! Each pass compares the incoming settings with the previous ones and takes
//! the smallest action that closes the gap: start, stop, restart, or
//! relocate pending storage. Only one pass runs at a time, and stopping
//! waits for an in-progress flush, so transitions never overlap a flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use canvas_core::IngestConfig;

use crate::context::{AutoscanContext, StorageLayout};
use crate::recovery::StartupReconciler;
use crate::scheduler::IngestScheduler;
use crate::settings::SettingsWriter;
use crate::watcher::DirectoryWatcher;


/// Default window for collapsing bursts of settings changes.
pub const DEFAULT_COALESCE: Duration = Duration::from_millis(500);

/// Owns the watcher and scheduler and drives them from settings.
pub struct SettingsReconciler {
    ctx: Arc<AutoscanContext>,
    watcher: DirectoryWatcher,
    scheduler: IngestScheduler,
    writer: Option<Arc<dyn SettingsWriter>>,
    previous: Option<IngestConfig>,
    coalesce: Duration,
}

impl std::fmt::Debug for SettingsReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsReconciler")
            .field("watcher", &self.watcher)
            .field("scheduler", &self.scheduler)
            .field("previous", &self.previous)
            .finish()
    }
}

impl SettingsReconciler {
    pub fn new(ctx: Arc<AutoscanContext>) -> Self {
        Self {
            scheduler: IngestScheduler::new(Arc::clone(&ctx)),
            ctx,
            watcher: DirectoryWatcher::new(),
            writer: None,
            previous: None,
            coalesce: DEFAULT_COALESCE,
        }
    }

    /// Settings sink used to write back a storage location that could not
    /// be applied.
    pub fn with_writer(mut self, writer: Arc<dyn SettingsWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_coalesce(mut self, window: Duration) -> Self {
        self.coalesce = window;
        self
    }

    pub fn context(&self) -> &Arc<AutoscanContext> {
        &self.ctx
    }

    /// Settings in effect after the last pass.
    pub fn previous(&self) -> Option<&IngestConfig> {
        self.previous.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_running() && self.scheduler.is_running()
    }

    pub fn watched_path(&self) -> Option<&Path> {
        self.watcher.root()
    }

    pub fn flush_period(&self) -> Option<Duration> {
        self.scheduler.period()
    }

    /// Run one reconciliation pass against `next`.
    pub async fn apply(&mut self, next: IngestConfig) {
        let Some(prev) = self.previous.clone() else {
            self.ctx
                .set_layout(StorageLayout::new(&next.manager.storage_location));
            StartupReconciler::run(&self.ctx, &next).await;
            if next.autoscan.enabled {
                self.start(&next).await;
            }
            self.previous = Some(next);
            return;
        };

        if prev == next {
            if next.autoscan.enabled && !self.is_running() {
                info!("autoscan enabled but not running, retrying start");
                self.start(&next).await;
            } else {
                debug!("settings unchanged");
            }
            return;
        }

        let mut effective = next.clone();
        if prev.manager.storage_location != next.manager.storage_location {
            self.stop().await;
            if !self.relocate(&prev, &next).await {
                effective.manager.storage_location = prev.manager.storage_location.clone();
                self.write_back(&effective);
            }
            if effective.autoscan.enabled {
                self.start(&effective).await;
            }
        } else {
            let (was, now) = (&prev.autoscan, &next.autoscan);
            match (was.enabled, now.enabled) {
                (false, true) => {
                    self.start(&next).await;
                }
                (true, false) => self.stop().await,
                (true, true) if was.path != now.path || was.interval_seconds != now.interval_seconds => {
                    self.stop().await;
                    self.start(&next).await;
                }
                (true, true) if !self.is_running() => {
                    self.start(&next).await;
                }
                _ => {}
            }
        }
        self.previous = Some(effective);
    }

    /// Bring up the watcher and scheduler for `config`.
    ///
    /// Returns false when a directory or the watcher could not be set up;
    /// the next pass with autoscan enabled tries again.
    pub async fn start(&mut self, config: &IngestConfig) -> bool {
        let layout = StorageLayout::new(&config.manager.storage_location);
        for dir in [config.autoscan.path.clone(), layout.pending_dir(), layout.files_dir()] {
            if let Err(e) = self.ensure_dir(&dir).await {
                self.ctx.events().error(
                    "Exception",
                    format!("Could not create {}: {e}", dir.display()),
                );
                return false;
            }
        }
        // Staged files must not be rediscovered when storage sits inside the
        // watched tree.
        let excluded = [layout.root().to_path_buf()];
        self.ctx.set_layout(layout);

        match self
            .watcher
            .start(&config.autoscan.path, &excluded, self.ctx.queue().clone())
        {
            Ok(existing) => debug!(existing, "autoscan watcher running"),
            Err(e) => {
                self.ctx.events().error(
                    "Watcher Failed",
                    format!("Could not watch {}: {e}", config.autoscan.path.display()),
                );
                return false;
            }
        }
        self.scheduler
            .start(Duration::from_secs(config.autoscan.interval_seconds))
            .await;
        info!(path = %config.autoscan.path.display(), "autoscan started");
        true
    }

    /// Stop watching and flushing. Pending transfers stay in the ledger.
    pub async fn stop(&mut self) {
        let was_running = self.watcher.is_running() || self.scheduler.is_running();
        self.watcher.stop();
        self.scheduler.stop().await;
        self.ctx.queue().clear();
        if was_running {
            info!("autoscan stopped");
        }
    }

    /// Consume the settings stream until it closes or `shutdown` fires.
    ///
    /// After a change the coalescing window is waited out and only the
    /// latest value is applied.
    pub async fn run(&mut self, mut settings: watch::Receiver<IngestConfig>, shutdown: Arc<Notify>) {
        let initial = settings.borrow_and_update().clone();
        self.apply(initial).await;

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                changed = settings.changed() => {
                    if changed.is_err() {
                        debug!("settings stream closed");
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.coalesce) => {}
                    }
                    let next = settings.borrow_and_update().clone();
                    self.apply(next).await;
                }
            }
        }
        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        self.stop().await;
        info!("autoscan reconciler shut down");
    }

    /// Move pending storage from `prev`'s location to `next`'s.
    ///
    /// Returns false when the new location is unusable; the old layout then
    /// stays active.
    async fn relocate(&mut self, prev: &IngestConfig, next: &IngestConfig) -> bool {
        let from = StorageLayout::new(&prev.manager.storage_location);
        let to = StorageLayout::new(&next.manager.storage_location);

        for dir in [to.pending_dir(), to.files_dir()] {
            if let Err(e) = self.ensure_dir(&dir).await {
                self.ctx.events().error(
                    "Relocation Failed",
                    format!(
                        "Could not use {} as storage location, keeping {}: {e}",
                        to.root().display(),
                        from.root().display()
                    ),
                );
                return false;
            }
        }

        let _guard = self.ctx.lock_fs().await;
        self.ctx.set_layout(to.clone());

        let report = match self
            .ctx
            .mover()
            .move_dir_contents(&from.pending_dir(), &to.pending_dir())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.ctx.events().error(
                    "Relocation Failed",
                    format!("Could not read {}: {e}", from.pending_dir().display()),
                );
                return true;
            }
        };

        let by_path: HashMap<PathBuf, _> = self
            .ctx
            .ledger()
            .all()
            .into_iter()
            .map(|t| (t.new_path, t.id))
            .collect();
        let mut updated = 0usize;
        for (old, new) in &report.moved {
            if let Some(id) = by_path.get(old) {
                match self.ctx.ledger().update_new_path(*id, new.clone()) {
                    Ok(_) => updated += 1,
                    Err(e) => self.ctx.events().error(
                        "Ledger Write Failed",
                        format!("Could not record new location {}: {e}", new.display()),
                    ),
                }
            }
        }
        for (path, e) in &report.failed {
            self.ctx.events().warn(
                "Relocation Incomplete",
                format!("{} was left in place: {e}", path.display()),
            );
        }

        info!(
            from = %from.root().display(),
            to = %to.root().display(),
            moved = report.moved.len(),
            updated,
            failed = report.failed.len(),
            "relocated pending storage"
        );
        true
    }

    fn write_back(&self, effective: &IngestConfig) {
        let Some(writer) = &self.writer else {
            warn!("no settings writer configured, storage location not written back");
            return;
        };
        if let Err(e) = writer.persist(effective) {
            self.ctx.events().error(
                "Settings Write Failed",
                format!("Could not restore storage location in settings: {e}"),
            );
        }
    }

    /// Create `dir` if missing, announcing the creation.
    async fn ensure_dir(&self, dir: &Path) -> std::io::Result<()> {
        if tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::create_dir_all(dir).await?;
        self.ctx
            .events()
            .warn("Directory Created", format!("Created missing directory {}", dir.display()));
        Ok(())
    }
}
