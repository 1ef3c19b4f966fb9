//! Settings document on disk and the configuration stream built from it.
//!
//! The document is TOML (see [`IngestConfig`]). [`SettingsFile::watch`]
//! reloads it whenever it changes and publishes the new value on a
//! `watch` channel, so readers always see the most recent settings. A
//! document that fails to parse or validate is ignored and the previous
//! value stays current.

use std::fs;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{info, warn};

use canvas_core::IngestConfig;

use crate::error::{AutoscanError, Result};

/// Write access to the persisted settings.
pub trait SettingsWriter: Send + Sync {
    fn persist(&self, config: &IngestConfig) -> Result<()>;
}

/// A TOML settings document at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

/// Live settings. Dropping it stops reloading.
pub struct SettingsStream {
    rx: watch::Receiver<IngestConfig>,
    _watcher: RecommendedWatcher,
}

impl SettingsStream {
    pub fn subscribe(&self) -> watch::Receiver<IngestConfig> {
        self.rx.clone()
    }

    pub fn current(&self) -> IngestConfig {
        self.rx.borrow().clone()
    }
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, first writing defaults if it does not exist.
    pub fn load_or_init(&self, data_dir: &Path) -> Result<IngestConfig> {
        if !self.path.exists() {
            let defaults = IngestConfig::defaults(data_dir);
            self.persist(&defaults)?;
            warn!(path = %self.path.display(), "settings file missing, wrote defaults");
        }
        self.load()
    }

    pub fn load(&self) -> Result<IngestConfig> {
        Ok(IngestConfig::from_file(&self.path)?)
    }

    /// Start reloading on change. The stream starts at the current document.
    ///
    /// The parent directory is watched rather than the file itself, since an
    /// atomic save replaces the file's inode.
    pub fn watch(&self) -> Result<SettingsStream> {
        let initial = self.load()?;
        let (tx, rx) = watch::channel(initial);

        let file = self.path.clone();
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => handle_settings_event(&event, &file, &tx),
                Err(e) => warn!(error = %e, "settings watcher error"),
            },
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "watching settings file");

        Ok(SettingsStream {
            rx,
            _watcher: watcher,
        })
    }
}

impl SettingsWriter for SettingsFile {
    /// Write to a hidden `.tmp` sibling then rename over the document.
    fn persist(&self, config: &IngestConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AutoscanError::io(parent, e))?;
        }
        let body = config.to_toml()?;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings".into());
        let tmp_path = self.path.with_file_name(format!(".{name}.tmp"));
        fs::write(&tmp_path, body).map_err(|e| AutoscanError::io(tmp_path.as_path(), e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| AutoscanError::io(self.path.as_path(), e))?;
        info!(path = %self.path.display(), "settings written");
        Ok(())
    }
}

fn handle_settings_event(event: &Event, file: &Path, tx: &watch::Sender<IngestConfig>) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_)
    );
    if !relevant || !event.paths.iter().any(|p| p.file_name() == file.file_name()) {
        return;
    }
    match IngestConfig::from_file(file) {
        Ok(next) => {
            let changed = tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
            if changed {
                info!(path = %file.display(), "reloaded settings");
            }
        }
        Err(e) => warn!(
            path = %file.display(),
            error = %e,
            "failed to reload settings, keeping previous version"
        ),
    }
}
