//! Filesystem watcher feeding the discovery queue.
//!
//! Any file that appears under the watched root (created, or renamed into
//! the tree) is queued. Hidden entries, meaning any path component below the
//! root that starts with a dot, are ignored, and so is anything under an
//! excluded directory such as a storage location nested inside the watched
//! tree. Files already present when the watcher starts are queued too, so a
//! restart picks up what was dropped while autoscan was off.

use std::fs;
use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::queue::DiscoveryQueue;

struct ActiveWatch {
    root: PathBuf,
    watcher: RecommendedWatcher,
}

/// Root of the watched tree plus subtrees that must never be queued.
#[derive(Debug, Clone)]
pub(crate) struct WatchScope {
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl WatchScope {
    pub(crate) fn new(root: PathBuf, excluded: &[PathBuf]) -> Self {
        let excluded = excluded
            .iter()
            .map(|p| fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .filter(|p| p.starts_with(&root))
            .collect();
        Self { root, excluded }
    }

    /// Whether `path` is a visible entry of the tree outside every exclusion.
    pub(crate) fn admits(&self, path: &Path) -> bool {
        !is_hidden(path, &self.root) && !self.excluded.iter().any(|e| path.starts_with(e))
    }
}

/// Owns the OS watch handle for the autoscan directory.
#[derive(Default)]
pub struct DirectoryWatcher {
    active: Option<ActiveWatch>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root())
            .finish()
    }
}

impl DirectoryWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `path` recursively, queueing discovered files.
    ///
    /// Paths under any of `excluded` are never queued. A running watcher is
    /// stopped first. Returns how many existing files were queued by the
    /// initial scan.
    pub fn start(&mut self, path: &Path, excluded: &[PathBuf], queue: DiscoveryQueue) -> Result<usize> {
        self.stop();

        let root = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let scope = WatchScope::new(root.clone(), excluded);
        let handler_scope = scope.clone();
        let handler_queue = queue.clone();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => handle_fs_event(&event, &handler_scope, &handler_queue),
                Err(e) => warn!(error = %e, "autoscan watcher error"),
            },
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let existing = scan_existing(&scope, &queue);
        info!(path = %root.display(), existing, "watching autoscan directory");

        self.active = Some(ActiveWatch { root, watcher });
        Ok(existing)
    }

    /// Release the OS watch handle. A failed release is only logged.
    pub fn stop(&mut self) {
        if let Some(ActiveWatch { root, mut watcher }) = self.active.take() {
            if let Err(e) = watcher.unwatch(&root) {
                warn!(path = %root.display(), error = %e, "autoscan watcher failed to close");
            }
            info!(path = %root.display(), "stopped watching autoscan directory");
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn root(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.root.as_path())
    }
}

/// Queue every eligible path carried by a create or rename event.
pub(crate) fn handle_fs_event(event: &Event, scope: &WatchScope, queue: &DiscoveryQueue) {
    let added = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    if !added {
        return;
    }
    for path in &event.paths {
        if !scope.admits(path) || !path.is_file() {
            continue;
        }
        if queue.insert(path.clone()) {
            debug!(path = %path.display(), "discovered file");
        }
    }
}

/// Whether `path` is outside `root` or has a dot-prefixed component below it.
pub(crate) fn is_hidden(path: &Path, root: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.')),
        Err(_) => true,
    }
}

fn scan_existing(scope: &WatchScope, queue: &DiscoveryQueue) -> usize {
    let mut count = 0;
    let walker = WalkDir::new(&scope.root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| scope.admits(e.path()));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if queue.insert(entry.into_path()) {
                    count += 1;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to scan autoscan directory entry"),
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind, RenameMode};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    #[test]
    fn hidden_components_are_detected() {
        let root = Path::new("/watch");
        assert!(is_hidden(Path::new("/watch/.DS_Store"), root));
        assert!(is_hidden(Path::new("/watch/.git/config"), root));
        assert!(!is_hidden(Path::new("/watch/docs/report.pdf"), root));
        assert!(is_hidden(Path::new("/elsewhere/report.pdf"), root));
    }

    #[test]
    fn create_and_rename_events_queue_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let created = root.join("a.txt");
        let renamed = root.join("b.txt");
        let hidden = root.join(".c.txt");
        for p in [&created, &renamed, &hidden] {
            fs::write(p, b"x").unwrap();
        }
        let queue = DiscoveryQueue::new();
        let scope = WatchScope::new(root.to_path_buf(), &[]);

        handle_fs_event(&event(EventKind::Create(CreateKind::File), created.clone()), &scope, &queue);
        handle_fs_event(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), renamed.clone()),
            &scope,
            &queue,
        );
        handle_fs_event(&event(EventKind::Create(CreateKind::File), hidden), &scope, &queue);
        handle_fs_event(&event(EventKind::Remove(RemoveKind::File), root.join("z.txt")), &scope, &queue);

        assert_eq!(queue.snapshot(), vec![created, renamed]);
    }

    #[test]
    fn directories_are_not_queued() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("folder");
        fs::create_dir(&sub).unwrap();
        let queue = DiscoveryQueue::new();
        let scope = WatchScope::new(dir.path().to_path_buf(), &[]);
        handle_fs_event(&event(EventKind::Create(CreateKind::Folder), sub), &scope, &queue);
        assert!(queue.is_empty());
    }

    #[test]
    fn excluded_subtree_is_never_queued() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let store = root.join("store");
        fs::create_dir_all(store.join("pending")).unwrap();
        let staged = store.join("pending/0d9c.pdf");
        fs::write(&staged, b"%PDF").unwrap();
        let dropped = root.join("report.pdf");
        fs::write(&dropped, b"%PDF").unwrap();

        let scope = WatchScope::new(root.clone(), &[store.clone()]);
        let queue = DiscoveryQueue::new();
        handle_fs_event(&event(EventKind::Create(CreateKind::File), staged.clone()), &scope, &queue);
        assert!(queue.is_empty());

        let mut watcher = DirectoryWatcher::new();
        let existing = watcher.start(&root, &[store], queue.clone()).unwrap();
        assert_eq!(existing, 1);
        assert_eq!(queue.snapshot(), vec![dropped]);
        watcher.stop();
    }

    #[test]
    fn exclusions_outside_the_root_are_ignored() {
        let scope = WatchScope::new(PathBuf::from("/watch"), &[PathBuf::from("/srv/store")]);
        assert!(scope.admits(Path::new("/watch/report.pdf")));
        assert!(!scope.admits(Path::new("/srv/store/pending/a.pdf")));
    }

    #[test]
    fn start_queues_existing_files_and_stop_releases() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::write(root.join("report.pdf"), b"%PDF").unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        fs::write(root.join("nested/notes.md"), b"# hi").unwrap();
        fs::create_dir(root.join(".cache")).unwrap();
        fs::write(root.join(".cache/skip.bin"), b"0").unwrap();

        let queue = DiscoveryQueue::new();
        let mut watcher = DirectoryWatcher::new();
        let existing = watcher.start(&root, &[], queue.clone()).unwrap();

        assert_eq!(existing, 2);
        assert!(queue.contains(&root.join("report.pdf")));
        assert!(queue.contains(&root.join("nested/notes.md")));
        assert!(watcher.is_running());
        assert_eq!(watcher.root(), Some(root.as_path()));

        watcher.stop();
        assert!(!watcher.is_running());
        // Stopping twice is harmless.
        watcher.stop();
    }

    #[test]
    fn live_events_reach_the_queue() {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let queue = DiscoveryQueue::new();
        let mut watcher = DirectoryWatcher::new();
        watcher.start(&root, &[], queue.clone()).unwrap();

        let dropped = root.join("dropped.txt");
        fs::write(&dropped, b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.contains(&dropped) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        assert!(queue.contains(&dropped));
        watcher.stop();
    }
}
