//! Source-tree watcher.
//!
//! Watches the configured source root with one non-recursive registration
//! per directory and translates raw notify events into normalized verbs for
//! the engine:
//!
//! ```text
//! notify -> bridge thread -> classify -> EngineMsg::Source(..)
//! ```
//!
//! Directory growth is race-safe: a new directory is registered *before*
//! its contents are scanned, so files created between the create event and
//! the watch call are still picked up. Directory deletion triggers an
//! obsolete-watch sweep, because delete events for nested paths may arrive
//! out of order or not at all once the parent itself is gone. An overflow
//! notification distrusts everything and rescans the whole tree.

pub mod manifest;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ProjectConfig;
use crate::engine::{EngineMsg, SourceEvent};
use crate::{debug, log};

/// Watch-registration errors. Fatal only while opening a project.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create watcher: {0}")]
    Create(#[from] notify::Error),

    #[error("failed to watch `{path}`")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`); falls back
/// to the raw path (already absolute for notify events) or a cwd join.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        }
    })
}

/// Check if path is a temp/backup file (editor artifacts)
fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}

/// Source-tree watcher actor.
pub struct SourceWatcher {
    /// Channel to receive notify events (sync -> async bridge)
    notify_rx: Option<std::sync::mpsc::Receiver<notify::Result<notify::Event>>>,
    watcher: RecommendedWatcher,
    /// Directories currently registered.
    watched: FxHashSet<PathBuf>,
    engine_tx: mpsc::Sender<EngineMsg>,
    config: Arc<ProjectConfig>,
}

impl SourceWatcher {
    /// Register the whole source tree and collect the initial file set.
    ///
    /// The watcher starts buffering events immediately, so nothing created
    /// while the caller finishes opening the project is lost. Failure to
    /// register the root is fatal to opening; an unwatchable subdirectory
    /// is logged and skipped (a later rescan recovers it).
    pub fn new(
        engine_tx: mpsc::Sender<EngineMsg>,
        config: Arc<ProjectConfig>,
    ) -> Result<(Self, Vec<PathBuf>), WatchError> {
        // Create sync channel for notify (it doesn't support async)
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;

        let mut this = Self {
            notify_rx: Some(notify_rx),
            watcher,
            watched: FxHashSet::default(),
            engine_tx,
            config,
        };

        // Registration and event paths must agree, so the root is
        // normalized the same way event paths are.
        let root = normalize_path(&this.config.source_root());
        let mut files = Vec::new();
        this.register_tree(&root, &mut files, true)?;
        debug!("watch"; "registered {} directories, {} files", this.watched.len(), files.len());

        Ok((this, files))
    }

    /// Run the actor event loop.
    pub async fn run(mut self) {
        let Some(notify_rx) = self.notify_rx.take() else {
            return;
        };

        let (async_tx, mut async_rx) = tokio::sync::mpsc::channel::<notify::Event>(64);

        // Spawn a thread to poll notify events and send to async channel
        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if async_tx.blocking_send(event).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => log!("watch"; "notify error: {}", e),
                }
            }
        });

        while let Some(event) = async_rx.recv().await {
            for verb in self.handle_event(&event) {
                if self.engine_tx.send(EngineMsg::Source(verb)).await.is_err() {
                    return; // engine shut down
                }
            }
        }
    }

    /// Translate one notify event into zero or more normalized verbs.
    fn handle_event(&mut self, event: &notify::Event) -> Vec<SourceEvent> {
        use notify::EventKind;

        if event.need_rescan() {
            log!("watch"; "event queue overflowed, rescanning source tree");
            return vec![SourceEvent::Rescan(self.rescan())];
        }

        let mut verbs = Vec::new();
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    let path = normalize_path(path);
                    if path.is_dir() {
                        self.directory_added(&path, &mut verbs);
                    } else if self.recognized(&path) {
                        verbs.push(SourceEvent::Added(path));
                    }
                }
            }
            EventKind::Modify(modify) => {
                // Ignore metadata-only changes (mtime/atime/chmod noise)
                if matches!(modify, notify::event::ModifyKind::Metadata(_)) {
                    return verbs;
                }
                for path in &event.paths {
                    let path = normalize_path(path);
                    if self.watched.contains(&path) || path.is_dir() {
                        continue;
                    }
                    if !self.recognized(&path) {
                        continue;
                    }
                    // The watcher may report stale events after an atomic
                    // save; reconcile with actual filesystem state.
                    if path.exists() {
                        verbs.push(SourceEvent::Changed(path));
                    } else {
                        debug!("watch"; "upgrade modified->removed: {}", path.display());
                        verbs.push(SourceEvent::Removed(path));
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    let path = normalize_path(path);
                    if self.watched.contains(&path) {
                        self.directory_removed(&path);
                        verbs.push(SourceEvent::Removed(path));
                    } else if self.recognized(&path) {
                        verbs.push(SourceEvent::Removed(path));
                    }
                }
            }
            _ => {}
        }
        verbs
    }

    /// A new directory appeared: register it, then scan it.
    ///
    /// Files found by the scan surface as `Added` verbs; registration
    /// failure is non-fatal here.
    fn directory_added(&mut self, dir: &Path, verbs: &mut Vec<SourceEvent>) {
        debug!("watch"; "directory added: {}", dir.display());
        let mut found = Vec::new();
        // fatal = false: incremental growth failures are recoverable
        let _ = self.register_tree(dir, &mut found, false);
        verbs.extend(found.into_iter().map(SourceEvent::Added));
    }

    /// A watched directory vanished: drop its registration and sweep every
    /// registration that is no longer reachable.
    fn directory_removed(&mut self, dir: &Path) {
        debug!("watch"; "directory removed: {}", dir.display());
        let _ = self.watcher.unwatch(dir);
        self.watched.remove(dir);

        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|d| !d.exists())
            .cloned()
            .collect();
        for dir in stale {
            debug!("watch"; "sweeping obsolete watch: {}", dir.display());
            let _ = self.watcher.unwatch(&dir);
            self.watched.remove(&dir);
        }
    }

    /// Walk `dir`, registering a watch on every directory and recording
    /// every recognized file.
    ///
    /// The watch call precedes the scan on purpose: files created between
    /// the filesystem event and the registration are picked up by the scan.
    fn register_tree(
        &mut self,
        dir: &Path,
        files: &mut Vec<PathBuf>,
        fatal: bool,
    ) -> Result<(), WatchError> {
        match self.watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                self.watched.insert(dir.to_path_buf());
            }
            Err(source) if fatal => {
                return Err(WatchError::Register {
                    path: dir.to_path_buf(),
                    source,
                });
            }
            Err(e) => {
                log!("watch"; "skipping unwatchable directory {}: {}", dir.display(), e);
                return Ok(());
            }
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log!("watch"; "cannot scan {}: {}", dir.display(), e);
                return Ok(());
            }
        };
        for entry in entries.flatten() {
            let path = normalize_path(&entry.path());
            if path.is_dir() {
                self.register_tree(&path, files, false)?;
            } else if self.recognized(&path) {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Full walk after an overflow: individual events cannot be trusted, so
    /// rebuild the registration set and return the complete file set for
    /// reconciliation.
    fn rescan(&mut self) -> Vec<PathBuf> {
        let root = self.config.source_root();
        let mut files = Vec::new();
        let mut live_dirs: FxHashSet<PathBuf> = FxHashSet::default();

        for entry in jwalk::WalkDir::new(&root) {
            let Ok(entry) = entry else { continue };
            let path = normalize_path(&entry.path());
            if entry.file_type().is_dir() {
                live_dirs.insert(path);
            } else if self.recognized(&path) {
                files.push(path);
            }
        }

        for dir in &live_dirs {
            if !self.watched.contains(dir) {
                match self.watcher.watch(dir, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        debug!("watch"; "re-attached watch: {}", dir.display());
                        self.watched.insert(dir.clone());
                    }
                    Err(e) => {
                        log!("watch"; "re-register failed for {}: {}", dir.display(), e)
                    }
                }
            }
        }

        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|d| !live_dirs.contains(*d))
            .cloned()
            .collect();
        for dir in stale {
            let _ = self.watcher.unwatch(&dir);
            self.watched.remove(&dir);
        }

        files
    }

    fn recognized(&self, path: &Path) -> bool {
        self.config.is_source_path(path) && !is_temp_file(path)
    }
}
