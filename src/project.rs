//! Project - the context object tying the core together.
//!
//! One `Project` owns one opened dialogue project: the configuration, both
//! watchers, the engine task and the interpreter link. Nothing here is a
//! process-wide singleton; tests (and unusual embeddings) can hold several
//! independent instances.
//!
//! The actor system runs on a dedicated thread with its own small tokio
//! runtime, so the embedding application needs no async machinery: every
//! public operation is a plain call that posts a message to the engine, and
//! reads go through [`Project::snapshot`] / [`Project::subscribe`].

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::{ConfigError, ProjectConfig};
use crate::engine::{Engine, EngineMsg, ModelEvent, ModelSnapshot, SharedModel, StateTarget};
use crate::model::{LogEntry, LogHistory, LoggingState};
use crate::watch::{SourceWatcher, WatchError, manifest::ManifestWatcher};
use crate::{debug, log};

const CHANNEL_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

/// Failures that prevent a project from opening at all.
///
/// Everything past this point is recoverable: transient failures are
/// logged, decode failures and connection state surface on the snapshot.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// One opened project.
pub struct Project {
    config: Arc<ProjectConfig>,
    engine_tx: mpsc::Sender<EngineMsg>,
    shared: SharedModel,
    events: broadcast::Sender<ModelEvent>,
    history: Arc<Mutex<LogHistory>>,
    shutdown_tx: crossbeam::channel::Sender<()>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Project {
    /// Load `rulescope.toml` and open the project it describes.
    pub fn load(config_path: &std::path::Path) -> Result<Self, OpenError> {
        Self::open(ProjectConfig::load(config_path)?)
    }

    /// Open a project: register the watchers (fatal on failure), parse an
    /// already-present manifest, and start the actor system.
    pub fn open(config: ProjectConfig) -> Result<Self, OpenError> {
        config.validate()?;
        let config = Arc::new(config);

        let (engine_tx, engine_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);

        // Watcher-first: registrations happen before the initial parse, so
        // events fired meanwhile buffer instead of getting lost.
        let (source_watcher, initial_files) =
            SourceWatcher::new(engine_tx.clone(), Arc::clone(&config))?;
        let manifest_watcher = ManifestWatcher::new(engine_tx.clone(), Arc::clone(&config))?;

        let history = Arc::new(Mutex::new(LogHistory::new(config.sync.log_history)));
        let engine = Engine::new(
            engine_rx,
            engine_tx.clone(),
            Arc::clone(&config),
            events_tx.clone(),
            Arc::clone(&history),
            initial_files,
        );
        let shared = engine.shared();

        if config.sync.autoconnect
            && let Some(url) = config.sync.runtime_url.clone()
        {
            let _ = engine_tx.try_send(EngineMsg::ConnectRuntime(url));
        }

        let worker = {
            let engine_tx = engine_tx.clone();
            std::thread::spawn(move || {
                run_actor_system(engine, source_watcher, manifest_watcher, engine_tx, shutdown_rx);
            })
        };

        Ok(Self {
            config,
            engine_tx,
            shared,
            events: events_tx,
            history,
            shutdown_tx,
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Current model snapshot (cheap, lock-free).
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.shared.load()
    }

    /// Register an observer for model-change notifications. Each event
    /// means "a newer snapshot is available".
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    /// Assign a logging state; propagation and the outgoing verbosity
    /// hints happen on the engine.
    pub fn set_logging_state(&self, target: StateTarget, state: LoggingState) {
        self.send(EngineMsg::SetState { target, state });
    }

    /// Reload the manifest now, without waiting for a write episode.
    pub fn request_reload(&self) {
        self.send(EngineMsg::ManifestReady);
    }

    /// Connect to the interpreter. `url` falls back to the configured
    /// `sync.runtime_url`.
    pub fn connect_runtime(&self, url: Option<&str>) {
        let url = url
            .map(str::to_string)
            .or_else(|| self.config.sync.runtime_url.clone());
        match url {
            Some(url) => self.send(EngineMsg::ConnectRuntime(url)),
            None => log!("link"; "connect requested but no runtime url is configured"),
        }
    }

    pub fn disconnect_runtime(&self) {
        self.send(EngineMsg::Disconnect);
    }

    /// Ask the interpreter to describe a field (fire-and-forget).
    pub fn request_field_info(&self, field: &str) {
        self.send(EngineMsg::RequestFieldInfo(field.to_string()));
    }

    /// Recent interpreter log entries, oldest first.
    pub fn log_history(&self) -> Vec<Arc<LogEntry>> {
        self.history.lock().entries()
    }

    /// Close the project: empty tree, `NoProject` outcome, cleared
    /// history. The watchers stay armed until [`Project::shutdown`].
    pub fn close(&self) {
        self.send(EngineMsg::Reset);
    }

    /// Stop the actor system and release the OS watch handles.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn send(&self, msg: EngineMsg) {
        if self.engine_tx.blocking_send(msg).is_err() {
            log!("engine"; "dropped a command: engine is not running");
        }
    }

    fn shutdown_impl(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.engine_tx.try_send(EngineMsg::Shutdown);
        let _ = self.shutdown_tx.send(());

        // Bounded wait so close/reopen cycles can never hang the UI.
        for _ in 0..40 {
            if worker.is_finished() {
                let _ = worker.join();
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        log!("engine"; "worker did not stop in time, detaching");
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

/// Run the actor system on its own runtime until a shutdown signal arrives
/// or the engine stops by itself.
fn run_actor_system(
    engine: Engine,
    source_watcher: SourceWatcher,
    manifest_watcher: ManifestWatcher,
    engine_tx: mpsc::Sender<EngineMsg>,
    shutdown_rx: crossbeam::channel::Receiver<()>,
) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build();
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            log!("engine"; "failed to create runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async move {
        let engine_handle = tokio::spawn(engine.run());
        tokio::spawn(source_watcher.run());
        tokio::spawn(manifest_watcher.run());
        debug!("engine"; "actor system started");

        loop {
            if shutdown_rx.try_recv().is_ok() {
                debug!("engine"; "shutdown signal received");
                break;
            }
            if engine_handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = engine_tx.send(EngineMsg::Shutdown).await;
        let _ = tokio::time::timeout(Duration::from_millis(500), engine_handle).await;
    });

    debug!("engine"; "actor system stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CompilationOutcome;
    use std::path::Path;

    const MANIFEST: &str = r##"{ "Main.rules": { "#import": 0,
        "greet":    { "#rule": 3, "#id": 1 },
        "farewell": { "#rule": 9, "#id": 2 } } }"##;

    fn scaffold(manifest: Option<&str>) -> (tempfile::TempDir, ProjectConfig) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.root = dir.path().to_path_buf();
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::create_dir_all(config.generated_dir()).unwrap();
        std::fs::write(config.source_root().join("Main.rules"), "greet: hello\n").unwrap();
        if let Some(content) = manifest {
            std::fs::write(config.manifest_path(), content).unwrap();
        }
        (dir, config)
    }

    /// Poll the snapshot until `predicate` holds (events also work, but a
    /// deadline poll keeps these tests immune to broadcast lag).
    fn wait_for(project: &Project, predicate: impl Fn(&ModelSnapshot) -> bool) {
        for _ in 0..100 {
            if predicate(&project.snapshot()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached within deadline");
    }

    #[test]
    fn test_open_parses_existing_manifest() {
        let (_dir, config) = scaffold(Some(MANIFEST));
        let project = Project::open(config).unwrap();

        let snapshot = project.snapshot();
        assert_eq!(snapshot.outcome, CompilationOutcome::Perfect);
        let tree = snapshot.tree.as_ref().unwrap();
        assert_eq!(tree.node(tree.rule(1).unwrap()).label, "greet");
        assert_eq!(snapshot.sources.len(), 1);
        assert!(!snapshot.sources[0].modified_since_build);

        project.shutdown();
    }

    #[test]
    fn test_open_without_manifest_is_undefined() {
        let (_dir, config) = scaffold(None);
        let project = Project::open(config).unwrap();
        assert_eq!(project.snapshot().outcome, CompilationOutcome::Undefined);
        project.shutdown();
    }

    #[test]
    fn test_open_fails_without_source_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.root = dir.path().to_path_buf();
        // source root never created: watch registration must be fatal
        assert!(matches!(
            Project::open(config),
            Err(OpenError::Watch(WatchError::Register { .. }))
        ));
    }

    #[test]
    fn test_set_state_and_reload_round_trip() {
        let (_dir, config) = scaffold(Some(MANIFEST));
        let manifest_path = config.manifest_path();
        let project = Project::open(config).unwrap();

        project.set_logging_state(StateTarget::Rule(1), LoggingState::Always);
        wait_for(&project, |s| {
            let tree = s.tree.as_ref().unwrap();
            tree.node(tree.root().unwrap()).state == LoggingState::Mixed
        });

        // Recompile: id 1 keeps its state, the new id 3 defaults.
        std::fs::write(
            &manifest_path,
            r##"{ "Main.rules": { "#import": 0,
                "greet":  { "#rule": 3, "#id": 1 },
                "ponder": { "#rule": 14, "#id": 3 } } }"##,
        )
        .unwrap();
        project.request_reload();
        wait_for(&project, |s| {
            s.tree.as_ref().is_some_and(|t| t.rule(3).is_some())
        });

        let snapshot = project.snapshot();
        let tree = snapshot.tree.as_ref().unwrap();
        assert_eq!(tree.node(tree.rule(1).unwrap()).state, LoggingState::Always);
        assert_eq!(tree.node(tree.rule(3).unwrap()).state, LoggingState::Never);

        project.shutdown();
    }

    #[test]
    fn test_close_resets_model() {
        let (_dir, config) = scaffold(Some(MANIFEST));
        let project = Project::open(config).unwrap();

        project.close();
        wait_for(&project, |s| s.outcome == CompilationOutcome::NoProject);
        let snapshot = project.snapshot();
        assert!(snapshot.tree.is_none());
        assert!(snapshot.sources.is_empty());
        assert!(project.log_history().is_empty());

        project.shutdown();
    }

    #[test]
    fn test_load_reads_config_file() {
        let (dir, config) = scaffold(Some(MANIFEST));
        let config_path = dir.path().join("rulescope.toml");
        std::fs::write(&config_path, "[sync]\nmanifest_idle_ms = 200\n").unwrap();
        drop(config);

        let project = Project::load(&config_path).unwrap();
        assert_eq!(project.config().sync.manifest_idle_ms, 200);
        assert_eq!(
            project.config().source_root(),
            crate::watch::normalize_path(dir.path()).join("dialogs")
        );
        project.shutdown();
    }

    #[test]
    fn test_connect_without_url_is_harmless() {
        let (_dir, config) = scaffold(None);
        let project = Project::open(config).unwrap();
        project.connect_runtime(None);
        assert_eq!(project.snapshot().link, crate::link::LinkState::Disconnected);
        project.shutdown();
    }

    #[test]
    fn test_shutdown_is_prompt() {
        let (_dir, config) = scaffold(Some(MANIFEST));
        let project = Project::open(config).unwrap();
        let started = std::time::Instant::now();
        project.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_two_projects_are_independent() {
        let (_dir_a, config_a) = scaffold(Some(MANIFEST));
        let (_dir_b, config_b) = scaffold(Some(MANIFEST));
        let a = Project::open(config_a).unwrap();
        let b = Project::open(config_b).unwrap();

        a.set_logging_state(StateTarget::Rule(1), LoggingState::Always);
        wait_for(&a, |s| {
            let tree = s.tree.as_ref().unwrap();
            tree.node(tree.rule(1).unwrap()).state == LoggingState::Always
        });

        let b_tree = b.snapshot();
        let b_tree = b_tree.tree.as_ref().unwrap();
        assert_eq!(
            b_tree.node(b_tree.rule(1).unwrap()).state,
            LoggingState::Never
        );

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_load_missing_config_fails() {
        assert!(matches!(
            Project::load(Path::new("/definitely/not/here/rulescope.toml")),
            Err(OpenError::Config(ConfigError::Io(..)))
        ));
    }
}
