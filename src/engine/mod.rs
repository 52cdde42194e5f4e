//! Engine - the serialized mutation context.
//!
//! All model state lives here and is touched by exactly one task: the
//! watchers, the runtime link and presentation are producers posting
//! [`EngineMsg`] values; the engine drains them in order, applies them, and
//! republishes an immutable snapshot after every effective change. Readers
//! therefore always observe a generation that is fully old or fully new.
//!
//! ```text
//!                  +--------- EngineMsg channel ----------+
//! SourceWatcher -->|                                      |
//! ManifestWatcher->|  Engine (single task)                |--> SharedModel
//! RuntimeLink ---->|   hierarchy / tree / link / history  |--> ModelEvent
//! presentation --->|                                      |
//!                  +--------------------------------------+
//! ```

mod messages;
mod snapshot;

pub use messages::{EngineMsg, ModelEvent, SourceEvent, StateTarget};
pub use snapshot::{ModelSnapshot, SharedModel};

use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::config::ProjectConfig;
use crate::hierarchy::{SourceFile, SourceHierarchy};
use crate::link::{Command, LinkState, RuntimeLink};
use crate::model::{
    self, CompilationOutcome, LogAssembler, LogHistory, LoggingState, RuleTree,
};
use crate::{debug, log};

/// The mutation context.
pub(crate) struct Engine {
    rx: mpsc::Receiver<EngineMsg>,
    /// Clone of the inbound channel, handed to connect threads and the link
    /// reader so their results come back through the same serialized queue.
    loopback: mpsc::Sender<EngineMsg>,
    config: Arc<ProjectConfig>,
    events: broadcast::Sender<ModelEvent>,
    shared: SharedModel,

    hierarchy: SourceHierarchy,
    sources: Arc<Vec<SourceFile>>,
    tree: Option<RuleTree>,
    outcome: CompilationOutcome,
    fatal_parse: Option<String>,

    link: Option<RuntimeLink>,
    link_state: LinkState,
    assembler: LogAssembler,
    history: Arc<Mutex<LogHistory>>,

    generation: u64,
}

impl Engine {
    /// Seed the model: hierarchy from the initial scan, tree from the
    /// manifest when one already exists. Publishes the first snapshot
    /// before any actor runs.
    pub(crate) fn new(
        rx: mpsc::Receiver<EngineMsg>,
        loopback: mpsc::Sender<EngineMsg>,
        config: Arc<ProjectConfig>,
        events: broadcast::Sender<ModelEvent>,
        history: Arc<Mutex<LogHistory>>,
        initial_files: Vec<PathBuf>,
    ) -> Self {
        let mut engine = Self {
            rx,
            loopback,
            config,
            events,
            shared: SharedModel::new(ModelSnapshot::empty()),
            hierarchy: SourceHierarchy::seed(initial_files),
            sources: Arc::new(Vec::new()),
            tree: None,
            outcome: CompilationOutcome::Undefined,
            fatal_parse: None,
            link: None,
            link_state: LinkState::Disconnected,
            assembler: LogAssembler::new(),
            history,
            generation: 0,
        };

        if engine.config.manifest_path().exists() {
            engine.load_manifest();
        }
        engine.refresh_sources();
        engine.publish();
        engine
    }

    /// Handle for readers; valid before the engine runs.
    pub(crate) fn shared(&self) -> SharedModel {
        self.shared.clone()
    }

    /// Run the mutation loop until `Shutdown` or all senders hang up.
    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            let stop = matches!(msg, EngineMsg::Shutdown);
            self.apply(msg);
            if stop {
                break;
            }
        }
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        debug!("engine"; "stopped");
    }

    fn apply(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Source(event) => self.apply_source(event),
            EngineMsg::ManifestReady => self.reload(),
            EngineMsg::SetState { target, state } => self.apply_set_state(&target, state),
            EngineMsg::RequestFieldInfo(field) => match &self.link {
                Some(link) => link.send(&Command::ReqFieldInfo { field }),
                None => debug!("link"; "field info for `{}` requested while disconnected", field),
            },
            EngineMsg::ConnectRuntime(url) => self.connect(url),
            EngineMsg::RuntimeAttached(link) => self.attach(link),
            EngineMsg::ConnectFailed(reason) => {
                log!("link"; "connect failed: {}", reason);
                self.set_link_state(LinkState::Disconnected);
            }
            EngineMsg::Disconnect => self.disconnect(),
            EngineMsg::LinkClosed { reason } => {
                match reason {
                    Some(reason) => log!("link"; "connection lost: {}", reason),
                    None => log!("link"; "interpreter closed the connection"),
                }
                if let Some(mut link) = self.link.take() {
                    link.shutdown();
                }
                self.set_link_state(LinkState::Disconnected);
            }
            EngineMsg::RuleLogged { rule_id, tokens } => self.apply_rule_logged(rule_id, &tokens),
            EngineMsg::Reset => self.reset(),
            EngineMsg::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // sources
    // ------------------------------------------------------------------

    fn apply_source(&mut self, event: SourceEvent) {
        let changed = match event {
            SourceEvent::Added(path) => self.hierarchy.add(path),
            SourceEvent::Changed(path) => self.hierarchy.touch(path),
            SourceEvent::Removed(path) => self.hierarchy.remove(&path) > 0,
            SourceEvent::Rescan(files) => self.hierarchy.reconcile(files.into_iter().collect()),
        };
        if changed {
            self.refresh_sources();
            self.publish();
            self.emit(ModelEvent::SourcesChanged);
        }
    }

    // ------------------------------------------------------------------
    // manifest reload
    // ------------------------------------------------------------------

    fn reload(&mut self) {
        if self.load_manifest() {
            self.refresh_sources();
            self.publish();
            self.emit(ModelEvent::ModelReloaded(self.outcome));
        } else {
            let reason = self.fatal_parse.clone().unwrap_or_default();
            self.publish();
            self.emit(ModelEvent::ReloadFailed(reason));
        }
    }

    /// Parse the manifest into a fresh generation and migrate logging
    /// states from the previous one by rule id.
    ///
    /// On decode failure the previous tree stands; the snapshot reports
    /// `Failed` plus a fatal-parse message so "no manifest yet" and
    /// "manifest undecodable" stay distinguishable.
    fn load_manifest(&mut self) -> bool {
        let path = self.config.manifest_path();
        match model::parse_manifest(&path, &self.config.source_root()) {
            Ok(mut tree) => {
                if let Some(previous) = &self.tree {
                    tree.migrate_states(&previous.rule_states());
                }
                self.outcome = tree.outcome();
                self.fatal_parse = None;
                self.tree = Some(tree);
                // The build that wrote this manifest consumed the sources.
                self.hierarchy.clear_modified();
                true
            }
            Err(e) => {
                log!("model"; "manifest decode failed: {}", e);
                self.fatal_parse = Some(e.to_string());
                self.outcome = CompilationOutcome::Failed;
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // logging states
    // ------------------------------------------------------------------

    fn apply_set_state(&mut self, target: &StateTarget, state: LoggingState) {
        let Some(tree) = self.tree.as_mut() else {
            log!("model"; "state assignment with no model loaded");
            return;
        };
        let node = match target {
            StateTarget::Rule(rule_id) => tree.rule(*rule_id),
            StateTarget::Import(path) => tree.import(path),
        };
        let Some(node) = node else {
            log!("model"; "state target {:?} not in current generation", target);
            return;
        };

        let update = tree.set_state(node, state);
        if !update.changed {
            return;
        }

        // Local state is already applied (optimistic); delivery of the
        // verbosity hints is best-effort.
        if let Some(link) = &self.link {
            for (rule_id, state) in &update.rules {
                if let Some(code) = state.code() {
                    link.send(&Command::SetLogStat {
                        rule_id: *rule_id,
                        state_code: code,
                    });
                }
            }
        }

        self.publish();
        self.emit(ModelEvent::StatesChanged);
    }

    // ------------------------------------------------------------------
    // runtime link
    // ------------------------------------------------------------------

    fn connect(&mut self, url: String) {
        if self.link_state != LinkState::Disconnected {
            log!("link"; "connect requested while {}", self.link_state.label());
            return;
        }
        self.set_link_state(LinkState::Connecting);

        // Dial on a throwaway thread; the result loops back as a message.
        let loopback = self.loopback.clone();
        std::thread::spawn(move || {
            let msg = match RuntimeLink::connect(&url, loopback.clone()) {
                Ok(link) => EngineMsg::RuntimeAttached(link),
                Err(e) => EngineMsg::ConnectFailed(e.to_string()),
            };
            let _ = loopback.blocking_send(msg);
        });
    }

    fn attach(&mut self, mut link: RuntimeLink) {
        if self.link_state != LinkState::Connecting {
            // A disconnect raced the handshake; the fresh socket is stale.
            link.shutdown();
            return;
        }
        self.link = Some(link);
        self.set_link_state(LinkState::Connected);
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        self.set_link_state(LinkState::Disconnected);
    }

    fn set_link_state(&mut self, state: LinkState) {
        if self.link_state == state {
            return;
        }
        debug!("link"; "{} -> {}", self.link_state.label(), state.label());
        self.link_state = state;
        self.publish();
        self.emit(ModelEvent::LinkChanged(state));
    }

    fn apply_rule_logged(&mut self, rule_id: u32, tokens: &[String]) {
        let label = self
            .tree
            .as_ref()
            .and_then(|tree| tree.rule(rule_id).map(|n| tree.node(n).label.clone()))
            .unwrap_or_else(|| {
                debug!("link"; "trace for rule id {} outside the current generation", rule_id);
                format!("rule {rule_id}")
            });

        let entry = Arc::new(
            self.assembler
                .assemble(rule_id, label, tokens, model::now_millis()),
        );
        self.history.lock().push(Arc::clone(&entry));
        self.emit(ModelEvent::RuleLogged(entry));
    }

    // ------------------------------------------------------------------
    // reset & publication
    // ------------------------------------------------------------------

    /// Project closed: empty tree, indices invalidated, history cleared.
    fn reset(&mut self) {
        self.tree = None;
        self.outcome = CompilationOutcome::NoProject;
        self.fatal_parse = None;
        self.hierarchy.clear();
        self.history.lock().clear();
        self.refresh_sources();
        self.publish();
        self.emit(ModelEvent::ProjectReset);
    }

    fn refresh_sources(&mut self) {
        self.sources = Arc::new(self.hierarchy.snapshot());
    }

    /// Publish the current state wholesale; readers swap atomically.
    fn publish(&mut self) {
        self.generation += 1;
        self.shared.store(ModelSnapshot {
            generation: self.generation,
            tree: self.tree.clone().map(Arc::new),
            outcome: self.outcome,
            fatal_parse: self.fatal_parse.clone(),
            link: self.link_state,
            sources: Arc::clone(&self.sources),
        });
    }

    fn emit(&self, event: ModelEvent) {
        // No subscribers is fine; presentation may not be attached yet.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TWO_RULES: &str = r##"{ "Main.rules": { "#import": 0,
        "greet":    { "#rule": 3, "#id": 1 },
        "farewell": { "#rule": 9, "#id": 2 } } }"##;

    const THREE_RULES: &str = r##"{ "Main.rules": { "#import": 0,
        "greet":    { "#rule": 3, "#id": 1 },
        "farewell": { "#rule": 9, "#id": 2 },
        "ponder":   { "#rule": 14, "#id": 3 } } }"##;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Arc<ProjectConfig>,
        tx: mpsc::Sender<EngineMsg>,
        events: broadcast::Receiver<ModelEvent>,
        shared: SharedModel,
        history: Arc<Mutex<LogHistory>>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_engine(manifest: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.root = dir.path().to_path_buf();
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::create_dir_all(config.generated_dir()).unwrap();
        if let Some(content) = manifest {
            std::fs::write(config.manifest_path(), content).unwrap();
        }
        let config = Arc::new(config);

        let (tx, rx) = mpsc::channel(32);
        let (events_tx, events) = broadcast::channel(64);
        let history = Arc::new(Mutex::new(LogHistory::new(16)));
        let engine = Engine::new(
            rx,
            tx.clone(),
            Arc::clone(&config),
            events_tx,
            Arc::clone(&history),
            Vec::new(),
        );
        let shared = engine.shared();
        let handle = tokio::spawn(engine.run());

        Fixture {
            _dir: dir,
            config,
            tx,
            events,
            shared,
            history,
            handle,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ModelEvent>) -> ModelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a model event")
            .expect("event channel closed")
    }

    fn rule_state(snapshot: &ModelSnapshot, rule_id: u32) -> LoggingState {
        let tree = snapshot.tree.as_ref().unwrap();
        tree.node(tree.rule(rule_id).unwrap()).state
    }

    fn root_state(snapshot: &ModelSnapshot) -> LoggingState {
        let tree = snapshot.tree.as_ref().unwrap();
        tree.node(tree.root().unwrap()).state
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_initial_load_and_state_scenario() {
        runtime().block_on(async {
            let mut fx = spawn_engine(Some(TWO_RULES));

            let snapshot = fx.shared.load();
            assert_eq!(snapshot.outcome, CompilationOutcome::Perfect);
            assert_eq!(root_state(&snapshot), LoggingState::Never);

            // id 1 -> Always while id 2 stays Never: the import is mixed.
            fx.tx
                .send(EngineMsg::SetState {
                    target: StateTarget::Rule(1),
                    state: LoggingState::Always,
                })
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::StatesChanged));
            assert_eq!(root_state(&fx.shared.load()), LoggingState::Mixed);

            // id 2 -> Always as well: the import becomes uniform.
            fx.tx
                .send(EngineMsg::SetState {
                    target: StateTarget::Rule(2),
                    state: LoggingState::Always,
                })
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::StatesChanged));
            assert_eq!(root_state(&fx.shared.load()), LoggingState::Always);

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }

    #[test]
    fn test_reload_migrates_states_and_failure_keeps_tree() {
        runtime().block_on(async {
            let mut fx = spawn_engine(Some(TWO_RULES));

            fx.tx
                .send(EngineMsg::SetState {
                    target: StateTarget::Rule(1),
                    state: LoggingState::Always,
                })
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::StatesChanged));

            // Recompilation adds rule 3; id 1 must keep its state.
            std::fs::write(fx.config.manifest_path(), THREE_RULES).unwrap();
            fx.tx.send(EngineMsg::ManifestReady).await.unwrap();
            assert!(matches!(
                next_event(&mut fx.events).await,
                ModelEvent::ModelReloaded(CompilationOutcome::Perfect)
            ));

            let snapshot = fx.shared.load();
            assert_eq!(rule_state(&snapshot, 1), LoggingState::Always);
            assert_eq!(rule_state(&snapshot, 3), LoggingState::Never);
            assert_eq!(root_state(&snapshot), LoggingState::Mixed);
            let reload_generation = snapshot.generation;

            // An undecodable manifest keeps the previous generation and
            // surfaces a distinct fatal-parse failure.
            std::fs::write(fx.config.manifest_path(), "{ not json").unwrap();
            fx.tx.send(EngineMsg::ManifestReady).await.unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::ReloadFailed(_)));

            let snapshot = fx.shared.load();
            assert!(snapshot.generation > reload_generation);
            assert_eq!(snapshot.outcome, CompilationOutcome::Failed);
            assert!(snapshot.fatal_parse.is_some());
            assert!(snapshot.tree.as_ref().unwrap().rule(3).is_some());

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }

    #[test]
    fn test_source_events_and_reset() {
        runtime().block_on(async {
            let mut fx = spawn_engine(None);
            assert_eq!(fx.shared.load().outcome, CompilationOutcome::Undefined);

            let file = fx.config.source_root().join("main.rules");
            fx.tx
                .send(EngineMsg::Source(SourceEvent::Added(file.clone())))
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::SourcesChanged));

            let snapshot = fx.shared.load();
            assert_eq!(snapshot.sources.len(), 1);
            assert!(snapshot.sources[0].modified_since_build);

            fx.tx
                .send(EngineMsg::Source(SourceEvent::Removed(file)))
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::SourcesChanged));
            assert!(fx.shared.load().sources.is_empty());

            fx.tx.send(EngineMsg::Reset).await.unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::ProjectReset));
            let snapshot = fx.shared.load();
            assert_eq!(snapshot.outcome, CompilationOutcome::NoProject);
            assert!(snapshot.tree.is_none());

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }

    #[test]
    fn test_rule_logged_resolves_label_and_orders_entries() {
        runtime().block_on(async {
            let mut fx = spawn_engine(Some(TWO_RULES));

            fx.tx
                .send(EngineMsg::RuleLogged {
                    rule_id: 1,
                    tokens: vec!["true".into(), "skip".into()],
                })
                .await
                .unwrap();
            let ModelEvent::RuleLogged(entry) = next_event(&mut fx.events).await else {
                panic!("expected a RuleLogged event");
            };
            assert_eq!(entry.label().text, "greet");
            assert_eq!(entry.body().len(), 2);

            // Unknown ids still produce an entry with a fallback label.
            fx.tx
                .send(EngineMsg::RuleLogged {
                    rule_id: 99,
                    tokens: vec![],
                })
                .await
                .unwrap();
            let ModelEvent::RuleLogged(entry) = next_event(&mut fx.events).await else {
                panic!("expected a RuleLogged event");
            };
            assert_eq!(entry.label().text, "rule 99");

            assert_eq!(fx.history.lock().len(), 2);

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }

    #[test]
    fn test_set_state_without_target_is_ignored() {
        runtime().block_on(async {
            let fx = spawn_engine(Some(TWO_RULES));
            let before = fx.shared.load().generation;

            fx.tx
                .send(EngineMsg::SetState {
                    target: StateTarget::Rule(42),
                    state: LoggingState::Always,
                })
                .await
                .unwrap();
            // Unknown target: no publication. Give the engine a beat.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(fx.shared.load().generation, before);

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }

    #[test]
    fn test_import_target_resolves_by_path() {
        runtime().block_on(async {
            let mut fx = spawn_engine(Some(TWO_RULES));
            let import_path = fx.config.source_root().join("Main.rules");

            fx.tx
                .send(EngineMsg::SetState {
                    target: StateTarget::Import(import_path),
                    state: LoggingState::IfTrue,
                })
                .await
                .unwrap();
            assert!(matches!(next_event(&mut fx.events).await, ModelEvent::StatesChanged));

            let snapshot = fx.shared.load();
            assert_eq!(root_state(&snapshot), LoggingState::IfTrue);
            assert_eq!(rule_state(&snapshot, 1), LoggingState::IfTrue);
            assert_eq!(rule_state(&snapshot, 2), LoggingState::IfTrue);

            fx.tx.send(EngineMsg::Shutdown).await.unwrap();
            fx.handle.await.unwrap();
        });
    }
}
