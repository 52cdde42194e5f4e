//! Engine message definitions.
//!
//! Every producer (watchers, runtime link, presentation) describes its event
//! as an [`EngineMsg`] and posts it to the mutation context; nothing mutates
//! model state directly. [`ModelEvent`] flows the other way: a broadcast
//! notification that a new snapshot is worth rendering.
//!
//! ```text
//! SourceWatcher ---Source----\
//! ManifestWatcher -ManifestReady-> Engine --ModelEvent--> presentation
//! RuntimeLink ----RuleLogged-/
//! ```

use std::{path::PathBuf, sync::Arc};

use crate::link::{LinkState, RuntimeLink};
use crate::model::{CompilationOutcome, LogEntry, LoggingState};

/// Normalized source-tree verbs emitted by the source watcher.
#[derive(Debug)]
pub enum SourceEvent {
    /// A recognized source file appeared.
    Added(PathBuf),
    /// A recognized source file's content changed.
    Changed(PathBuf),
    /// A file or directory disappeared (directories sweep their subtree).
    Removed(PathBuf),
    /// Overflow recovery: the complete recognized-file set after a rescan.
    Rescan(Vec<PathBuf>),
}

/// Which node a state assignment addresses.
///
/// Targets are resolved against the current generation, so they stay valid
/// across reloads (unlike raw node handles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTarget {
    Rule(u32),
    Import(PathBuf),
}

/// Messages to the mutation context.
pub enum EngineMsg {
    /// Source-tree change from the watcher.
    Source(SourceEvent),
    /// The manifest stabilized after a write episode (or an explicit reload
    /// was requested).
    ManifestReady,
    /// Presentation assigns a logging state.
    SetState {
        target: StateTarget,
        state: LoggingState,
    },
    /// Presentation asks the interpreter about a field.
    RequestFieldInfo(String),
    /// Presentation requests a connection to the interpreter.
    ConnectRuntime(String),
    /// Connect thread succeeded.
    RuntimeAttached(RuntimeLink),
    /// Connect thread failed.
    ConnectFailed(String),
    /// Presentation drops the connection.
    Disconnect,
    /// Reader loop observed peer close or transport failure.
    LinkClosed { reason: Option<String> },
    /// One execution trace arrived from the interpreter.
    RuleLogged { rule_id: u32, tokens: Vec<String> },
    /// Project closed: empty the model.
    Reset,
    /// Stop the engine loop.
    Shutdown,
}

/// Notifications for presentation; each one means "load a fresh snapshot".
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// Source hierarchy membership or staleness changed.
    SourcesChanged,
    /// A new tree generation was published.
    ModelReloaded(CompilationOutcome),
    /// The manifest could not be decoded; the previous generation stands.
    ReloadFailed(String),
    /// Logging states changed somewhere in the tree.
    StatesChanged,
    /// A log entry was appended to the history.
    RuleLogged(Arc<LogEntry>),
    /// The interpreter connection changed state.
    LinkChanged(LinkState),
    /// The project was closed.
    ProjectReset,
}
