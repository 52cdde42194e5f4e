//! Rulescope - rule model synchronization core for a live dialogue-rule
//! debugger.
//!
//! The compiler for a rule-based dialogue engine runs externally and writes
//! a hierarchical manifest; a separately running interpreter executes the
//! compiled rules. This crate keeps an in-memory model of that manifest
//! synchronized with source edits, recompilations and the interpreter:
//!
//! - [`watch`]: filesystem watchers for the source tree and the manifest
//! - [`hierarchy`]: mirror of the source files with staleness flags
//! - [`model`]: manifest parsing, the rule tree, state propagation, logs
//! - [`link`]: the live connection to the interpreter process
//! - [`engine`]: the single serialized mutation context and its snapshots
//! - [`project`]: the context object an embedding application holds
//!
//! There is no UI in here. Presentation layers read snapshots through
//! [`Project::snapshot`], subscribe to [`ModelEvent`]s, and invoke the
//! operations on [`Project`].

pub mod config;
pub mod engine;
pub mod hierarchy;
pub mod link;
pub mod logger;
pub mod model;
pub mod project;
pub mod watch;

pub use config::{ConfigError, ProjectConfig};
pub use engine::{ModelEvent, ModelSnapshot, SharedModel, StateTarget};
pub use hierarchy::SourceFile;
pub use link::LinkState;
pub use model::{
    CompilationOutcome, Diagnostic, DiagnosticKind, Fragment, FragmentOutcome, LogEntry,
    LoggingState, Node, NodeId, NodeKind, RuleTree,
};
pub use project::{OpenError, Project};
pub use watch::WatchError;
