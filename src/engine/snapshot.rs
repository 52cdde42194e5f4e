//! Published model snapshots.
//!
//! The engine is the only writer; presentation reads the current snapshot
//! through an `ArcSwap` handle (acquire/release semantics), so it always
//! observes a generation that is fully old or fully new - never a tree
//! mid-rebuild.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::hierarchy::SourceFile;
use crate::link::LinkState;
use crate::model::{CompilationOutcome, RuleTree};

/// Immutable view of the model at one point in time.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    /// Monotonically increasing publication counter.
    pub generation: u64,
    /// Current tree generation; `None` before the first successful parse
    /// and after a project reset.
    pub tree: Option<Arc<RuleTree>>,
    /// Aggregate result of the generation's diagnostics.
    pub outcome: CompilationOutcome,
    /// Set when the last manifest could not be decoded at all; the tree
    /// above is then the previous generation, kept on purpose.
    pub fatal_parse: Option<String>,
    /// Interpreter connection state.
    pub link: LinkState,
    /// Path-sorted source mirror with staleness flags.
    pub sources: Arc<Vec<SourceFile>>,
}

impl ModelSnapshot {
    /// The state before any project is open.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            tree: None,
            outcome: CompilationOutcome::NoProject,
            fatal_parse: None,
            link: LinkState::Disconnected,
            sources: Arc::new(Vec::new()),
        }
    }
}

/// Shared handle to the latest snapshot.
#[derive(Clone)]
pub struct SharedModel {
    inner: Arc<ArcSwap<ModelSnapshot>>,
}

impl SharedModel {
    pub fn new(initial: ModelSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Load the current snapshot.
    pub fn load(&self) -> Arc<ModelSnapshot> {
        self.inner.load_full()
    }

    /// Publish a new snapshot (engine only).
    pub(crate) fn store(&self, snapshot: ModelSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}
