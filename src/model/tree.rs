//! Arena rule tree and logging-state propagation.
//!
//! Nodes live in a flat arena addressed by [`NodeId`]; parent links are
//! plain indices, never owning references, so the back-pointer cycle of the
//! import/rule hierarchy cannot extend any node's lifetime. Children are
//! always allocated after their parent, which lets derived-state passes run
//! as a single reverse index sweep.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use super::{CompilationOutcome, Diagnostic, LoggingState};

/// Handle to one node in a [`RuleTree`] arena.
///
/// Only valid for the tree generation it was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Role of a node plus its role-specific payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// One source file pulled into the compiled tree.
    Import {
        /// Absolute path of the source file.
        path: PathBuf,
        /// True once any descendant rule was discovered.
        contains_rules: bool,
    },
    /// One executable dialogue rule.
    Rule {
        /// Stable integer id, unique within one generation.
        id: u32,
    },
}

/// One import or rule node.
#[derive(Debug, Clone)]
pub struct Node {
    pub label: String,
    pub source_line: u32,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub diagnostics: Vec<Diagnostic>,
    pub state: LoggingState,
}

impl Node {
    pub fn is_import(&self) -> bool {
        matches!(self.kind, NodeKind::Import { .. })
    }

    pub fn is_rule(&self) -> bool {
        matches!(self.kind, NodeKind::Rule { .. })
    }

    pub fn rule_id(&self) -> Option<u32> {
        match self.kind {
            NodeKind::Rule { id } => Some(id),
            NodeKind::Import { .. } => None,
        }
    }

    pub fn import_path(&self) -> Option<&Path> {
        match &self.kind {
            NodeKind::Import { path, .. } => Some(path),
            NodeKind::Rule { .. } => None,
        }
    }

    /// True for imports that hold at least one rule somewhere below;
    /// presentation skips rendering imports without any.
    pub fn contains_rules(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Import {
                contains_rules: true,
                ..
            }
        )
    }
}

/// Result of one state assignment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// Any node's state changed (assignment was not a no-op).
    pub changed: bool,
    /// Rules whose assigned state changed, for the outgoing link.
    pub rules: Vec<(u32, LoggingState)>,
}

/// One generation of the compiled rule/import hierarchy.
///
/// Replaced wholesale on reload; the id and path indices are rebuilt
/// atomically with the arena they point into.
#[derive(Debug, Clone, Default)]
pub struct RuleTree {
    nodes: Vec<Node>,
    rules: FxHashMap<u32, NodeId>,
    imports: FxHashMap<PathBuf, NodeId>,
}

impl RuleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The single top-level import, if the tree has been built.
    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Look up a rule node by its stable id.
    pub fn rule(&self, rule_id: u32) -> Option<NodeId> {
        self.rules.get(&rule_id).copied()
    }

    /// Look up an import node by its absolute path.
    pub fn import(&self, path: &Path) -> Option<NodeId> {
        self.imports.get(path).copied()
    }

    /// Iterate all nodes in allocation order (parents before children).
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// All diagnostics of this generation, in tree order.
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.nodes.iter().flat_map(|n| n.diagnostics.iter())
    }

    /// Aggregate outcome of this generation.
    pub fn outcome(&self) -> CompilationOutcome {
        CompilationOutcome::from_diagnostics(self.diagnostics())
    }

    /// Nearest ancestor import of `id` (or `id` itself when it is one).
    pub fn owning_import(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.node(current).is_import() {
                return Some(current);
            }
            cursor = self.node(current).parent;
        }
        None
    }

    // ------------------------------------------------------------------
    // construction
    // ------------------------------------------------------------------

    /// Add an import node. Returns `None` when another import already
    /// claimed the same absolute path in this generation.
    pub fn add_import(
        &mut self,
        label: impl Into<String>,
        source_line: u32,
        path: PathBuf,
        parent: Option<NodeId>,
    ) -> Option<NodeId> {
        if self.imports.contains_key(&path) {
            return None;
        }
        let id = self.push(Node {
            label: label.into(),
            source_line,
            kind: NodeKind::Import {
                path: path.clone(),
                contains_rules: false,
            },
            parent,
            children: Vec::new(),
            diagnostics: Vec::new(),
            state: LoggingState::default(),
        });
        self.imports.insert(path, id);
        Some(id)
    }

    /// Add a rule node. Returns `None` when the id is already taken in this
    /// generation.
    pub fn add_rule(
        &mut self,
        label: impl Into<String>,
        source_line: u32,
        rule_id: u32,
        parent: Option<NodeId>,
    ) -> Option<NodeId> {
        if self.rules.contains_key(&rule_id) {
            return None;
        }
        let id = self.push(Node {
            label: label.into(),
            source_line,
            kind: NodeKind::Rule { id: rule_id },
            parent,
            children: Vec::new(),
            diagnostics: Vec::new(),
            state: LoggingState::default(),
        });
        self.rules.insert(rule_id, id);
        self.mark_contains_rules(id);
        Some(id)
    }

    fn push(&mut self, node: Node) -> NodeId {
        let parent = node.parent;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        if let Some(parent) = parent {
            debug_assert!(parent.index() < id.index(), "children allocate after parents");
            self.nodes[parent.index()].children.push(id);
        }
        id
    }

    /// Attach a diagnostic to a node.
    pub fn push_diagnostic(&mut self, id: NodeId, diagnostic: Diagnostic) {
        self.node_mut(id).diagnostics.push(diagnostic);
    }

    /// Flag every import on the ancestor chain of a freshly added rule.
    fn mark_contains_rules(&mut self, from: NodeId) {
        let mut cursor = self.node(from).parent;
        while let Some(current) = cursor {
            if let NodeKind::Import { contains_rules, .. } = &mut self.node_mut(current).kind {
                if *contains_rules {
                    break;
                }
                *contains_rules = true;
            }
            cursor = self.node(current).parent;
        }
    }

    // ------------------------------------------------------------------
    // state propagation
    // ------------------------------------------------------------------

    /// Assign a logging state and re-establish the tree invariant.
    ///
    /// A node with children cascades the assignment to its whole subtree
    /// (the subtree becomes uniform); ancestors are then recomputed upward,
    /// stopping at the first one whose derived state did not change.
    ///
    /// Returns which rules actually changed, for the outgoing interpreter
    /// link. `Mixed` is derived-only and is refused.
    pub fn set_state(&mut self, id: NodeId, state: LoggingState) -> StateUpdate {
        if state == LoggingState::Mixed {
            crate::debug!("model"; "ignoring direct Mixed assignment on `{}`", self.node(id).label);
            return StateUpdate::default();
        }

        let mut update = StateUpdate::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node_mut(current);
            if node.state != state {
                node.state = state;
                update.changed = true;
                if let Some(rule_id) = node.rule_id() {
                    update.rules.push((rule_id, state));
                }
            }
            stack.extend(self.node(current).children.iter().copied());
        }

        self.recompute_upward(self.node(id).parent);
        update
    }

    /// Recompute derived states from `from` toward the root, stopping early
    /// once an ancestor's state is unaffected.
    fn recompute_upward(&mut self, from: Option<NodeId>) {
        let mut cursor = from;
        while let Some(current) = cursor {
            let derived = self.derived_state(current);
            if self.node(current).state == derived {
                break;
            }
            self.node_mut(current).state = derived;
            cursor = self.node(current).parent;
        }
    }

    /// The state a node must expose: the children's common state when they
    /// agree, `Mixed` when they do not, its own state when it has none.
    fn derived_state(&self, id: NodeId) -> LoggingState {
        let node = self.node(id);
        let mut children = node.children.iter();
        let Some(first) = children.next() else {
            return node.state;
        };
        let first_state = self.node(*first).state;
        if children.all(|c| self.node(*c).state == first_state) {
            first_state
        } else {
            LoggingState::Mixed
        }
    }

    // ------------------------------------------------------------------
    // cross-generation migration
    // ------------------------------------------------------------------

    /// Snapshot of assigned rule states, keyed by rule id.
    pub fn rule_states(&self) -> FxHashMap<u32, LoggingState> {
        self.rules
            .iter()
            .map(|(rule_id, node_id)| (*rule_id, self.node(*node_id).state))
            .collect()
    }

    /// Insert states from a previous generation by rule id, then rebuild
    /// every derived state bottom-up. Ids unknown to this generation are
    /// dropped; rules absent from `states` keep the `Never` default.
    pub fn migrate_states(&mut self, states: &FxHashMap<u32, LoggingState>) {
        for (rule_id, state) in states {
            if *state == LoggingState::Mixed {
                continue;
            }
            if let Some(node_id) = self.rules.get(rule_id).copied() {
                self.node_mut(node_id).state = *state;
            }
        }
        self.recompute_derived();
    }

    /// One reverse sweep: children allocate after parents, so walking the
    /// arena backwards visits every child before its parent.
    fn recompute_derived(&mut self) {
        for index in (0..self.nodes.len()).rev() {
            let id = NodeId(index as u32);
            if !self.node(id).children.is_empty() {
                let derived = self.derived_state(id);
                self.node_mut(id).state = derived;
            }
        }
    }

    /// Check invariant 3 over the whole tree (test support).
    #[cfg(test)]
    pub fn holds_state_invariant(&self) -> bool {
        self.iter().all(|(id, node)| {
            node.children.is_empty() || node.state == self.derived_state(id)
        })
    }
}
