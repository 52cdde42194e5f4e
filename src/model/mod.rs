//! Rule model - the in-memory mirror of one compiled manifest generation.
//!
//! ```text
//! manifest file --parse--> RuleTree --migrate states--> published generation
//! ```
//!
//! The tree is rebuilt wholesale on every reload; only logging states are
//! carried across generations, matched by rule id.

mod log;
mod manifest;
mod tree;

pub use log::{Fragment, FragmentOutcome, LogAssembler, LogEntry, LogHistory};
pub(crate) use log::now_millis;
pub use manifest::{ManifestError, parse_manifest, parse_manifest_str};
pub use tree::{Node, NodeId, NodeKind, RuleTree, StateUpdate};

use serde::{Deserialize, Serialize};

// ============================================================================
// Logging state
// ============================================================================

/// Configured verbosity for a rule's execution trace.
///
/// `Mixed` is derived for nodes whose children disagree; it is never
/// user-assigned and has no wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingState {
    Never,
    Always,
    IfTrue,
    IfFalse,
    Mixed,
}

impl LoggingState {
    /// Integer code used on the interpreter wire.
    pub fn code(self) -> Option<u8> {
        match self {
            Self::Never => Some(0),
            Self::Always => Some(1),
            Self::IfTrue => Some(2),
            Self::IfFalse => Some(3),
            Self::Mixed => None,
        }
    }

    /// Parse a wire code back into a state.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Never),
            1 => Some(Self::Always),
            2 => Some(Self::IfTrue),
            3 => Some(Self::IfFalse),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Always => "always",
            Self::IfTrue => "if-true",
            Self::IfFalse => "if-false",
            Self::Mixed => "mixed",
        }
    }
}

impl Default for LoggingState {
    fn default() -> Self {
        Self::Never
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Severity of a compiler diagnostic embedded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Warning,
    Error,
    /// The compiler could not parse part of the source at all.
    ParseFailure,
}

/// One diagnostic attached to an import during compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, line: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
        }
    }
}

// ============================================================================
// Compilation outcome
// ============================================================================

/// Aggregate result of the last compilation, derived from the diagnostics
/// present in the current tree generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationOutcome {
    Perfect,
    WithWarnings,
    WithErrors,
    Failed,
    NoProject,
    Undefined,
}

impl CompilationOutcome {
    /// Priority order: Failed > WithErrors > WithWarnings > Perfect.
    pub fn from_diagnostics<'a>(diags: impl Iterator<Item = &'a Diagnostic>) -> Self {
        let mut outcome = Self::Perfect;
        for diag in diags {
            outcome = match diag.kind {
                DiagnosticKind::ParseFailure => return Self::Failed,
                DiagnosticKind::Error => Self::WithErrors,
                DiagnosticKind::Warning if outcome == Self::Perfect => Self::WithWarnings,
                DiagnosticKind::Warning => outcome,
            };
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            LoggingState::Never,
            LoggingState::Always,
            LoggingState::IfTrue,
            LoggingState::IfFalse,
        ] {
            let code = state.code().unwrap();
            assert_eq!(LoggingState::from_code(code), Some(state));
        }
        assert_eq!(LoggingState::Mixed.code(), None);
        assert_eq!(LoggingState::from_code(9), None);
    }

    #[test]
    fn test_outcome_priority() {
        let warn = Diagnostic::new(DiagnosticKind::Warning, 1, "w");
        let err = Diagnostic::new(DiagnosticKind::Error, 2, "e");
        let fail = Diagnostic::new(DiagnosticKind::ParseFailure, 3, "f");

        assert_eq!(
            CompilationOutcome::from_diagnostics([].iter()),
            CompilationOutcome::Perfect
        );
        assert_eq!(
            CompilationOutcome::from_diagnostics([warn.clone()].iter()),
            CompilationOutcome::WithWarnings
        );
        // An error outranks any number of warnings, in either order.
        assert_eq!(
            CompilationOutcome::from_diagnostics([warn.clone(), err.clone()].iter()),
            CompilationOutcome::WithErrors
        );
        assert_eq!(
            CompilationOutcome::from_diagnostics([err.clone(), warn.clone()].iter()),
            CompilationOutcome::WithErrors
        );
        // A parse failure outranks everything.
        assert_eq!(
            CompilationOutcome::from_diagnostics([warn, err, fail].iter()),
            CompilationOutcome::Failed
        );
    }
}
