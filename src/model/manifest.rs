//! Manifest decoding.
//!
//! The compiler writes one manifest per project: a nested JSON mapping keyed
//! by labels, decoded here with key order preserved (children are ordered).
//! Sentinel keys inside an entry describe its role:
//!
//! ```text
//! {
//!   "Main.rules": {                      // label of the root import
//!     "#import": 0,                      // import marker + source line
//!     "greet": { "#rule": 3, "#id": 1 }, // rule marker + line, stable id
//!     "!error:12": "unknown slot `x`",   // diagnostic at line 12
//!     "Util.rules": { "#import": 1 }     // nested import
//!   }
//! }
//! ```
//!
//! Sentinel and diagnostic keys are stripped before the remaining keys are
//! treated as children. Exactly one top-level entry is expected, and it must
//! be an import. A malformed sub-entry becomes a `ParseFailure` diagnostic
//! while its siblings keep parsing; only an undecodable file is fatal.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use thiserror::Error;

use super::{Diagnostic, DiagnosticKind, NodeId, RuleTree};

const IMPORT_LINE_KEY: &str = "#import";
const RULE_LINE_KEY: &str = "#rule";
const RULE_ID_KEY: &str = "#id";
const DIAG_MARKER: char = '!';

/// Fatal decode failures: the file as a whole cannot be interpreted.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("manifest is not valid JSON")]
    Json(#[from] serde_json::Error),

    #[error("manifest root is not a mapping")]
    NotAMapping,

    #[error("manifest describes no top-level entry")]
    EmptyRoot,

    #[error("manifest describes {0} top-level entries, expected exactly one")]
    MultipleRoots(usize),

    #[error("top-level entry `{0}` is not an import")]
    RootNotImport(String),
}

/// Decode the manifest file at `path` into a fresh tree generation.
pub fn parse_manifest(path: &Path, source_root: &Path) -> Result<RuleTree, ManifestError> {
    let content = fs::read_to_string(path).map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
    parse_manifest_str(&content, source_root)
}

/// Decode manifest text into a fresh tree generation.
pub fn parse_manifest_str(content: &str, source_root: &Path) -> Result<RuleTree, ManifestError> {
    let value: Value = serde_json::from_str(content)?;
    let Value::Object(entries) = value else {
        return Err(ManifestError::NotAMapping);
    };

    match entries.len() {
        0 => return Err(ManifestError::EmptyRoot),
        1 => {}
        n => return Err(ManifestError::MultipleRoots(n)),
    }

    let Some((label, entry)) = entries.iter().next() else {
        return Err(ManifestError::EmptyRoot);
    };
    let Value::Object(entry) = entry else {
        return Err(ManifestError::RootNotImport(label.clone()));
    };
    if !entry.contains_key(IMPORT_LINE_KEY) {
        return Err(ManifestError::RootNotImport(label.clone()));
    }

    let mut tree = RuleTree::new();
    build_entry(&mut tree, label, entry, None, source_root);
    if tree.is_empty() {
        // The root import itself was malformed; there is no node to carry
        // a diagnostic, so the whole decode fails.
        return Err(ManifestError::RootNotImport(label.clone()));
    }
    Ok(tree)
}

/// Build one labeled entry. Malformed entries degrade to a `ParseFailure`
/// diagnostic on the nearest built ancestor; siblings are unaffected.
fn build_entry(
    tree: &mut RuleTree,
    label: &str,
    entry: &Map<String, Value>,
    parent: Option<NodeId>,
    source_root: &Path,
) {
    let node = if let Some(line_value) = entry.get(IMPORT_LINE_KEY) {
        build_import(tree, label, line_value, parent, source_root)
    } else if let Some(line_value) = entry.get(RULE_LINE_KEY) {
        build_rule(tree, label, line_value, entry.get(RULE_ID_KEY), parent)
    } else {
        report(
            tree,
            parent,
            0,
            format!("entry `{label}` carries neither an import nor a rule marker"),
        );
        return;
    };

    let Some(node) = node else {
        return;
    };

    for (key, value) in entry {
        if key == IMPORT_LINE_KEY || key == RULE_LINE_KEY || key == RULE_ID_KEY {
            continue;
        }
        if key.starts_with(DIAG_MARKER) {
            attach_diagnostic(tree, node, key, value);
            continue;
        }
        match value {
            Value::Object(child) => build_entry(tree, key, child, Some(node), source_root),
            _ => {
                let line = tree.node(node).source_line;
                report(tree, Some(node), line, format!("child `{key}` is not a mapping"));
            }
        }
    }
}

fn build_import(
    tree: &mut RuleTree,
    label: &str,
    line_value: &Value,
    parent: Option<NodeId>,
    source_root: &Path,
) -> Option<NodeId> {
    let Some(line) = as_line(line_value) else {
        report(
            tree,
            parent,
            0,
            format!("import `{label}` has a malformed line number"),
        );
        return None;
    };

    let path = resolve_source_path(label, source_root);
    let node = tree.add_import(label, line, path, parent);
    if node.is_none() {
        report(
            tree,
            parent,
            line,
            format!("import `{label}` resolves to a path already imported"),
        );
    }
    node
}

fn build_rule(
    tree: &mut RuleTree,
    label: &str,
    line_value: &Value,
    id_value: Option<&Value>,
    parent: Option<NodeId>,
) -> Option<NodeId> {
    let Some(line) = as_line(line_value) else {
        report(
            tree,
            parent,
            0,
            format!("rule `{label}` has a malformed line number"),
        );
        return None;
    };
    let Some(rule_id) = id_value.and_then(as_line) else {
        report(
            tree,
            parent,
            line,
            format!("rule `{label}` is missing a numeric id"),
        );
        return None;
    };

    let node = tree.add_rule(label, line, rule_id, parent);
    if node.is_none() {
        report(
            tree,
            parent,
            line,
            format!("rule `{label}` reuses id {rule_id}"),
        );
    }
    node
}

/// Decode a `!<kind>:<line>` key; the value is the message text.
fn attach_diagnostic(tree: &mut RuleTree, node: NodeId, key: &str, value: &Value) {
    let parsed = key[DIAG_MARKER.len_utf8()..]
        .split_once(':')
        .and_then(|(kind, line)| {
            let kind = match kind {
                "error" => DiagnosticKind::Error,
                "warning" => DiagnosticKind::Warning,
                "failure" => DiagnosticKind::ParseFailure,
                _ => return None,
            };
            line.parse::<u32>().ok().map(|line| (kind, line))
        });

    match (parsed, value.as_str()) {
        (Some((kind, line)), Some(message)) => {
            tree.push_diagnostic(node, Diagnostic::new(kind, line, message));
        }
        _ => {
            let line = tree.node(node).source_line;
            report(tree, Some(node), line, format!("malformed diagnostic entry `{key}`"));
        }
    }
}

/// Record a `ParseFailure` on the nearest built node. Entries malformed
/// before anything was built (a broken root) are already fatal upstream.
fn report(tree: &mut RuleTree, node: Option<NodeId>, line: u32, message: String) {
    crate::debug!("model"; "manifest: {message}");
    if let Some(node) = node {
        tree.push_diagnostic(node, Diagnostic::new(DiagnosticKind::ParseFailure, line, message));
    }
}

/// An import's label is its source path relative to the source root.
fn resolve_source_path(label: &str, source_root: &Path) -> PathBuf {
    let path = Path::new(label);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        source_root.join(path)
    }
}

fn as_line(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompilationOutcome, LoggingState};

    fn root() -> &'static Path {
        Path::new("/proj/dialogs")
    }

    #[test]
    fn test_fresh_project_load() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0, "greet": { "#rule": 3, "#id": 1 } } }"##,
            root(),
        )
        .unwrap();

        assert_eq!(tree.outcome(), CompilationOutcome::Perfect);

        let rule = tree.rule(1).expect("id index must hold rule 1");
        assert_eq!(tree.node(rule).label, "greet");
        assert_eq!(tree.node(rule).source_line, 3);

        let top = tree.root().unwrap();
        assert_eq!(tree.node(top).state, LoggingState::Never);
        assert_eq!(
            tree.node(top).import_path(),
            Some(Path::new("/proj/dialogs/Main.rules"))
        );
        assert!(tree.node(top).contains_rules());
    }

    #[test]
    fn test_children_keep_manifest_order() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "zeta":  { "#rule": 1, "#id": 1 },
                "alpha": { "#rule": 2, "#id": 2 },
                "mid":   { "#rule": 3, "#id": 3 } } }"##,
            root(),
        )
        .unwrap();

        let top = tree.root().unwrap();
        let labels: Vec<&str> = tree.node(top)
            .children
            .iter()
            .map(|c| tree.node(*c).label.as_str())
            .collect();
        assert_eq!(labels, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_diagnostics_extracted_and_stripped() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "!error:12": "unknown slot `x`",
                "!warning:4": "unused rule",
                "greet": { "#rule": 3, "#id": 1 } } }"##,
            root(),
        )
        .unwrap();

        let top = tree.root().unwrap();
        // Diagnostic keys never become children.
        assert_eq!(tree.node(top).children.len(), 1);

        let diags: Vec<_> = tree.diagnostics().collect();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].kind, DiagnosticKind::Error);
        assert_eq!(diags[0].line, 12);
        assert_eq!(diags[0].message, "unknown slot `x`");

        assert_eq!(tree.outcome(), CompilationOutcome::WithErrors);
    }

    #[test]
    fn test_parse_failure_dominates_outcome() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "!error:1": "boom",
                "!failure:0": "unreadable block" } }"##,
            root(),
        )
        .unwrap();
        assert_eq!(tree.outcome(), CompilationOutcome::Failed);
    }

    #[test]
    fn test_malformed_sub_entry_keeps_siblings() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "broken": { "#rule": 5 },
                "greet":  { "#rule": 3, "#id": 1 } } }"##,
            root(),
        )
        .unwrap();

        // The sibling survived, the broken entry became a diagnostic.
        assert!(tree.rule(1).is_some());
        assert_eq!(tree.outcome(), CompilationOutcome::Failed);
        assert!(
            tree.diagnostics()
                .any(|d| d.kind == DiagnosticKind::ParseFailure && d.message.contains("broken"))
        );
    }

    #[test]
    fn test_duplicate_import_path_reported() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "Util.rules": { "#import": 1, "a": { "#rule": 2, "#id": 1 } },
                "sub/../Util.rules": { "#import": 7 } } }"##,
            root(),
        );
        // Lexically different labels are different paths; exact duplicates
        // collide.
        let tree = tree.unwrap();
        let dup = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "Util.rules": { "#import": 1 },
                "nested": { "#rule": 2, "#id": 1,
                    "Util.rules": { "#import": 9 } } } }"##,
            root(),
        )
        .unwrap();

        assert_eq!(tree.outcome(), CompilationOutcome::Perfect);
        assert!(
            dup.diagnostics()
                .any(|d| d.kind == DiagnosticKind::ParseFailure
                    && d.message.contains("already imported"))
        );
    }

    #[test]
    fn test_fatal_shapes() {
        assert!(matches!(
            parse_manifest_str("not json at all", root()),
            Err(ManifestError::Json(_))
        ));
        assert!(matches!(
            parse_manifest_str("[1, 2]", root()),
            Err(ManifestError::NotAMapping)
        ));
        assert!(matches!(
            parse_manifest_str("{}", root()),
            Err(ManifestError::EmptyRoot)
        ));
        assert!(matches!(
            parse_manifest_str(
                r##"{ "A": { "#import": 0 }, "B": { "#import": 1 } }"##,
                root()
            ),
            Err(ManifestError::MultipleRoots(2))
        ));
        assert!(matches!(
            parse_manifest_str(r##"{ "A": { "#rule": 0, "#id": 1 } }"##, root()),
            Err(ManifestError::RootNotImport(_))
        ));
    }

    #[test]
    fn test_nested_import_and_branch_rule() {
        let tree = parse_manifest_str(
            r##"{ "Main.rules": { "#import": 0,
                "Util.rules": { "#import": 2,
                    "outer": { "#rule": 1, "#id": 10,
                        "inner": { "#rule": 2, "#id": 11 } } },
                "Notes.rules": { "#import": 5 } } }"##,
            root(),
        )
        .unwrap();

        let util = tree
            .import(Path::new("/proj/dialogs/Util.rules"))
            .expect("path index must hold Util.rules");
        assert!(tree.node(util).contains_rules());

        let notes = tree.import(Path::new("/proj/dialogs/Notes.rules")).unwrap();
        assert!(!tree.node(notes).contains_rules());

        let outer = tree.rule(10).unwrap();
        let inner = tree.rule(11).unwrap();
        assert_eq!(tree.node(inner).parent, Some(outer));
        assert_eq!(tree.owning_import(inner), Some(util));
    }
}
