//! Interpreter execution log reconstruction.
//!
//! The interpreter reports one `printLog` per fired rule: the rule id plus
//! the short-circuit evaluation trace of its body. Entries are rebuilt here
//! with a same-instant ordinal so concurrent logs landing in the same
//! millisecond stay totally ordered.

use std::{collections::VecDeque, sync::Arc};

use serde::{Deserialize, Serialize};

/// How one evaluated fragment of a rule body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentOutcome {
    /// Not an evaluated condition (label text or static body part).
    Static,
    True,
    False,
    /// Never evaluated because an earlier condition decided the rule.
    Skipped,
}

impl FragmentOutcome {
    /// Map a wire token onto an outcome. Anything that is not a known
    /// boolean marker is carried verbatim as static text.
    pub fn from_token(token: &str) -> Self {
        match token {
            "true" => Self::True,
            "false" => Self::False,
            "skip" => Self::Skipped,
            _ => Self::Static,
        }
    }
}

/// One displayed piece of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub outcome: FragmentOutcome,
}

impl Fragment {
    pub fn new(text: impl Into<String>, outcome: FragmentOutcome) -> Self {
        Self {
            text: text.into(),
            outcome,
        }
    }
}

/// One reconstructed rule execution report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub rule_id: u32,
    /// Unix millis at arrival.
    pub timestamp_ms: u64,
    /// 1-based tie-breaker among entries sharing `timestamp_ms`.
    pub ordinal: u32,
    /// First fragment is the rule's label; the rest is the body trace in
    /// arrival order.
    pub fragments: Vec<Fragment>,
}

impl LogEntry {
    /// The label fragment (always present).
    pub fn label(&self) -> &Fragment {
        &self.fragments[0]
    }

    /// Body fragments without the label.
    pub fn body(&self) -> &[Fragment] {
        &self.fragments[1..]
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Builds [`LogEntry`] values from incoming traces, maintaining the
/// same-instant ordinal. Lives on the mutation context, so assembly is
/// naturally serialized.
#[derive(Debug, Default)]
pub struct LogAssembler {
    last_instant: Option<u64>,
    last_ordinal: u32,
}

impl LogAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct one entry. `label` comes from the id index (or a
    /// fallback when the id is unknown to the current generation).
    pub fn assemble(
        &mut self,
        rule_id: u32,
        label: String,
        tokens: &[String],
        now_ms: u64,
    ) -> LogEntry {
        // The ordinal is a monotone tie-breaker, not wall-clock precision:
        // same instant increments, a new instant resets to 1.
        self.last_ordinal = if self.last_instant == Some(now_ms) {
            self.last_ordinal + 1
        } else {
            1
        };
        self.last_instant = Some(now_ms);

        let mut fragments = Vec::with_capacity(tokens.len() + 1);
        fragments.push(Fragment::new(label, FragmentOutcome::Static));
        for token in tokens {
            fragments.push(Fragment::new(token.clone(), FragmentOutcome::from_token(token)));
        }

        LogEntry {
            rule_id,
            timestamp_ms: now_ms,
            ordinal: self.last_ordinal,
            fragments,
        }
    }
}

/// Unix millis for log timestamping.
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// History
// ============================================================================

/// Bounded ring of recent entries, shared with presentation.
#[derive(Debug)]
pub struct LogHistory {
    entries: VecDeque<Arc<LogEntry>>,
    capacity: usize,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: Arc<LogEntry>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest-first snapshot.
    pub fn entries(&self) -> Vec<Arc<LogEntry>> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_same_instant_ordinals() {
        let mut assembler = LogAssembler::new();

        let first = assembler.assemble(7, "greet".into(), &tokens(&["true"]), 1000);
        let second = assembler.assemble(7, "greet".into(), &tokens(&["false"]), 1000);
        assert_eq!(first.ordinal, 1);
        assert_eq!(second.ordinal, 2);

        // A new instant resets the tie-breaker.
        let third = assembler.assemble(7, "greet".into(), &tokens(&["true"]), 1001);
        assert_eq!(third.ordinal, 1);
    }

    #[test]
    fn test_label_is_first_fragment() {
        let mut assembler = LogAssembler::new();
        let entry = assembler.assemble(3, "farewell".into(), &tokens(&["true", "skip"]), 42);

        assert_eq!(entry.label().text, "farewell");
        assert_eq!(entry.label().outcome, FragmentOutcome::Static);
        assert_eq!(entry.body().len(), 2);
        assert_eq!(entry.body()[0].outcome, FragmentOutcome::True);
        assert_eq!(entry.body()[1].outcome, FragmentOutcome::Skipped);
    }

    #[test]
    fn test_unknown_token_kept_as_static_text() {
        assert_eq!(FragmentOutcome::from_token("maybe"), FragmentOutcome::Static);
        assert_eq!(FragmentOutcome::from_token("true"), FragmentOutcome::True);
        assert_eq!(FragmentOutcome::from_token("false"), FragmentOutcome::False);
        assert_eq!(FragmentOutcome::from_token("skip"), FragmentOutcome::Skipped);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut assembler = LogAssembler::new();
        let mut history = LogHistory::new(2);

        for i in 0..3u64 {
            let entry = assembler.assemble(i as u32, format!("r{i}"), &[], 100 + i);
            history.push(Arc::new(entry));
        }

        let entries = history.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rule_id, 1);
        assert_eq!(entries[1].rule_id, 2);
    }
}
