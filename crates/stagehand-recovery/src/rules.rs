//! Failure rules and recovery thresholds
//!
//! Static configuration loaded once at startup.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure type every table falls back to
pub const UNKNOWN: &str = "UNKNOWN";

/// Failure type produced by circular-fix detection
pub const CIRCULAR_FIX: &str = "CIRCULAR_FIX";

/// What to do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Try again from the current state
    Retry,
    /// Reset to the last known-good checkpoint
    Rollback,
    /// Hand to a human approver
    Escalate,
    /// Halt automation until a human intervenes
    Pause,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Escalate => "escalate",
            Self::Pause => "pause",
        })
    }
}

/// How bad a failure type is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSeverity {
    /// Work cannot continue
    Critical,
    /// Work is wrong
    High,
    /// Work is degraded
    Medium,
    /// Cosmetic
    Low,
}

/// One failure type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRule {
    /// Severity
    pub severity: FailureSeverity,
    /// Human-readable description
    pub description: String,
    /// Case-insensitive substrings that identify the type
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Recommended action
    pub recovery: RecoveryAction,
}

/// Failure types in match order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureRules {
    rules: IndexMap<String, FailureRule>,
}

impl FailureRules {
    /// Rules from `(type, rule)` pairs in match order
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = (String, FailureRule)>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    /// Rule for a failure type
    #[inline]
    #[must_use]
    pub fn get(&self, failure_type: &str) -> Option<&FailureRule> {
        self.rules.get(failure_type)
    }

    /// Rule for a failure type, falling back to [`UNKNOWN`]
    #[must_use]
    pub fn get_or_unknown(&self, failure_type: &str) -> Option<(&str, &FailureRule)> {
        self.rules
            .get_key_value(failure_type)
            .or_else(|| self.rules.get_key_value(UNKNOWN))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// All rules in match order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FailureRule)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Steps shown to whoever carries out an action
pub type ActionSteps = IndexMap<RecoveryAction, Vec<String>>;

/// Numeric knobs of the recovery manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryThresholds {
    /// Attempts after which every failure is escalated
    pub escalation_threshold: usize,
    /// Attempts after which a unit is marked stuck
    pub max_attempts_per_unit: usize,
    /// Checkpoints kept in the ledger
    pub checkpoint_retention: usize,
    /// Prior attempts compared by circular-fix detection
    pub circular_window: usize,
    /// Similarity above which two approaches count as the same
    pub circular_similarity: f64,
    /// Similar approaches within the window that make a fix circular
    pub circular_repetitions: usize,
}

impl Default for RecoveryThresholds {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
            max_attempts_per_unit: 5,
            checkpoint_retention: 10,
            circular_window: 3,
            circular_similarity: 0.2,
            circular_repetitions: 2,
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Failure types in match order
    pub failure_types: FailureRules,
    /// Steps per action
    #[serde(default)]
    pub actions: ActionSteps,
    /// Thresholds
    #[serde(default)]
    pub thresholds: RecoveryThresholds,
}

/// Maps failure text to a failure type
///
/// Returning `None` means "no static match"; the manager then tries
/// circular-fix detection before settling on [`UNKNOWN`].
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    /// Failure type for `error`
    fn classify(&self, error: &str) -> Option<String>;
}

/// First-match substring classifier over [`FailureRules`]
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rules: Vec<(String, Vec<String>)>,
}

impl PatternClassifier {
    /// Classifier over `rules`; the [`UNKNOWN`] type never matches
    #[must_use]
    pub fn new(rules: &FailureRules) -> Self {
        Self {
            rules: rules
                .iter()
                .filter(|(name, _)| *name != UNKNOWN)
                .map(|(name, rule)| {
                    let patterns = rule.patterns.iter().map(|p| p.to_lowercase()).collect();
                    (name.to_string(), patterns)
                })
                .collect(),
        }
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, error: &str) -> Option<String> {
        let error = error.to_lowercase();
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| error.contains(p.as_str())))
            .map(|(name, _)| name.clone())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    fn rule(severity: FailureSeverity, patterns: &[&str], recovery: RecoveryAction) -> FailureRule {
        FailureRule {
            severity,
            description: format!("{recovery} worthy"),
            patterns: patterns.iter().map(ToString::to_string).collect(),
            recovery,
        }
    }

    pub(crate) fn config() -> RecoveryConfig {
        RecoveryConfig {
            failure_types: FailureRules::new([
                (
                    "BROKEN_BUILD".to_string(),
                    rule(
                        FailureSeverity::Critical,
                        &["syntaxerror", "module not found", "build failed"],
                        RecoveryAction::Rollback,
                    ),
                ),
                (
                    "VERIFICATION_FAILED".to_string(),
                    rule(FailureSeverity::High, &["test failed", "assertion"], RecoveryAction::Retry),
                ),
                (
                    "CONTEXT_EXHAUSTED".to_string(),
                    rule(FailureSeverity::Medium, &["context limit"], RecoveryAction::Retry),
                ),
                (
                    CIRCULAR_FIX.to_string(),
                    rule(FailureSeverity::High, &[], RecoveryAction::Pause),
                ),
                (
                    UNKNOWN.to_string(),
                    rule(FailureSeverity::Medium, &[], RecoveryAction::Escalate),
                ),
            ]),
            actions: [(
                RecoveryAction::Rollback,
                vec!["Reset to checkpoint".to_string(), "Re-run checks".to_string()],
            )]
            .into_iter()
            .collect(),
            thresholds: RecoveryThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let classifier = PatternClassifier::new(&fixtures::config().failure_types);

        assert_eq!(
            classifier.classify("SyntaxError: Unexpected token").as_deref(),
            Some("BROKEN_BUILD")
        );
        assert_eq!(
            classifier.classify("Test failed: expected 5 but got 3").as_deref(),
            Some("VERIFICATION_FAILED")
        );
        assert_eq!(
            classifier.classify("Context limit exceeded").as_deref(),
            Some("CONTEXT_EXHAUSTED")
        );
        assert_eq!(classifier.classify("Some random error"), None);
    }

    #[test]
    fn unknown_types_fall_back() {
        let rules = fixtures::config().failure_types;
        let (name, rule) = rules.get_or_unknown("NOPE").unwrap();
        assert_eq!(name, UNKNOWN);
        assert_eq!(rule.recovery, RecoveryAction::Escalate);
    }

    #[test]
    fn thresholds_fill_missing_fields() {
        let t: RecoveryThresholds = serde_json::from_str(r#"{"escalation_threshold": 4}"#).unwrap();
        assert_eq!(t.escalation_threshold, 4);
        assert_eq!(t.circular_window, 3);
    }
}
