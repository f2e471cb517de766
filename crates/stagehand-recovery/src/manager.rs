//! Recovery manager
//!
//! Owns the attempt history, the checkpoint ledger and the pause marker.
//! Reads go straight to the documents; every write runs under the
//! `recovery` lease.

use crate::checkpoint::{Checkpoint, CheckpointLedger};
use crate::error::RecoveryError;
use crate::history::{AttemptHistory, AttemptRecord, UnitHistory};
use crate::rules::{
    FailureClassifier, FailureRules, FailureSeverity, PatternClassifier, RecoveryAction,
    RecoveryConfig, CIRCULAR_FIX, UNKNOWN,
};
use crate::worktree::{GitWorkingTree, WorkingTree};
use serde::{Deserialize, Serialize};
use stagehand_core::UnitId;
use stagehand_store::{keys, JsonDocument, Store, StoreError};
use std::sync::Arc;

/// An attempt as reported by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Session number
    pub session: u32,
    /// Whether it worked
    pub success: bool,
    /// How it was tackled
    pub approach: String,
    /// Failure text
    #[serde(default)]
    pub error: Option<String>,
}

impl Attempt {
    /// A failed attempt
    #[must_use]
    pub fn failed(session: u32, approach: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            session,
            success: false,
            approach: approach.into(),
            error: Some(error.into()),
        }
    }

    /// A successful attempt
    #[must_use]
    pub fn succeeded(session: u32, approach: impl Into<String>) -> Self {
        Self {
            session,
            success: true,
            approach: approach.into(),
            error: None,
        }
    }
}

/// Failure type assigned to a piece of failure text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Failure type name
    pub failure_type: String,
    /// Severity of the type
    pub severity: FailureSeverity,
    /// Description of the type
    pub description: String,
    /// Configured action for the type
    pub recovery: RecoveryAction,
}

/// What to do next about a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    /// Action
    pub action: RecoveryAction,
    /// Checkpoint reference for a rollback, the unit otherwise
    pub target: Option<String>,
    /// Why
    pub reason: String,
    /// Steps for whoever carries it out
    pub steps: Vec<String>,
}

/// Overview of the recovery documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    /// Units with recorded attempts
    pub total_units: usize,
    /// Attempts over all units
    pub total_attempts: usize,
    /// Units marked stuck
    pub stuck_units: usize,
    /// Checkpoints kept in the ledger
    pub checkpoints: usize,
    /// Last good checkpoint reference
    pub last_good_checkpoint: Option<String>,
    /// Whether the pause marker exists
    pub is_paused: bool,
}

/// Recovery manager bound to a project
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    config: Arc<RecoveryConfig>,
    store: Store,
    classifier: Arc<dyn FailureClassifier>,
    working_tree: Arc<dyn WorkingTree>,
}

impl RecoveryManager {
    /// Manager over `store` using `config`
    ///
    /// Classification defaults to the config's pattern lists and rollback to
    /// a git reset in the project root.
    #[must_use]
    pub fn new(config: Arc<RecoveryConfig>, store: Store) -> Self {
        let classifier = Arc::new(PatternClassifier::new(&config.failure_types));
        let working_tree = Arc::new(GitWorkingTree::new(store.root()));
        Self {
            config,
            store,
            classifier,
            working_tree,
        }
    }

    /// Use a different classifier
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Use a different working tree for rollbacks
    #[must_use]
    pub fn with_working_tree(mut self, tree: impl WorkingTree + 'static) -> Self {
        self.working_tree = Arc::new(tree);
        self
    }

    /// Configured failure types
    #[inline]
    #[must_use]
    pub fn failure_types(&self) -> &FailureRules {
        &self.config.failure_types
    }

    fn history_doc(&self) -> JsonDocument<AttemptHistory> {
        self.store.document(self.store.layout().attempt_history())
    }

    fn ledger_doc(&self) -> JsonDocument<CheckpointLedger> {
        self.store.document(self.store.layout().checkpoints())
    }

    /// Classify failure text for `unit`
    ///
    /// Static patterns first; with no match the text is checked as an
    /// approach for circular-fix detection before settling on `UNKNOWN`.
    ///
    /// # Errors
    /// Storage failures while reading the history.
    pub fn classify(&self, error: &str, unit: &UnitId) -> Result<Classification, RecoveryError> {
        self.classify_before(error, unit, 0)
    }

    /// Classify the unit's most recent attempt, already in the history
    ///
    /// Circular-fix detection compares only with the attempts before it.
    ///
    /// # Errors
    /// Storage failures while reading the history.
    pub fn classify_recorded(&self, error: &str, unit: &UnitId) -> Result<Classification, RecoveryError> {
        self.classify_before(error, unit, 1)
    }

    fn classify_before(&self, error: &str, unit: &UnitId, skip_latest: usize) -> Result<Classification, RecoveryError> {
        let failure_type = match self.classifier.classify(error) {
            Some(failure_type) => failure_type,
            None if self.circular_before(unit, error, skip_latest)? => CIRCULAR_FIX.to_string(),
            None => UNKNOWN.to_string(),
        };

        let classification = match self.config.failure_types.get_or_unknown(&failure_type) {
            Some((_, rule)) => Classification {
                failure_type,
                severity: rule.severity,
                description: rule.description.clone(),
                recovery: rule.recovery,
            },
            None => Classification {
                failure_type,
                severity: FailureSeverity::Medium,
                description: "Unclassified failure".to_string(),
                recovery: RecoveryAction::Escalate,
            },
        };
        tracing::debug!(
            unit = %unit,
            failure_type = %classification.failure_type,
            "Failure classified"
        );
        Ok(classification)
    }

    /// Whether `approach` repeats the unit's recent attempts
    ///
    /// # Errors
    /// Storage failures while reading the history.
    pub fn detect_circular_fix(&self, unit: &UnitId, approach: &str) -> Result<bool, RecoveryError> {
        self.circular_before(unit, approach, 0)
    }

    fn circular_before(&self, unit: &UnitId, approach: &str, skip_latest: usize) -> Result<bool, RecoveryError> {
        let Some(mut history) = self.history_doc().load()?.units.remove(unit) else {
            return Ok(false);
        };
        let kept = history.attempts.len().saturating_sub(skip_latest);
        history.attempts.truncate(kept);
        let t = &self.config.thresholds;
        Ok(history.is_circular(approach, t.circular_window, t.circular_similarity, t.circular_repetitions))
    }

    /// Append an attempt to the unit's history
    ///
    /// Reaching the per-unit attempt limit marks the unit stuck.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn record_attempt(&self, unit: &UnitId, attempt: Attempt) -> Result<UnitHistory, RecoveryError> {
        let now = self.store.clock().now();
        let max = self.config.thresholds.max_attempts_per_unit;

        self.store.locked(keys::RECOVERY, || {
            Ok(self.history_doc().update(|history| {
                let record = AttemptRecord {
                    session: attempt.session,
                    success: attempt.success,
                    approach: attempt.approach,
                    error: attempt.error,
                    timestamp: now,
                };
                let success = record.success;
                let count = history.push(unit, record);
                tracing::info!(unit = %unit, attempt = count, success, "Attempt recorded");

                if !success && max > 0 && count >= max {
                    let reason = format!("Reached {count} attempts (limit {max})");
                    if history.mark_stuck(unit, &reason, now) {
                        tracing::warn!(unit = %unit, attempts = count, "Unit marked stuck");
                    }
                }
                history.units.get(unit).cloned().unwrap_or_default()
            })?)
        })
    }

    /// Attempts recorded for `unit`
    ///
    /// # Errors
    /// Storage failures.
    pub fn attempt_count(&self, unit: &UnitId) -> Result<usize, RecoveryError> {
        Ok(self.history_doc().load()?.attempt_count(unit))
    }

    /// The unit's attempts, oldest first
    ///
    /// # Errors
    /// Storage failures.
    pub fn history(&self, unit: &UnitId) -> Result<Vec<AttemptRecord>, RecoveryError> {
        Ok(self
            .history_doc()
            .load()?
            .units
            .remove(unit)
            .map(|h| h.attempts)
            .unwrap_or_default())
    }

    /// Record a known-good checkpoint
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn record_good_checkpoint(
        &self,
        reference: &str,
        unit: Option<&UnitId>,
    ) -> Result<Checkpoint, RecoveryError> {
        let checkpoint = Checkpoint {
            reference: reference.to_string(),
            unit: unit.cloned(),
            recorded_at: self.store.clock().now(),
        };
        let retention = self.config.thresholds.checkpoint_retention;

        self.store.locked(keys::RECOVERY, || {
            self.ledger_doc()
                .update(|ledger| ledger.record(checkpoint.clone(), retention))?;
            tracing::info!(reference, "Good checkpoint recorded");
            Ok(checkpoint.clone())
        })
    }

    /// Reference of the last good checkpoint
    ///
    /// # Errors
    /// Storage failures.
    pub fn last_good_checkpoint(&self) -> Result<Option<String>, RecoveryError> {
        Ok(self.ledger_doc().load()?.last_good)
    }

    /// Recommend an action for `unit` after a failure of `failure_type`
    ///
    /// Once the unit has reached the escalation threshold the answer is
    /// always `escalate`.
    ///
    /// # Errors
    /// Storage failures.
    pub fn recommend_action(
        &self,
        unit: &UnitId,
        failure_type: &str,
    ) -> Result<Recommendation, RecoveryError> {
        let t = &self.config.thresholds;
        let attempts = self.attempt_count(unit)?;

        if attempts >= t.escalation_threshold {
            return Ok(Recommendation {
                action: RecoveryAction::Escalate,
                target: Some(unit.to_string()),
                reason: format!(
                    "Too many attempts ({attempts}/{})",
                    t.max_attempts_per_unit
                ),
                steps: self.steps(RecoveryAction::Escalate),
            });
        }

        let (name, action, description) = match self.config.failure_types.get_or_unknown(failure_type) {
            Some((name, rule)) => (name.to_string(), rule.recovery, rule.description.clone()),
            None => (
                UNKNOWN.to_string(),
                RecoveryAction::Escalate,
                "Unclassified failure".to_string(),
            ),
        };
        let target = match action {
            RecoveryAction::Rollback => self.last_good_checkpoint()?,
            _ => Some(unit.to_string()),
        };

        Ok(Recommendation {
            action,
            target,
            reason: format!("{name}: {description}"),
            steps: self.steps(action),
        })
    }

    fn steps(&self, action: RecoveryAction) -> Vec<String> {
        self.config.actions.get(&action).cloned().unwrap_or_default()
    }

    /// Reset the working tree to the last good checkpoint
    ///
    /// # Errors
    /// `RecoveryError::Rollback` when no checkpoint is recorded or the reset
    /// failed.
    pub fn rollback_to_last_good(&self) -> Result<String, RecoveryError> {
        let Some(reference) = self.last_good_checkpoint()? else {
            tracing::error!("No good checkpoint to roll back to");
            return Err(RecoveryError::Rollback {
                reference: None,
                reason: "no good checkpoint recorded".to_string(),
            });
        };

        match self.working_tree.reset_hard(&reference) {
            Ok(()) => {
                tracing::info!(reference = %reference, "Rolled back to last good checkpoint");
                Ok(reference)
            }
            Err(e) => {
                tracing::error!(reference = %reference, error = %e, "Rollback failed");
                Err(e)
            }
        }
    }

    /// Mark `unit` stuck
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn mark_stuck(&self, unit: &UnitId, reason: &str) -> Result<(), RecoveryError> {
        let now = self.store.clock().now();
        self.store.locked(keys::RECOVERY, || {
            let newly = self
                .history_doc()
                .update(|history| history.mark_stuck(unit, reason, now))?;
            if newly {
                tracing::warn!(unit = %unit, reason, "Unit marked stuck");
            }
            Ok(())
        })
    }

    /// Units marked stuck, in marking order
    ///
    /// # Errors
    /// Storage failures.
    pub fn stuck_units(&self) -> Result<Vec<UnitId>, RecoveryError> {
        Ok(self.history_doc().load()?.stuck_units)
    }

    /// Write the pause marker that halts automation
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn create_pause_marker(&self, reason: &str) -> Result<(), RecoveryError> {
        let path = self.store.layout().pause_marker();
        let now = self.store.clock().now();
        let body = format!(
            "HUMAN INTERVENTION REQUIRED\n\
             ===========================\n\
             Reason: {reason}\n\
             Created: {}\n\
             To resume: Delete this PAUSE file after addressing the issue.\n",
            now.to_rfc3339()
        );

        self.store.locked(keys::RECOVERY, || {
            std::fs::write(&path, &body).map_err(|e| StoreError::io(&path, e))?;
            tracing::warn!(path = %path.display(), reason, "Pause marker created");
            Ok(())
        })
    }

    /// Whether the pause marker exists
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.store.layout().pause_marker().exists()
    }

    /// Remove the pause marker; returns whether one existed
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn clear_pause(&self) -> Result<bool, RecoveryError> {
        let path = self.store.layout().pause_marker();
        self.store.locked(keys::RECOVERY, || match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Pause marker removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e).into()),
        })
    }

    /// Overview of the recovery documents
    ///
    /// # Errors
    /// Storage failures.
    pub fn summary(&self) -> Result<RecoverySummary, RecoveryError> {
        let history = self.history_doc().load()?;
        let ledger = self.ledger_doc().load()?;
        Ok(RecoverySummary {
            total_units: history.units.len(),
            total_attempts: history.total_attempts(),
            stuck_units: history.stuck_units.len(),
            checkpoints: ledger.checkpoints.len(),
            last_good_checkpoint: ledger.last_good,
            is_paused: self.is_paused(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::fixtures;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use stagehand_core::ManualClock;

    #[derive(Debug, Default)]
    struct FakeTree {
        resets: Mutex<Vec<String>>,
        broken: bool,
    }

    impl WorkingTree for Arc<FakeTree> {
        fn reset_hard(&self, reference: &str) -> Result<(), RecoveryError> {
            if self.broken {
                return Err(RecoveryError::Rollback {
                    reference: Some(reference.to_string()),
                    reason: "detached".to_string(),
                });
            }
            self.resets.lock().push(reference.to_string());
            Ok(())
        }
    }

    fn manager(dir: &tempfile::TempDir) -> RecoveryManager {
        let store = Store::open(dir.path(), ManualClock::default().shared()).with_holder("test");
        RecoveryManager::new(Arc::new(fixtures::config()), store)
    }

    fn unit() -> UnitId {
        UnitId::new("coder-01")
    }

    #[test]
    fn static_patterns_classify_first() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);

        let c = m.classify("SyntaxError: Unexpected token", &unit()).unwrap();
        assert_eq!(c.failure_type, "BROKEN_BUILD");
        assert_eq!(c.recovery, RecoveryAction::Rollback);

        let c = m.classify("Some random error", &unit()).unwrap();
        assert_eq!(c.failure_type, UNKNOWN);
        assert_eq!(c.recovery, RecoveryAction::Escalate);
    }

    #[test]
    fn repeated_approach_text_classifies_as_circular() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        for (i, approach) in ["use regex", "use regex fix", "try regex again"].iter().enumerate() {
            m.record_attempt(&unit(), Attempt::failed(u32::try_from(i).unwrap(), *approach, "boom"))
                .unwrap();
        }

        assert!(m.detect_circular_fix(&unit(), "regex attempt").unwrap());
        assert!(!m.detect_circular_fix(&unit(), "rewrite the tokenizer").unwrap());

        let c = m.classify("regex attempt", &unit()).unwrap();
        assert_eq!(c.failure_type, CIRCULAR_FIX);
        assert_eq!(c.recovery, RecoveryAction::Pause);
    }

    #[test]
    fn recorded_attempt_is_not_compared_with_itself() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        for (i, approach) in ["use regex", "rewrite the tokenizer", "regex attempt"].iter().enumerate() {
            m.record_attempt(&unit(), Attempt::failed(u32::try_from(i).unwrap(), *approach, "boom"))
                .unwrap();
        }

        // Against all three attempts the latest matches itself and "use regex".
        assert_eq!(m.classify("regex attempt", &unit()).unwrap().failure_type, CIRCULAR_FIX);
        // Only two earlier attempts are left, short of the window.
        assert_eq!(m.classify_recorded("regex attempt", &unit()).unwrap().failure_type, UNKNOWN);
    }

    #[test]
    fn repeated_failure_trumps_classification() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);

        let r = m.recommend_action(&unit(), "VERIFICATION_FAILED").unwrap();
        assert_eq!(r.action, RecoveryAction::Retry);
        assert_eq!(r.target.as_deref(), Some("coder-01"));

        for i in 0..3 {
            m.record_attempt(&unit(), Attempt::failed(i, format!("approach {i}"), "x"))
                .unwrap();
        }

        let r = m.recommend_action(&unit(), "VERIFICATION_FAILED").unwrap();
        assert_eq!(r.action, RecoveryAction::Escalate);
        assert_eq!(r.reason, "Too many attempts (3/5)");
    }

    #[test]
    fn rollback_recommendation_targets_the_last_good_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.record_good_checkpoint("abc123", Some(&unit())).unwrap();
        m.record_good_checkpoint("def456", None).unwrap();

        let r = m.recommend_action(&unit(), "BROKEN_BUILD").unwrap();

        assert_eq!(r.action, RecoveryAction::Rollback);
        assert_eq!(r.target.as_deref(), Some("def456"));
        assert_eq!(r.reason, "BROKEN_BUILD: rollback worthy");
        assert_eq!(r.steps, ["Reset to checkpoint", "Re-run checks"]);
    }

    #[test]
    fn unit_is_stuck_at_the_attempt_limit() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);

        for i in 0..4 {
            m.record_attempt(&unit(), Attempt::failed(i, format!("idea {i}"), "x"))
                .unwrap();
        }
        assert!(m.stuck_units().unwrap().is_empty());

        let history = m
            .record_attempt(&unit(), Attempt::failed(5, "idea 5", "x"))
            .unwrap();

        assert!(history.stuck);
        assert_eq!(m.stuck_units().unwrap(), vec![unit()]);
        assert_eq!(m.history(&unit()).unwrap().len(), 5);
    }

    #[test]
    fn rollback_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir).with_working_tree(Arc::new(FakeTree::default()));

        let err = m.rollback_to_last_good().unwrap_err();

        assert!(err.requires_human());
    }

    #[test]
    fn rollback_resets_to_the_last_good_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(FakeTree::default());
        let m = manager(&dir).with_working_tree(tree.clone());
        m.record_good_checkpoint("abc123", None).unwrap();

        assert_eq!(m.rollback_to_last_good().unwrap(), "abc123");
        assert_eq!(*tree.resets.lock(), ["abc123"]);
    }

    #[test]
    fn failed_reset_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(FakeTree {
            broken: true,
            ..FakeTree::default()
        });
        let m = manager(&dir).with_working_tree(tree);
        m.record_good_checkpoint("abc123", None).unwrap();

        let err = m.rollback_to_last_good().unwrap_err();

        assert!(matches!(err, RecoveryError::Rollback { reference: Some(ref r), .. } if r == "abc123"));
    }

    #[test]
    fn pause_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        assert!(!m.is_paused());

        m.create_pause_marker("Circular fix on coder-01").unwrap();
        let body = std::fs::read_to_string(dir.path().join("PAUSE")).unwrap();
        assert!(body.starts_with("HUMAN INTERVENTION REQUIRED\n"));
        assert!(body.contains("Reason: Circular fix on coder-01\n"));
        assert!(m.is_paused());
        assert!(m.summary().unwrap().is_paused);

        assert!(m.clear_pause().unwrap());
        assert!(!m.clear_pause().unwrap());
        assert!(!m.is_paused());
    }

    #[test]
    fn summary_counts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.record_attempt(&unit(), Attempt::failed(1, "a", "x")).unwrap();
        m.record_attempt(&unit(), Attempt::succeeded(2, "b")).unwrap();
        m.mark_stuck(&UnitId::new("coder-02"), "manual").unwrap();
        m.record_good_checkpoint("abc123", None).unwrap();

        let s = m.summary().unwrap();

        assert_eq!(
            s,
            RecoverySummary {
                total_units: 1,
                total_attempts: 2,
                stuck_units: 1,
                checkpoints: 1,
                last_good_checkpoint: Some("abc123".to_string()),
                is_paused: false,
            }
        );
    }
}
