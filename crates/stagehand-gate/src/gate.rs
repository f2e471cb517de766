//! Phase gate service
//!
//! Binds the gate table to one project's state document. Reads go straight
//! to the document; writes run under the `project-state` lease.

use crate::error::GateError;
use crate::evaluate::{GateReport, Transition};
use crate::table::GateTable;
use crate::validator::{ValidatorRegistry, Verdict};
use serde::Serialize;
use serde_json::Value;
use stagehand_core::{ArtifactEntry, CriteriaKind, Issue, ProjectState, StageId, ValidationRecord};
use stagehand_store::{keys, Store, StoreError};
use std::sync::Arc;

/// Result of registering an artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactOutcome {
    /// Artifact id
    pub artifact: String,
    /// Artifact kind
    pub kind: String,
    /// Whether it was added to the registry
    pub registered: bool,
    /// Validator verdict
    pub verdict: Verdict,
}

/// Phase gate bound to a project
#[derive(Debug, Clone)]
pub struct PhaseGate {
    table: Arc<GateTable>,
    store: Store,
    validators: ValidatorRegistry,
}

impl PhaseGate {
    /// Gate over `store` using `table`
    #[must_use]
    pub fn new(table: Arc<GateTable>, store: Store) -> Self {
        Self {
            table,
            store,
            validators: ValidatorRegistry::new(),
        }
    }

    /// Use `validators` for artifact registration
    #[must_use]
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    /// The gate table
    #[inline]
    #[must_use]
    pub fn table(&self) -> &GateTable {
        &self.table
    }

    /// Current project state
    ///
    /// # Errors
    /// `StoreError::Missing` if the project was never initialized.
    pub fn state(&self) -> Result<ProjectState, GateError> {
        Ok(self.store.project_state().load_existing()?)
    }

    /// Create the project-state document at `start` (default: first stage)
    ///
    /// An existing document is returned untouched.
    ///
    /// # Errors
    /// `GateError::UnknownStage` for a stage not in the table,
    /// `GateError::NoCurrentStage` when the table is empty.
    pub fn initialize(&self, start: Option<StageId>) -> Result<ProjectState, GateError> {
        let stage = match start {
            Some(stage) => {
                self.table.stage(&stage)?;
                stage
            }
            None => self
                .table
                .first_stage()
                .cloned()
                .ok_or(GateError::NoCurrentStage)?,
        };

        self.store.locked(keys::PROJECT_STATE, || {
            let doc = self.store.project_state();
            if doc.exists() {
                return Ok(doc.load()?);
            }
            let state = ProjectState::at_stage(stage.clone());
            doc.save(&state)?;
            tracing::info!(stage = %stage, "Project state initialized");
            Ok(state)
        })
    }

    /// Validate the entry criteria of `stage`
    ///
    /// # Errors
    /// Unknown stage or unreadable state.
    pub fn validate_entry(&self, stage: &StageId) -> Result<GateReport, GateError> {
        self.table.validate_entry(stage, &self.state()?)
    }

    /// Validate the exit criteria of `stage`
    ///
    /// # Errors
    /// Unknown stage or unreadable state.
    pub fn validate_exit(&self, stage: &StageId) -> Result<GateReport, GateError> {
        self.table.validate_exit(stage, &self.state()?)
    }

    /// Decide whether the workflow may leave `stage` (default: current stage)
    ///
    /// # Errors
    /// `GateError::NoCurrentStage` when no stage is given and none is
    /// current; unknown stage or unreadable state.
    pub fn can_transition(&self, stage: Option<&StageId>) -> Result<Transition, GateError> {
        let state = self.state()?;
        let stage = match stage {
            Some(stage) => stage.clone(),
            None => state.current_stage.clone().ok_or(GateError::NoCurrentStage)?,
        };
        let transition = self.table.can_transition(&stage, &state)?;
        tracing::debug!(
            stage = %stage,
            allowed = transition.allowed,
            "Transition checked"
        );
        Ok(transition)
    }

    /// Record that a criterion is satisfied
    ///
    /// Marking an already validated criterion with the same artifact keeps
    /// the original record.
    ///
    /// # Errors
    /// `GateError::UnknownStage`/`UnknownCriterion`, lease or storage
    /// failures.
    pub fn mark_validated(
        &self,
        stage: &StageId,
        kind: CriteriaKind,
        criterion: &str,
        artifact: Option<String>,
    ) -> Result<ValidationRecord, GateError> {
        let gate = self.table.stage(stage)?;
        if gate.criterion(kind, criterion).is_none() {
            return Err(GateError::UnknownCriterion {
                stage: stage.clone(),
                kind,
                criterion: criterion.to_string(),
            });
        }

        let now = self.store.clock().now();
        self.store.locked(keys::PROJECT_STATE, || {
            self.store.project_state().try_update_existing(|state| {
                let side = state
                    .stage_validation
                    .entry(stage.clone())
                    .or_default()
                    .side_mut(kind);
                if let Some(existing) = side.get(criterion) {
                    if existing.validated && existing.artifact == artifact {
                        return Ok(existing.clone());
                    }
                }
                let record = ValidationRecord {
                    validated: true,
                    validated_at: now,
                    artifact: artifact.clone(),
                };
                side.insert(criterion.to_string(), record.clone());
                tracing::info!(stage = %stage, %kind, criterion, "Criterion validated");
                Ok(record)
            })
        })
    }

    /// Validate and register an artifact
    ///
    /// The registered validator for `kind` decides; an artifact of a kind
    /// with no validator is registered with a warning. Only a passing
    /// artifact enters the registry.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn register_artifact(
        &self,
        artifact: &str,
        kind: &str,
        payload: &Value,
        registered_by: Option<&str>,
    ) -> Result<ArtifactOutcome, GateError> {
        let now = self.store.clock().now();
        let path = self.store.layout().project_state();

        self.store.locked(keys::PROJECT_STATE, || {
            self.store.project_state().try_update_existing(|state| {
                let verdict = match self.validators.get(kind) {
                    Some(validator) => validator.validate(payload, state),
                    None => Verdict::from_issues(vec![Issue::warning(
                        "kind",
                        format!("No validator registered for kind {kind}"),
                    )]),
                };

                if verdict.passed {
                    let entry = ArtifactEntry {
                        kind: kind.to_string(),
                        registered_at: now,
                        registered_by: registered_by.map(str::to_string),
                        warnings: verdict.warnings().cloned().collect(),
                    };
                    let value = serde_json::to_value(&entry).map_err(|source| StoreError::Encode {
                        path: path.clone(),
                        source,
                    })?;
                    state.artifacts.insert(artifact.to_string(), value);
                    tracing::info!(artifact, kind, "Artifact registered");
                } else {
                    tracing::warn!(
                        artifact,
                        kind,
                        errors = verdict.errors().count(),
                        "Artifact rejected by validator"
                    );
                }

                Ok::<_, GateError>(ArtifactOutcome {
                    artifact: artifact.to_string(),
                    kind: kind.to_string(),
                    registered: verdict.passed,
                    verdict,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::fixtures;
    use crate::validator::RequiredSections;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stagehand_core::ManualClock;

    fn gate(dir: &tempfile::TempDir) -> PhaseGate {
        let store = Store::open(dir.path(), ManualClock::default().shared()).with_holder("test");
        PhaseGate::new(Arc::new(fixtures::table()), store)
            .with_validators(ValidatorRegistry::new().with("case", RequiredSections::new(["summary"])))
    }

    #[test]
    fn reads_require_an_initialized_project() {
        let dir = tempfile::tempdir().unwrap();
        let err = gate(&dir).validate_exit(&"s1".into()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn initialize_starts_at_first_stage_once() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);

        let state = gate.initialize(None).unwrap();
        assert_eq!(state.current_stage.as_ref().map(StageId::as_str), Some("s1"));

        let again = gate.initialize(Some("s2".into())).unwrap();
        assert_eq!(again.current_stage.as_ref().map(StageId::as_str), Some("s1"));
    }

    #[test]
    fn mark_validated_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        gate.initialize(None).unwrap();

        let first = gate
            .mark_validated(&"s1".into(), CriteriaKind::Exit, "s1-exit-2", None)
            .unwrap();
        let second = gate
            .mark_validated(&"s1".into(), CriteriaKind::Exit, "s1-exit-2", None)
            .unwrap();

        assert_eq!(first, second);
        let state = gate.state().unwrap();
        assert!(state.is_validated(&"s1".into(), CriteriaKind::Exit, "s1-exit-2"));
    }

    #[test]
    fn mark_validated_rejects_unknown_criterion() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        gate.initialize(None).unwrap();

        let err = gate
            .mark_validated(&"s1".into(), CriteriaKind::Entry, "s1-exit-2", None)
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownCriterion { .. }));
    }

    #[test]
    fn passing_artifact_unblocks_the_transition() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        gate.initialize(None).unwrap();
        gate.mark_validated(&"s1".into(), CriteriaKind::Exit, "s1-exit-2", None)
            .unwrap();

        let rejected = gate
            .register_artifact("S1-CASE-001", "case", &json!({}), Some("alice"))
            .unwrap();
        assert!(!rejected.registered);
        assert!(!gate.can_transition(None).unwrap().allowed);

        let accepted = gate
            .register_artifact("S1-CASE-001", "case", &json!({"summary": "ok"}), Some("alice"))
            .unwrap();
        assert!(accepted.registered);

        let t = gate.can_transition(None).unwrap();
        assert!(t.allowed);
        assert_eq!(t.next_stage.as_ref().map(StageId::as_str), Some("s2"));
    }

    #[test]
    fn unknown_kind_registers_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&dir);
        gate.initialize(None).unwrap();

        let outcome = gate
            .register_artifact("NOTE-1", "note", &json!({"text": "hi"}), None)
            .unwrap();

        assert!(outcome.registered);
        assert_eq!(outcome.verdict.warnings().count(), 1);
        assert!(gate.state().unwrap().has_artifact("NOTE-1"));
    }
}
