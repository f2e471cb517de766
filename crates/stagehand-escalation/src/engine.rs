//! Escalation engine
//!
//! Cases live in the project-state document. Every mutation is one
//! read-modify-write under the `project-state` lease and appends exactly
//! one timeline entry per case it touches.

use crate::error::EscalationError;
use crate::policy::PolicyTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::{
    elapsed_ms, Decision, DecisionRecord, Escalation, EscalationId, EscalationReason,
    EscalationStatus, LastDecision, ProjectState, StageId, StageStatus, TimelineAction,
    TimelineEntry,
};
use stagehand_store::{keys, Store};
use std::sync::Arc;

const MS_PER_HOUR: u64 = 60 * 60 * 1000;

/// Request to open a case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEscalation {
    /// Why
    pub reason: EscalationReason,
    /// Stage the case is about
    pub stage: StageId,
    /// Decision that triggered the case, if any
    #[serde(default)]
    pub decision: Option<Decision>,
    /// Who opened it
    pub requester: String,
    /// What happened
    pub description: String,
    /// Consequence if unresolved
    #[serde(default)]
    pub impact: Option<String>,
    /// Suggested way out
    #[serde(default)]
    pub proposed_resolution: Option<String>,
}

impl CreateEscalation {
    /// Request with the mandatory fields
    #[must_use]
    pub fn new(
        reason: EscalationReason,
        stage: impl Into<StageId>,
        requester: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            stage: stage.into(),
            decision: None,
            requester: requester.into(),
            description: description.into(),
            impact: None,
            proposed_resolution: None,
        }
    }

    /// Attach the triggering decision
    #[must_use]
    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Attach an impact statement
    #[must_use]
    pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
        self.impact = Some(impact.into());
        self
    }

    /// Attach a proposed resolution
    #[must_use]
    pub fn with_proposed_resolution(mut self, proposal: impl Into<String>) -> Self {
        self.proposed_resolution = Some(proposal.into());
        self
    }
}

/// A pending case overdue for auto-escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueEscalation {
    /// Case id
    pub id: EscalationId,
    /// Stage
    pub stage: StageId,
    /// Level now
    pub current_level: usize,
    /// Level after escalation
    pub next_level: usize,
    /// Whole hours since the last activity
    pub overdue_hours: u64,
}

/// Result of recording a go/no-go decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoNoGoOutcome {
    /// Stage decided on
    pub stage: StageId,
    /// The decision
    pub decision: Decision,
    /// Case opened by a no-go
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_created: Option<EscalationId>,
    /// Cases closed by a go
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalations_resolved: Vec<EscalationId>,
    /// Workflow status afterwards
    pub stage_status: StageStatus,
}

/// Escalation engine bound to a project
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    policies: Arc<PolicyTable>,
    store: Store,
}

impl EscalationEngine {
    /// Engine over `store` using `policies`
    #[must_use]
    pub fn new(policies: Arc<PolicyTable>, store: Store) -> Self {
        Self { policies, store }
    }

    /// The policy table
    #[inline]
    #[must_use]
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Open a case
    ///
    /// Path, timeout and auto-escalation come from the stage's policy; a
    /// stage without one gets an empty path. If the stage is current, the
    /// workflow is blocked on the new case.
    ///
    /// # Errors
    /// Lease or storage failures, including an uninitialized project.
    pub fn create(&self, request: CreateEscalation) -> Result<Escalation, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| Ok(self.open_case(state, request, now)))
    }

    /// Record that the current level saw the case
    ///
    /// # Errors
    /// `NotFound`, `Closed`, lease or storage failures.
    pub fn acknowledge(
        &self,
        id: &EscalationId,
        by: &str,
        comments: Option<String>,
    ) -> Result<Escalation, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| {
            let case = pending_case(state, id)?;
            case.status = EscalationStatus::Acknowledged;
            push(case, TimelineAction::Acknowledged, by, now, comments);
            tracing::info!(id = %id, by, "Escalation acknowledged");
            Ok(case.clone())
        })
    }

    /// Move the case one level up its path
    ///
    /// # Errors
    /// `AtMaxLevel` (level unchanged), `NotFound`, `Closed`, lease or
    /// storage failures.
    pub fn escalate(
        &self,
        id: &EscalationId,
        by: &str,
        comments: Option<String>,
    ) -> Result<Escalation, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| {
            let case = pending_case(state, id)?;
            escalate_case(case, by, now, comments)?;
            Ok(case.clone())
        })
    }

    /// Close the case with a resolution
    ///
    /// A `go` decision lifts a block held by this case.
    ///
    /// # Errors
    /// `NotFound`, `Closed`, lease or storage failures.
    pub fn resolve(
        &self,
        id: &EscalationId,
        by: &str,
        resolution: &str,
        new_decision: Option<Decision>,
    ) -> Result<Escalation, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| resolve_case(state, id, by, resolution, new_decision, now))
    }

    /// Close the case without action
    ///
    /// # Errors
    /// `NotFound`, `Closed`, lease or storage failures.
    pub fn reject(&self, id: &EscalationId, by: &str, reason: &str) -> Result<Escalation, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| {
            let case = pending_case(state, id)?;
            case.status = EscalationStatus::Rejected;
            case.rejected_at = Some(now);
            case.rejected_by = Some(by.to_string());
            case.rejection_reason = Some(reason.to_string());
            push(
                case,
                TimelineAction::Rejected {
                    reason: reason.to_string(),
                },
                by,
                now,
                None,
            );
            tracing::info!(id = %id, by, "Escalation rejected");
            Ok(case.clone())
        })
    }

    /// Pending cases overdue for auto-escalation
    ///
    /// Considers open and acknowledged cases with auto-escalation enabled;
    /// inactivity is measured from the last timeline entry, or creation when
    /// there is none. Cases at their last level are never reported.
    ///
    /// # Errors
    /// Storage failures, including an uninitialized project.
    pub fn check_timeouts(&self) -> Result<Vec<DueEscalation>, EscalationError> {
        let state = self.store.project_state().load_existing()?;
        let now = self.store.clock().now();
        Ok(overdue(&state, now))
    }

    /// Record a go/no-go decision
    ///
    /// A no-go always opens a new case for the stage. A go resolves every
    /// open or acknowledged case for the stage and, if the stage is
    /// current, marks it approved to proceed.
    ///
    /// # Errors
    /// Lease or storage failures, including an uninitialized project.
    pub fn process_go_no_go(
        &self,
        stage: &StageId,
        decision: Decision,
        approver: &str,
        comments: Option<String>,
    ) -> Result<GoNoGoOutcome, EscalationError> {
        let now = self.store.clock().now();
        self.mutate(|state| {
            state
                .go_no_go
                .entry(stage.clone())
                .or_default()
                .push(DecisionRecord {
                    decision,
                    approver: approver.to_string(),
                    at: now,
                    comments: comments.clone(),
                });
            state.last_go_no_go = Some(LastDecision {
                stage: stage.clone(),
                decision,
                approver: approver.to_string(),
                at: now,
            });
            tracing::info!(stage = %stage, %decision, approver, "Go/no-go recorded");

            let mut outcome = GoNoGoOutcome {
                stage: stage.clone(),
                decision,
                escalation_created: None,
                escalations_resolved: Vec::new(),
                stage_status: state.stage_status,
            };

            match decision {
                Decision::NoGo => {
                    let request = CreateEscalation::new(
                        EscalationReason::GoNoGoNoGo,
                        stage.clone(),
                        approver,
                        format!("Go/no-go decision for {stage} was no-go"),
                    )
                    .with_decision(Decision::NoGo)
                    .with_impact(comments.unwrap_or_else(|| "Stage cannot proceed".to_string()));
                    outcome.escalation_created = Some(self.open_case(state, request, now).id);
                }
                Decision::Go => {
                    let pending: Vec<EscalationId> = state
                        .escalations
                        .iter()
                        .filter(|e| &e.stage == stage && e.status.is_pending())
                        .map(|e| e.id.clone())
                        .collect();
                    let resolution = format!("Go decision received for {stage}");
                    for id in &pending {
                        resolve_case(state, id, approver, &resolution, Some(Decision::Go), now)?;
                    }
                    if state.is_current(stage) {
                        state.stage_status = StageStatus::ApprovedToProceed;
                        state.blocked_reason = None;
                    }
                    outcome.escalations_resolved = pending;
                }
            }

            outcome.stage_status = state.stage_status;
            Ok(outcome)
        })
    }

    /// All cases, optionally filtered by status
    ///
    /// # Errors
    /// Storage failures, including an uninitialized project.
    pub fn list(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>, EscalationError> {
        let state = self.store.project_state().load_existing()?;
        Ok(state
            .escalations
            .into_iter()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .collect())
    }

    /// One case
    ///
    /// # Errors
    /// `NotFound` or storage failures.
    pub fn get(&self, id: &EscalationId) -> Result<Escalation, EscalationError> {
        let state = self.store.project_state().load_existing()?;
        state
            .escalation(id)
            .cloned()
            .ok_or_else(|| EscalationError::NotFound(id.clone()))
    }

    fn open_case(&self, state: &mut ProjectState, request: CreateEscalation, now: DateTime<Utc>) -> Escalation {
        let policy = self.policies.get(&request.stage);
        let case = Escalation {
            id: EscalationId::generate(),
            created_at: now,
            status: EscalationStatus::Open,
            reason: request.reason,
            stage: request.stage,
            original_decision: request.decision,
            requester: request.requester,
            description: request.description,
            impact: request.impact,
            proposed_resolution: request.proposed_resolution,
            primary_approver: policy.map(|p| p.primary_approver.clone()),
            escalation_path: policy.map(|p| p.path.clone()).unwrap_or_default(),
            current_level: 0,
            timeout_hours: policy.map(|p| p.timeout_hours),
            auto_escalate: policy.is_some_and(|p| p.auto_escalate),
            timeline: Vec::new(),
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            new_decision: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
        };

        if policy.is_none() {
            tracing::warn!(stage = %case.stage, "No escalation policy for stage, case has an empty path");
        }
        if state.is_current(&case.stage) {
            state.block(case.id.as_str());
        }
        tracing::info!(
            id = %case.id,
            stage = %case.stage,
            reason = %case.reason,
            "Escalation opened"
        );

        state.escalations.push(case.clone());
        case
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut ProjectState) -> Result<T, EscalationError>,
    ) -> Result<T, EscalationError> {
        self.store.locked(keys::PROJECT_STATE, || {
            self.store.project_state().try_update_existing(f)
        })
    }
}

/// Cases overdue at `now`
fn overdue(state: &ProjectState, now: DateTime<Utc>) -> Vec<DueEscalation> {
    state
        .escalations
        .iter()
        .filter(|e| e.status.is_pending() && e.auto_escalate && !e.at_max_level())
        .filter_map(|e| {
            let timeout_ms = e.timeout_hours?.saturating_mul(MS_PER_HOUR);
            let idle_ms = elapsed_ms(e.last_activity(), now);
            (idle_ms > timeout_ms).then(|| DueEscalation {
                id: e.id.clone(),
                stage: e.stage.clone(),
                current_level: e.current_level,
                next_level: e.current_level + 1,
                overdue_hours: idle_ms / MS_PER_HOUR,
            })
        })
        .collect()
}

fn pending_case<'a>(
    state: &'a mut ProjectState,
    id: &EscalationId,
) -> Result<&'a mut Escalation, EscalationError> {
    let case = state
        .escalation_mut(id)
        .ok_or_else(|| EscalationError::NotFound(id.clone()))?;
    if case.status.is_terminal() {
        return Err(EscalationError::Closed {
            id: id.clone(),
            status: case.status,
        });
    }
    Ok(case)
}

fn escalate_case(
    case: &mut Escalation,
    by: &str,
    now: DateTime<Utc>,
    comments: Option<String>,
) -> Result<(), EscalationError> {
    if case.at_max_level() {
        return Err(EscalationError::AtMaxLevel {
            id: case.id.clone(),
            level: case.current_level,
        });
    }
    let from = case.current_role().unwrap_or_default().to_string();
    case.current_level += 1;
    let to = case.current_role().unwrap_or_default().to_string();
    case.status = EscalationStatus::Escalated;
    tracing::info!(id = %case.id, %from, %to, level = case.current_level, "Escalated");
    push(case, TimelineAction::Escalated { from, to }, by, now, comments);
    Ok(())
}

fn resolve_case(
    state: &mut ProjectState,
    id: &EscalationId,
    by: &str,
    resolution: &str,
    new_decision: Option<Decision>,
    now: DateTime<Utc>,
) -> Result<Escalation, EscalationError> {
    let case = pending_case(state, id)?;
    case.status = EscalationStatus::Resolved;
    case.resolved_at = Some(now);
    case.resolved_by = Some(by.to_string());
    case.resolution = Some(resolution.to_string());
    case.new_decision = new_decision;
    push(
        case,
        TimelineAction::Resolved {
            resolution: resolution.to_string(),
            new_decision,
        },
        by,
        now,
        None,
    );
    let resolved = case.clone();
    tracing::info!(id = %id, by, "Escalation resolved");

    if new_decision == Some(Decision::Go) {
        release_block(state, id);
    }
    Ok(resolved)
}

/// Lift a block held by `closed`; if another unresolved case for the
/// current stage remains, the block moves to it instead
fn release_block(state: &mut ProjectState, closed: &EscalationId) {
    if state.stage_status != StageStatus::Blocked
        || state.blocked_reason.as_deref() != Some(closed.as_str())
    {
        return;
    }
    let remaining = state.current_stage.as_ref().and_then(|current| {
        state
            .escalations
            .iter()
            .find(|e| &e.stage == current && !e.status.is_terminal() && &e.id != closed)
            .map(|e| e.id.clone())
    });
    match remaining {
        Some(other) => state.blocked_reason = Some(other.to_string()),
        None => state.unblock(),
    }
}

fn push(
    case: &mut Escalation,
    action: TimelineAction,
    by: &str,
    at: DateTime<Utc>,
    comments: Option<String>,
) {
    case.timeline.push(TimelineEntry {
        action,
        by: by.to_string(),
        at,
        comments,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::EscalationPolicy;
    use pretty_assertions::assert_eq;
    use stagehand_core::ManualClock;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        store: Store,
        engine: EscalationEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let store = Store::open(dir.path(), clock.shared()).with_holder("test");
        store
            .project_state()
            .save(&ProjectState::at_stage("s2"))
            .unwrap();
        let policies = PolicyTable::new([(
            StageId::from("s2"),
            EscalationPolicy {
                primary_approver: "QA Lead".into(),
                path: vec!["QA Lead".into(), "Tech Lead".into(), "Product Owner".into()],
                timeout_hours: 24,
                auto_escalate: true,
            },
        )]);
        let engine = EscalationEngine::new(Arc::new(policies), store.clone());
        Fixture {
            _dir: dir,
            clock,
            store,
            engine,
        }
    }

    fn blocker(stage: &str) -> CreateEscalation {
        CreateEscalation::new(EscalationReason::BlockerUnresolved, stage, "dev", "db down")
    }

    #[test]
    fn create_uses_the_stage_policy_and_blocks_the_current_stage() {
        let f = fixture();

        let case = f.engine.create(blocker("s2")).unwrap();

        assert_eq!(case.status, EscalationStatus::Open);
        assert_eq!(case.current_level, 0);
        assert_eq!(case.escalation_path.len(), 3);
        assert_eq!(case.timeout_hours, Some(24));
        assert!(case.timeline.is_empty());
        assert!(case.id.as_str().starts_with("ESC-"));

        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.stage_status, StageStatus::Blocked);
        assert_eq!(state.blocked_reason.as_deref(), Some(case.id.as_str()));
    }

    #[test]
    fn create_for_other_stage_does_not_block() {
        let f = fixture();
        let case = f.engine.create(blocker("s7")).unwrap();

        assert!(case.escalation_path.is_empty());
        assert!(!case.auto_escalate);
        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.stage_status, StageStatus::InProgress);
    }

    #[test]
    fn escalate_walks_the_path_and_stops_at_the_top() {
        let f = fixture();
        let case = f.engine.create(blocker("s2")).unwrap();

        f.engine.escalate(&case.id, "pm", None).unwrap();
        let top = f.engine.escalate(&case.id, "pm", None).unwrap();
        assert_eq!(top.current_level, 2);
        assert_eq!(top.current_role(), Some("Product Owner"));
        assert!(matches!(
            &top.timeline[1].action,
            TimelineAction::Escalated { from, to } if from == "Tech Lead" && to == "Product Owner"
        ));

        let err = f.engine.escalate(&case.id, "pm", None).unwrap_err();
        assert!(matches!(err, EscalationError::AtMaxLevel { level: 2, .. }));
        assert!(err.is_conflict());
        assert_eq!(f.engine.get(&case.id).unwrap().current_level, 2);
    }

    #[test]
    fn empty_path_cannot_escalate() {
        let f = fixture();
        let case = f.engine.create(blocker("s7")).unwrap();
        assert!(matches!(
            f.engine.escalate(&case.id, "pm", None),
            Err(EscalationError::AtMaxLevel { level: 0, .. })
        ));
    }

    #[test]
    fn resolve_with_go_unblocks() {
        let f = fixture();
        let case = f.engine.create(blocker("s2")).unwrap();

        let resolved = f
            .engine
            .resolve(&case.id, "po", "db restored", Some(Decision::Go))
            .unwrap();

        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(resolved.timeline.len(), 1);
        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.stage_status, StageStatus::InProgress);
        assert_eq!(state.blocked_reason, None);
    }

    #[test]
    fn block_moves_to_the_remaining_case() {
        let f = fixture();
        let first = f.engine.create(blocker("s2")).unwrap();
        let second = f.engine.create(blocker("s2")).unwrap();

        f.engine
            .resolve(&second.id, "po", "done", Some(Decision::Go))
            .unwrap();

        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.stage_status, StageStatus::Blocked);
        assert_eq!(state.blocked_reason.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn closed_cases_reject_further_actions() {
        let f = fixture();
        let case = f.engine.create(blocker("s2")).unwrap();
        f.engine.reject(&case.id, "po", "not a blocker").unwrap();

        let err = f.engine.acknowledge(&case.id, "qa", None).unwrap_err();
        assert!(matches!(
            err,
            EscalationError::Closed {
                status: EscalationStatus::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn unknown_case_is_not_found() {
        let f = fixture();
        let err = f
            .engine
            .acknowledge(&EscalationId::new("ESC-missing"), "qa", None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn timeouts_measure_from_last_activity() {
        let f = fixture();
        let case = f.engine.create(blocker("s2")).unwrap();

        f.clock.advance_ms(23 * 3_600_000);
        assert!(f.engine.check_timeouts().unwrap().is_empty());

        f.engine.acknowledge(&case.id, "qa", None).unwrap();
        f.clock.advance_ms(24 * 3_600_000 + 1);

        let due = f.engine.check_timeouts().unwrap();
        assert_eq!(
            due,
            vec![DueEscalation {
                id: case.id.clone(),
                stage: "s2".into(),
                current_level: 0,
                next_level: 1,
                overdue_hours: 24,
            }]
        );
    }

    #[test]
    fn escalated_cases_are_not_reported() {
        let f = fixture();
        let case = f.engine.create(blocker("s2")).unwrap();
        f.engine.escalate(&case.id, "pm", None).unwrap();

        f.clock.advance_ms(48 * 3_600_000);

        assert!(f.engine.check_timeouts().unwrap().is_empty());
    }

    #[test]
    fn no_go_then_go() {
        let f = fixture();

        let no_go = f
            .engine
            .process_go_no_go(&"s2".into(), Decision::NoGo, "Lead", None)
            .unwrap();
        let id = no_go.escalation_created.clone().unwrap();
        assert_eq!(no_go.stage_status, StageStatus::Blocked);
        assert_eq!(f.engine.list(None).unwrap().len(), 1);
        assert_eq!(
            f.engine.get(&id).unwrap().reason,
            EscalationReason::GoNoGoNoGo
        );

        let go = f
            .engine
            .process_go_no_go(&"s2".into(), Decision::Go, "Lead", Some("fixed".into()))
            .unwrap();
        assert_eq!(go.escalations_resolved, vec![id.clone()]);
        assert_eq!(go.stage_status, StageStatus::ApprovedToProceed);
        assert_eq!(f.engine.get(&id).unwrap().status, EscalationStatus::Resolved);

        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.go_no_go[&StageId::from("s2")].len(), 2);
        assert_eq!(state.last_go_no_go.unwrap().decision, Decision::Go);
    }

    #[test]
    fn list_filters_by_status() {
        let f = fixture();
        let a = f.engine.create(blocker("s2")).unwrap();
        f.engine.create(blocker("s2")).unwrap();
        f.engine.reject(&a.id, "po", "dup").unwrap();

        assert_eq!(f.engine.list(Some(EscalationStatus::Open)).unwrap().len(), 1);
        assert_eq!(
            f.engine.list(Some(EscalationStatus::Rejected)).unwrap()[0].id,
            a.id
        );
    }
}
