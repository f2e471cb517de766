//! Criteria evaluation
//!
//! Pure functions of a [`GateTable`] and a [`ProjectState`]; nothing here
//! touches the filesystem.

use crate::error::GateError;
use crate::table::{CompletionCondition, Criterion, GateTable};
use serde::Serialize;
use stagehand_core::{Backlog, CriteriaKind, Issue, ProjectState, StageId};
use std::fmt;

/// Outcome of validating one side of a stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    /// No blocking issue found
    pub valid: bool,
    /// Stage checked
    pub stage: StageId,
    /// Side checked
    pub kind: CriteriaKind,
    /// Blocking issues
    pub errors: Vec<Issue>,
    /// Informational issues
    pub warnings: Vec<Issue>,
}

impl GateReport {
    fn new(stage: &StageId, kind: CriteriaKind, issues: Vec<Issue>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = issues.into_iter().partition(Issue::is_error);
        Self {
            valid: errors.is_empty(),
            stage: stage.clone(),
            kind,
            errors,
            warnings,
        }
    }
}

/// Why a transition is not allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Blocker {
    /// The current stage's exit criteria do not hold
    ExitCriteriaUnmet,
    /// The current stage has no successor
    Terminal,
    /// The next stage's entry criteria do not hold
    NextEntryUnmet,
}

impl Blocker {
    /// Human-readable reason
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ExitCriteriaUnmet => "Exit criteria not met",
            Self::Terminal => "No next stage defined (terminal state)",
            Self::NextEntryUnmet => "Next stage entry criteria not met",
        }
    }

    /// Whether unmet criteria caused the block
    #[inline]
    #[must_use]
    pub fn is_criteria(&self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Decision on leaving a stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    /// The transition is legal
    pub allowed: bool,
    /// Stage being left
    pub stage: StageId,
    /// Stage being entered, when one exists
    pub next_stage: Option<StageId>,
    /// Approver of the stage being left, set when allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    /// Machine-readable block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Blocker>,
    /// Human-readable block reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Blocking issues from the failed validation
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Issue>,
}

impl Transition {
    fn blocked(stage: &StageId, next: Option<StageId>, by: Blocker, errors: Vec<Issue>) -> Self {
        Self {
            allowed: false,
            stage: stage.clone(),
            next_stage: next,
            approver: None,
            blocked_by: Some(by),
            reason: Some(by.reason().to_string()),
            errors,
        }
    }
}

impl GateTable {
    /// Validate the entry criteria of `stage`
    ///
    /// # Errors
    /// `GateError::UnknownStage` if the stage is not in the table.
    pub fn validate_entry(&self, stage: &StageId, state: &ProjectState) -> Result<GateReport, GateError> {
        self.validate(stage, CriteriaKind::Entry, state)
    }

    /// Validate the exit criteria of `stage`, including its completion
    /// condition
    ///
    /// # Errors
    /// `GateError::UnknownStage` if the stage is not in the table.
    pub fn validate_exit(&self, stage: &StageId, state: &ProjectState) -> Result<GateReport, GateError> {
        self.validate(stage, CriteriaKind::Exit, state)
    }

    /// Validate one side of `stage`
    ///
    /// # Errors
    /// `GateError::UnknownStage` if the stage is not in the table.
    pub fn validate(
        &self,
        stage: &StageId,
        kind: CriteriaKind,
        state: &ProjectState,
    ) -> Result<GateReport, GateError> {
        let gate = self.stage(stage)?;

        let mut issues: Vec<Issue> = gate
            .criteria(kind)
            .iter()
            .filter_map(|c| check_criterion(stage, kind, c, state))
            .collect();

        if kind == CriteriaKind::Exit {
            if let (Some(condition), Some(backlog)) = (&gate.completion, &state.backlog) {
                issues.extend(check_completion(condition, backlog));
            }
        }

        Ok(GateReport::new(stage, kind, issues))
    }

    /// Decide whether the workflow may leave `stage`
    ///
    /// # Errors
    /// `GateError::UnknownStage` if `stage` or its successor is not in the
    /// table.
    pub fn can_transition(&self, stage: &StageId, state: &ProjectState) -> Result<Transition, GateError> {
        let gate = self.stage(stage)?;

        let exit = self.validate_exit(stage, state)?;
        if !exit.valid {
            return Ok(Transition::blocked(
                stage,
                gate.next.clone(),
                Blocker::ExitCriteriaUnmet,
                exit.errors,
            ));
        }

        let Some(next) = &gate.next else {
            return Ok(Transition::blocked(stage, None, Blocker::Terminal, Vec::new()));
        };

        let entry = self.validate_entry(next, state)?;
        if !entry.valid {
            return Ok(Transition::blocked(
                stage,
                Some(next.clone()),
                Blocker::NextEntryUnmet,
                entry.errors,
            ));
        }

        Ok(Transition {
            allowed: true,
            stage: stage.clone(),
            next_stage: Some(next.clone()),
            approver: Some(gate.approver.clone()),
            blocked_by: None,
            reason: None,
            errors: Vec::new(),
        })
    }
}

/// Issue for one unsatisfied criterion, if any
fn check_criterion(
    stage: &StageId,
    kind: CriteriaKind,
    criterion: &Criterion,
    state: &ProjectState,
) -> Option<Issue> {
    if !criterion.required || state.is_validated(stage, kind, &criterion.id) {
        return None;
    }

    match &criterion.artifact {
        Some(artifact) if state.has_artifact(artifact) => None,
        Some(artifact) => Some(Issue::error(
            &criterion.id,
            format!("Required artifact missing: {artifact} ({})", criterion.description),
        )),
        None if criterion.dynamic => Some(Issue::warning(
            &criterion.id,
            format!("Dynamic criterion requires validation: {}", criterion.description),
        )),
        None => {
            let side = match kind {
                CriteriaKind::Entry => "Entry",
                CriteriaKind::Exit => "Exit",
            };
            Some(Issue::error(
                &criterion.id,
                format!("{side} criterion not met: {}", criterion.description),
            ))
        }
    }
}

fn check_completion(condition: &CompletionCondition, backlog: &Backlog) -> Option<Issue> {
    let rate = backlog.completion_ratio();
    if rate >= condition.threshold {
        return None;
    }
    Some(Issue::error(
        "backlog",
        format!(
            "Completion rate ({:.1}%) below threshold ({}%)",
            rate * 100.0,
            condition.threshold * 100.0
        ),
    ))
}
