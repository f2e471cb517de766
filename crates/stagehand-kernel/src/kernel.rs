//! Kernel facade
//!
//! Binds every component to one store and carries the control flow between
//! them:
//! - a failure goes to the lifecycle manager; once no retry is left the
//!   recovery manager classifies it and recommends an action, and an
//!   `escalate` recommendation opens a case on the current stage
//! - a stage transition goes through the gate; unmet criteria open a
//!   `phase_gate_failed` case
//! - nothing new is spawned or resumed while the pause marker exists

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::sync::StateSync;
use serde::Serialize;
use serde_json::Value;
use stagehand_agents::{
    AgentRecord, AgentStatus, FailOutcome, LifecycleManager, OrphanAction, SpawnOptions, Spawned,
};
use stagehand_core::{
    Escalation, EscalationId, EscalationReason, EscalationStatus, SharedClock, StageId,
    StageStatus, UnitId,
};
use stagehand_escalation::{CreateEscalation, EscalationEngine};
use stagehand_gate::{GateError, PhaseGate};
use stagehand_recovery::{
    Attempt, Classification, Recommendation, RecoveryAction, RecoveryManager, WorkingTree,
};
use stagehand_store::{keys, Store};
use std::path::PathBuf;
use std::sync::Arc;

/// Requester of cases opened for exhausted units
pub const RECOVERY_REQUESTER: &str = "recovery-manager";

/// Actor recorded on timeout-driven escalations
pub const AUTO_ESCALATION_ACTOR: &str = "auto-escalation";

/// What happened after a failure report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    /// Lifecycle outcome
    pub outcome: FailOutcome,
    /// Failure type, for a terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    /// Recommended action, for a terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    /// Case opened for an `escalate` recommendation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationId>,
    /// Whether the pause marker was created
    pub paused: bool,
}

/// A completed stage transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageAdvance {
    /// Stage left
    pub from: StageId,
    /// Stage entered
    pub to: StageId,
    /// Approver of the stage left
    pub approver: Option<String>,
    /// Who asked for the transition
    pub advanced_by: String,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tick {
    /// Units orphaned by the deadline sweep
    pub orphaned: Vec<UnitId>,
    /// Cases moved up by auto-escalation
    pub escalated: Vec<EscalationId>,
    /// Expired leases removed
    pub leases_swept: Vec<String>,
}

/// Snapshot of the whole kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelStatus {
    /// Current stage
    pub current_stage: Option<StageId>,
    /// Its status
    pub stage_status: StageStatus,
    /// Why it is blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Live units
    pub active_units: usize,
    /// Orphaned units waiting for an operator
    pub orphaned_units: usize,
    /// Cases not yet resolved or rejected
    pub pending_escalations: usize,
    /// Units marked stuck
    pub stuck_units: usize,
    /// Whether the pause marker exists
    pub paused: bool,
}

/// The orchestration kernel for one project
#[derive(Debug, Clone)]
pub struct Kernel {
    config: Arc<KernelConfig>,
    store: Store,
    gate: PhaseGate,
    escalations: EscalationEngine,
    recovery: RecoveryManager,
    agents: LifecycleManager,
    sync: StateSync,
}

impl Kernel {
    /// Kernel for the project at `root`
    ///
    /// # Errors
    /// `KernelError::Config` if the configuration is inconsistent.
    pub fn open(root: impl Into<PathBuf>, config: KernelConfig, clock: SharedClock) -> Result<Self, KernelError> {
        Self::new(config, Store::open(root, clock))
    }

    /// Kernel over an existing store handle
    ///
    /// The store's lease time-to-live is replaced by the configured one.
    ///
    /// # Errors
    /// `KernelError::Config` if the configuration is inconsistent.
    pub fn new(config: KernelConfig, store: Store) -> Result<Self, KernelError> {
        config.validate()?;
        let store = store.with_lease_ttl_ms(config.lease_ttl_ms);

        let gate = PhaseGate::new(Arc::new(config.gates.clone()), store.clone())
            .with_validators(config.validators());
        let escalations = EscalationEngine::new(Arc::new(config.escalation.clone()), store.clone());
        let recovery = RecoveryManager::new(Arc::new(config.recovery.clone()), store.clone());
        let agents = LifecycleManager::new(Arc::new(config.unit_types.clone()), store.clone())
            .with_stale_multiplier(config.stale_multiplier);
        let sync = StateSync::new(store.clone());

        tracing::debug!(root = %store.root().display(), holder = store.holder(), "Kernel opened");
        Ok(Self {
            config: Arc::new(config),
            store,
            gate,
            escalations,
            recovery,
            agents,
            sync,
        })
    }

    /// Roll back through `tree` instead of git
    #[must_use]
    pub fn with_working_tree(mut self, tree: impl WorkingTree + 'static) -> Self {
        self.recovery = self.recovery.with_working_tree(tree);
        self
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Store handle
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Phase gate
    #[inline]
    #[must_use]
    pub fn gate(&self) -> &PhaseGate {
        &self.gate
    }

    /// Escalation engine
    #[inline]
    #[must_use]
    pub fn escalations(&self) -> &EscalationEngine {
        &self.escalations
    }

    /// Recovery manager
    #[inline]
    #[must_use]
    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Agent lifecycle manager
    #[inline]
    #[must_use]
    pub fn agents(&self) -> &LifecycleManager {
        &self.agents
    }

    /// State synchronizer
    #[inline]
    #[must_use]
    pub fn sync(&self) -> &StateSync {
        &self.sync
    }

    /// Spawn a unit unless automation is paused
    ///
    /// # Errors
    /// `KernelError::Paused`, or the lifecycle manager's errors.
    pub fn spawn(&self, unit_type: &str, context: Value, options: SpawnOptions) -> Result<Spawned, KernelError> {
        self.ensure_running()?;
        Ok(self.agents.spawn(unit_type, context, options)?)
    }

    /// Start a granted retry unless automation is paused
    ///
    /// # Errors
    /// `KernelError::Paused`, or the lifecycle manager's errors.
    pub fn resume(&self, unit: &UnitId) -> Result<AgentRecord, KernelError> {
        self.ensure_running()?;
        Ok(self.agents.resume(unit)?)
    }

    /// Apply an operator decision to an orphan
    ///
    /// Putting an orphan back to work is refused while paused; terminating
    /// one is always allowed.
    ///
    /// # Errors
    /// `KernelError::Paused`, or the lifecycle manager's errors.
    pub fn recover(&self, unit: &UnitId, action: OrphanAction) -> Result<AgentRecord, KernelError> {
        if action == OrphanAction::Retry {
            self.ensure_running()?;
        }
        Ok(self.agents.recover(unit, action)?)
    }

    /// Report a failed unit and follow the recovery chain
    ///
    /// A granted retry ends here. A failure that exhausts the retry budget
    /// is classified, recorded as a failed attempt and recommended on.
    /// `escalate` opens a `blocker_unresolved` case on the current stage;
    /// `pause` marks the unit stuck and creates the pause marker. Retry and
    /// rollback recommendations are returned for the caller to carry out.
    ///
    /// # Errors
    /// Lifecycle failures leave everything untouched. Once the unit is
    /// failed, any later error is wrapped in
    /// `KernelError::FollowUpIncomplete`; [`Self::reclassify`] finishes the
    /// chain.
    pub fn report_failure(&self, unit: &UnitId, error: &str, retryable: bool) -> Result<FailureReport, KernelError> {
        let outcome = self.agents.fail(unit, error, retryable)?;
        if outcome.retry {
            return Ok(FailureReport {
                outcome,
                classification: None,
                recommendation: None,
                escalation: None,
                paused: false,
            });
        }

        self.follow_up(outcome).map_err(|source| {
            tracing::warn!(unit = %unit, error = %source, "Recovery follow-up incomplete");
            KernelError::FollowUpIncomplete {
                unit: unit.clone(),
                source: Box::new(source),
            }
        })
    }

    /// Run the recovery chain of a failed unit again
    ///
    /// Steps that already happened are not repeated: the failure is
    /// recorded as an attempt once, and a case already opened for the unit
    /// is reported instead of a new one.
    ///
    /// # Errors
    /// `KernelError::NotFailed` unless the unit is `failed`; recovery,
    /// escalation, lease or storage failures.
    pub fn reclassify(&self, unit: &UnitId) -> Result<FailureReport, KernelError> {
        let agent = self.agents.get(unit)?;
        if agent.status != AgentStatus::Failed {
            return Err(KernelError::NotFailed {
                unit: unit.clone(),
                status: agent.status,
            });
        }
        self.follow_up(FailOutcome {
            retry: false,
            retry_count: agent.retry_count,
            max_retries: agent.max_retries,
            agent,
        })
    }

    /// Move the workflow to the next stage
    ///
    /// The check and the move happen in one read-modify-write under the
    /// `project-state` lease. When criteria are unmet a `phase_gate_failed`
    /// case is opened after the lease is released.
    ///
    /// # Errors
    /// `KernelError::TransitionRefused` carrying the refused transition and
    /// the case opened for it; `GateError::NoCurrentStage`, lease or storage
    /// failures.
    pub fn advance_stage(&self, actor: &str) -> Result<StageAdvance, KernelError> {
        let gates = &self.config.gates;
        let (transition, advanced) = self.store.locked(keys::PROJECT_STATE, || {
            self.store.project_state().try_update_existing(|state| {
                let stage = state.current_stage.clone().ok_or(GateError::NoCurrentStage)?;
                let transition = gates.can_transition(&stage, state)?;
                let advanced = match (&transition.next_stage, transition.allowed) {
                    (Some(next), true) => {
                        state.completed_stages.push(stage.clone());
                        state.current_stage = Some(next.clone());
                        state.unblock();
                        Some((stage, next.clone()))
                    }
                    _ => None,
                };
                Ok::<_, KernelError>((transition, advanced))
            })
        })?;

        if let Some((from, to)) = advanced {
            tracing::info!(from = %from, to = %to, actor, "Stage advanced");
            return Ok(StageAdvance {
                from,
                to,
                approver: transition.approver,
                advanced_by: actor.to_string(),
            });
        }

        let escalation = match transition.blocked_by {
            Some(blocker) if blocker.is_criteria() => {
                let unmet: Vec<&str> = transition.errors.iter().map(|i| i.message.as_str()).collect();
                let request = CreateEscalation::new(
                    EscalationReason::PhaseGateFailed,
                    transition.stage.clone(),
                    actor,
                    format!("{blocker}: {}", unmet.join("; ")),
                )
                .with_impact(format!("Workflow cannot leave {}", transition.stage));
                Some(self.escalations.create(request)?.id)
            }
            _ => None,
        };
        tracing::warn!(
            stage = %transition.stage,
            reason = transition.reason.as_deref().unwrap_or_default(),
            errors = transition.errors.len(),
            "Stage transition refused"
        );
        Err(KernelError::TransitionRefused {
            transition: Box::new(transition),
            escalation,
        })
    }

    /// Escalate every case reported overdue by the escalation engine
    ///
    /// A case that moved on between detection and escalation is skipped.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn apply_auto_escalations(&self) -> Result<Vec<Escalation>, KernelError> {
        let due = self.escalations.check_timeouts()?;
        let mut escalated = Vec::with_capacity(due.len());
        for case in due {
            let comments = format!(
                "Auto-escalated after {} hours without activity",
                case.overdue_hours
            );
            match self
                .escalations
                .escalate(&case.id, AUTO_ESCALATION_ACTOR, Some(comments))
            {
                Ok(updated) => escalated.push(updated),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(id = %case.id, error = %e, "Overdue case no longer escalatable");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(escalated)
    }

    /// One maintenance pass: deadline sweep, auto-escalation, lease sweep
    ///
    /// Auto-escalation is skipped for a project that was never initialized.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn tick(&self) -> Result<Tick, KernelError> {
        let orphaned = self.agents.sweep_deadlines()?;
        let escalated = if self.store.project_state().exists() {
            self.apply_auto_escalations()?
                .into_iter()
                .map(|case| case.id)
                .collect()
        } else {
            Vec::new()
        };
        let leases_swept = self.store.leases().sweep_expired()?;
        Ok(Tick {
            orphaned,
            escalated,
            leases_swept,
        })
    }

    /// Snapshot of the project
    ///
    /// # Errors
    /// An uninitialized project or storage failures.
    pub fn status(&self) -> Result<KernelStatus, KernelError> {
        let state = self.gate.state()?;
        Ok(KernelStatus {
            pending_escalations: state
                .escalations
                .iter()
                .filter(|e| !e.status.is_terminal())
                .count(),
            current_stage: state.current_stage,
            stage_status: state.stage_status,
            blocked_reason: state.blocked_reason,
            active_units: self.agents.list_active()?.len(),
            orphaned_units: self.agents.list_orphaned()?.len(),
            stuck_units: self.recovery.stuck_units()?.len(),
            paused: self.recovery.is_paused(),
        })
    }

    /// Cases for the CLI listing, optionally filtered
    ///
    /// # Errors
    /// Storage failures.
    pub fn escalation_list(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>, KernelError> {
        Ok(self.escalations.list(status)?)
    }

    fn ensure_running(&self) -> Result<(), KernelError> {
        if self.recovery.is_paused() {
            let path = self.store.layout().pause_marker();
            tracing::warn!(path = %path.display(), "Refusing work while paused");
            return Err(KernelError::Paused { path });
        }
        Ok(())
    }

    fn follow_up(&self, outcome: FailOutcome) -> Result<FailureReport, KernelError> {
        let unit = outcome.agent.id.clone();
        let error = outcome.agent.error.clone().unwrap_or_default();
        let history = self.recovery.history(&unit)?;
        let recorded = outcome.agent.failed_at.is_some_and(|failed_at| {
            history.last().is_some_and(|last| {
                !last.success && last.error.as_deref() == Some(error.as_str()) && last.timestamp >= failed_at
            })
        });

        let classification = if recorded {
            self.recovery.classify_recorded(&error, &unit)?
        } else {
            let classification = self.recovery.classify(&error, &unit)?;
            let approach = outcome
                .agent
                .context
                .get("approach")
                .and_then(Value::as_str)
                .unwrap_or(error.as_str())
                .to_string();
            let session = u32::try_from(history.len() + 1).unwrap_or(u32::MAX);
            self.recovery
                .record_attempt(&unit, Attempt::failed(session, approach, &error))?;
            classification
        };
        let recommendation = self
            .recovery
            .recommend_action(&unit, &classification.failure_type)?;
        tracing::info!(
            unit = %unit,
            failure_type = %classification.failure_type,
            action = %recommendation.action,
            "Terminal failure classified"
        );

        let mut report = FailureReport {
            outcome,
            classification: Some(classification),
            recommendation: None,
            escalation: None,
            paused: false,
        };
        match recommendation.action {
            RecoveryAction::Escalate => {
                report.escalation = self.escalate_failure(&unit, &error, &recommendation)?;
            }
            RecoveryAction::Pause => {
                self.recovery.mark_stuck(&unit, &recommendation.reason)?;
                self.recovery
                    .create_pause_marker(&format!("{unit}: {}", recommendation.reason))?;
                report.paused = true;
            }
            RecoveryAction::Retry | RecoveryAction::Rollback => {}
        }
        report.recommendation = Some(recommendation);
        Ok(report)
    }

    fn escalate_failure(
        &self,
        unit: &UnitId,
        error: &str,
        recommendation: &Recommendation,
    ) -> Result<Option<EscalationId>, KernelError> {
        let state = match self.store.project_state().load_existing() {
            Ok(state) => state,
            Err(e) if e.is_missing() => {
                tracing::warn!(unit = %unit, "No project state, failure not escalated");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let subject = format!("Unit {unit} failed: ");
        let opened = state.escalations.iter().find(|case| {
            case.reason == EscalationReason::BlockerUnresolved
                && case.requester == RECOVERY_REQUESTER
                && case.description.starts_with(&subject)
        });
        if let Some(case) = opened {
            tracing::debug!(unit = %unit, id = %case.id, "Failure already escalated");
            return Ok(Some(case.id.clone()));
        }
        let Some(stage) = state.current_stage else {
            tracing::warn!(unit = %unit, "No current stage, failure not escalated");
            return Ok(None);
        };

        let mut request = CreateEscalation::new(
            EscalationReason::BlockerUnresolved,
            stage,
            RECOVERY_REQUESTER,
            format!("{subject}{}", recommendation.reason),
        )
        .with_impact(error.to_string());
        if !recommendation.steps.is_empty() {
            request = request.with_proposed_resolution(recommendation.steps.join("; "));
        }
        Ok(Some(self.escalations.create(request)?.id))
    }
}
