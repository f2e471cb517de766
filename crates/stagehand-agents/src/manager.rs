//! Agent lifecycle manager
//!
//! Records live in the agent-state document, split into `active`,
//! `orphaned` and `completed` collections. Every read-modify-write runs
//! under the `agent-state` lease; timers are armed or cancelled only after
//! the write succeeded.

use crate::error::LifecycleError;
use crate::record::{AgentRecord, AgentState};
use crate::registry::UnitTypeRegistry;
use crate::status::{validate_transition, AgentStatus};
use crate::timers::DeadlineTimers;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::{after_ms, elapsed_ms, UnitId};
use stagehand_store::{keys, JsonDocument, Store};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Default factor of the report-only staleness check
pub const DEFAULT_STALE_MULTIPLIER: f64 = 2.0;

const DEFAULT_SPAWNER: &str = "user";

/// Per-spawn overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Deadline length instead of the type default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Spawning actor, `"user"` when absent
    #[serde(default)]
    pub spawned_by: Option<String>,
}

impl SpawnOptions {
    /// Override the deadline length
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Name the spawning actor
    #[must_use]
    pub fn with_spawned_by(mut self, spawned_by: impl Into<String>) -> Self {
        self.spawned_by = Some(spawned_by.into());
        self
    }
}

/// Result of a spawn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spawned {
    /// The new record
    pub agent: AgentRecord,
    /// Execution artifact the executor should load
    pub execution_artifact: PathBuf,
    /// What the caller is expected to do next
    pub next_steps: Vec<String>,
}

/// Result of a failure report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailOutcome {
    /// The record afterwards
    pub agent: AgentRecord,
    /// Whether a retry was granted
    pub retry: bool,
    /// Retries used
    pub retry_count: u32,
    /// Retries allowed
    pub max_retries: u32,
}

/// Operator decision on an orphan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanAction {
    /// Close it for good
    Terminate,
    /// Put it back to work with a fresh deadline
    Retry,
}

impl fmt::Display for OrphanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Terminate => "terminate",
            Self::Retry => "retry",
        })
    }
}

impl FromStr for OrphanAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminate" => Ok(Self::Terminate),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown recovery action: {other}")),
        }
    }
}

/// A live record far past its deadline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleAgent {
    /// Unit id
    pub id: UnitId,
    /// Unit type
    pub unit_type: String,
    /// Status
    pub status: AgentStatus,
    /// Time since spawn
    pub elapsed_ms: u64,
    /// Deadline length
    pub timeout_ms: u64,
    /// Why it is reported
    pub stale_reason: String,
}

/// Result of a staleness check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleReport {
    /// Stale records
    pub stale_agents: Vec<StaleAgent>,
    /// Live records checked
    pub active_count: usize,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Records purged
    pub removed_count: usize,
    /// Terminal records kept
    pub remaining_count: usize,
}

/// Agent lifecycle manager bound to a project
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    types: Arc<UnitTypeRegistry>,
    store: Store,
    timers: Arc<DeadlineTimers>,
    stale_multiplier: f64,
}

impl LifecycleManager {
    /// Manager over `store` spawning `types`
    #[must_use]
    pub fn new(types: Arc<UnitTypeRegistry>, store: Store) -> Self {
        Self {
            types,
            store,
            timers: Arc::new(DeadlineTimers::new()),
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
        }
    }

    /// Use a different staleness factor
    #[must_use]
    pub fn with_stale_multiplier(mut self, multiplier: f64) -> Self {
        self.stale_multiplier = multiplier;
        self
    }

    /// Registered unit types
    #[inline]
    #[must_use]
    pub fn list_types(&self) -> &UnitTypeRegistry {
        &self.types
    }

    /// In-process timers
    #[inline]
    #[must_use]
    pub fn timers(&self) -> &DeadlineTimers {
        &self.timers
    }

    fn doc(&self) -> JsonDocument<AgentState> {
        self.store.document(self.store.layout().agent_state())
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut AgentState) -> Result<R, LifecycleError>,
    ) -> Result<R, LifecycleError> {
        self.store
            .locked(keys::AGENT_STATE, || self.doc().try_update(f))
    }

    /// Spawn a unit of `unit_type`
    ///
    /// The record is persisted as `active` with a deadline of now plus the
    /// timeout, and an in-process timer is armed when a runtime is present.
    ///
    /// # Errors
    /// `UnknownType`, `ArtifactMissing`, lease or storage failures.
    pub fn spawn(
        &self,
        unit_type: &str,
        context: Value,
        options: SpawnOptions,
    ) -> Result<Spawned, LifecycleError> {
        let ty = self
            .types
            .get(unit_type)
            .ok_or_else(|| LifecycleError::UnknownType {
                unit_type: unit_type.to_string(),
                available: self.types.names(),
            })?;

        let artifact = self.store.layout().resolve(&ty.execution_artifact);
        if !artifact.is_file() {
            return Err(LifecycleError::ArtifactMissing {
                unit_type: unit_type.to_string(),
                path: artifact,
            });
        }

        let now = self.store.clock().now();
        let timeout_ms = options.timeout_ms.unwrap_or(ty.timeout_ms);
        let mut agent = AgentRecord {
            id: UnitId::generate(unit_type),
            unit_type: unit_type.to_string(),
            name: ty.name.clone(),
            spawned_at: now,
            spawned_by: options
                .spawned_by
                .unwrap_or_else(|| DEFAULT_SPAWNER.to_string()),
            context,
            timeout_ms,
            deadline: None,
            max_retries: ty.max_retries,
            retry_count: 0,
            status: AgentStatus::Spawning,
            result: None,
            error: None,
            last_error: None,
            completed_at: None,
            failed_at: None,
            duration_ms: None,
            orphaned_at: None,
            orphan_reason: None,
            recovered_at: None,
            recovery_action: None,
        };
        transition(&mut agent, AgentStatus::Active)?;
        let deadline = after_ms(now, timeout_ms);
        agent.deadline = Some(deadline);

        self.mutate(|state| {
            state.active.push(agent.clone());
            Ok(())
        })?;
        self.arm(&agent.id, deadline);

        tracing::info!(
            unit = %agent.id,
            unit_type,
            timeout_ms,
            spawned_by = %agent.spawned_by,
            "Agent spawned"
        );
        Ok(Spawned {
            next_steps: vec![
                format!("Load {}", ty.execution_artifact.display()),
                "Execute the unit with the provided context".to_string(),
                "Report completion or failure when done".to_string(),
                format!("The unit is orphaned after {timeout_ms}ms without a report"),
            ],
            execution_artifact: ty.execution_artifact.clone(),
            agent,
        })
    }

    /// Record a successful completion
    ///
    /// # Errors
    /// `UnknownUnit`, `IllegalTransition` for a record that is no longer
    /// live, lease or storage failures.
    pub fn complete(&self, id: &UnitId, result: Value) -> Result<AgentRecord, LifecycleError> {
        let now = self.store.clock().now();
        let agent = self.mutate(|state| {
            let idx = live_index(state, id, AgentStatus::Completed)?;
            let mut agent = state.active.remove(idx);
            transition(&mut agent, AgentStatus::Completed)?;
            agent.result = Some(result);
            agent.completed_at = Some(now);
            agent.duration_ms = Some(elapsed_ms(agent.spawned_at, now));
            state.completed.push(agent.clone());
            Ok(agent)
        })?;
        self.timers.cancel(id);

        tracing::info!(unit = %id, duration_ms = ?agent.duration_ms, "Agent completed");
        Ok(agent)
    }

    /// Record a failure
    ///
    /// A retryable failure with budget left moves the unit to `retrying`
    /// with a fresh deadline; anything else is terminal.
    ///
    /// # Errors
    /// `UnknownUnit`, `IllegalTransition`, lease or storage failures.
    pub fn fail(&self, id: &UnitId, error: &str, retryable: bool) -> Result<FailOutcome, LifecycleError> {
        let now = self.store.clock().now();
        let outcome = self.mutate(|state| {
            let retry = state
                .active
                .iter()
                .find(|a| &a.id == id)
                .is_some_and(|a| retryable && a.has_retries_left());
            let target = if retry {
                AgentStatus::Retrying
            } else {
                AgentStatus::Failed
            };
            let idx = live_index(state, id, target)?;

            let agent = if retry {
                let agent = &mut state.active[idx];
                transition(agent, target)?;
                agent.retry_count += 1;
                agent.last_error = Some(error.to_string());
                agent.deadline = Some(after_ms(now, agent.timeout_ms));
                agent.clone()
            } else {
                let mut agent = state.active.remove(idx);
                transition(&mut agent, target)?;
                agent.error = Some(error.to_string());
                agent.failed_at = Some(now);
                agent.completed_at = Some(now);
                agent.duration_ms = Some(elapsed_ms(agent.spawned_at, now));
                state.completed.push(agent.clone());
                agent
            };
            Ok(FailOutcome {
                retry,
                retry_count: agent.retry_count,
                max_retries: agent.max_retries,
                agent,
            })
        })?;

        if outcome.retry {
            if let Some(deadline) = outcome.agent.deadline {
                self.arm(id, deadline);
            }
            tracing::info!(
                unit = %id,
                retry_count = outcome.retry_count,
                max_retries = outcome.max_retries,
                "Agent failed, retry granted"
            );
        } else {
            self.timers.cancel(id);
            tracing::warn!(
                unit = %id,
                retry_count = outcome.retry_count,
                retryable,
                error,
                "Agent failed"
            );
        }
        Ok(outcome)
    }

    /// Acknowledge that a granted retry has started
    ///
    /// # Errors
    /// `UnknownUnit`, `IllegalTransition` unless the unit is `retrying`,
    /// lease or storage failures.
    pub fn resume(&self, id: &UnitId) -> Result<AgentRecord, LifecycleError> {
        let now = self.store.clock().now();
        let agent = self.mutate(|state| {
            let idx = live_index(state, id, AgentStatus::Active)?;
            let agent = &mut state.active[idx];
            transition(agent, AgentStatus::Active)?;
            agent.deadline = Some(after_ms(now, agent.timeout_ms));
            Ok(agent.clone())
        })?;
        if let Some(deadline) = agent.deadline {
            self.arm(id, deadline);
        }

        tracing::info!(unit = %id, retry_count = agent.retry_count, "Agent resumed");
        Ok(agent)
    }

    /// Orphan a live unit with reason `timeout`
    ///
    /// Returns `None` when the unit is no longer live, so a late timer or
    /// a repeated sweep changes nothing.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn on_timeout(&self, id: &UnitId) -> Result<Option<AgentRecord>, LifecycleError> {
        self.orphan_if(id, |_, _| true)
    }

    fn on_deadline(&self, id: &UnitId) -> Result<Option<AgentRecord>, LifecycleError> {
        self.orphan_if(id, |agent, now| agent.deadline.map_or(true, |d| d <= now))
    }

    fn orphan_if(
        &self,
        id: &UnitId,
        due: impl FnOnce(&AgentRecord, DateTime<Utc>) -> bool,
    ) -> Result<Option<AgentRecord>, LifecycleError> {
        let now = self.store.clock().now();
        let orphaned = self.mutate(|state| {
            let Some(idx) = state.active.iter().position(|a| &a.id == id) else {
                return Ok(None);
            };
            let agent = &state.active[idx];
            if !validate_transition(agent.status, AgentStatus::Orphaned) || !due(agent, now) {
                return Ok(None);
            }
            let mut agent = state.active.remove(idx);
            orphan(&mut agent, now);
            state.orphaned.push(agent.clone());
            Ok(Some(agent))
        })?;

        if let Some(agent) = &orphaned {
            self.timers.cancel(id);
            tracing::warn!(
                unit = %id,
                unit_type = %agent.unit_type,
                timeout_ms = agent.timeout_ms,
                "Agent timed out, marked orphaned"
            );
        }
        Ok(orphaned)
    }

    /// Orphan every live unit whose persisted deadline has passed
    ///
    /// Returns the ids it transitioned.
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn sweep_deadlines(&self) -> Result<Vec<UnitId>, LifecycleError> {
        let now = self.store.clock().now();
        let orphaned = self.mutate(|state| {
            let (due, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.active)
                .into_iter()
                .partition(|a| {
                    a.status.is_live() && effective_deadline(a) <= now
                });
            state.active = live;
            let mut ids = Vec::with_capacity(due.len());
            for mut agent in due {
                orphan(&mut agent, now);
                ids.push(agent.id.clone());
                state.orphaned.push(agent);
            }
            Ok(ids)
        })?;

        for id in &orphaned {
            self.timers.cancel(id);
            tracing::warn!(unit = %id, "Deadline passed, marked orphaned");
        }
        Ok(orphaned)
    }

    /// Resolve an orphan
    ///
    /// `retry` counts against the retry budget and is refused once the
    /// budget is spent.
    ///
    /// # Errors
    /// `UnknownUnit`, `IllegalTransition` for a record that is not
    /// orphaned, `RetryBudgetExhausted`, lease or storage failures.
    pub fn recover(&self, id: &UnitId, action: OrphanAction) -> Result<AgentRecord, LifecycleError> {
        let now = self.store.clock().now();
        let agent = self.mutate(|state| {
            let Some(mut agent) = state.take_orphaned(id) else {
                let to = match action {
                    OrphanAction::Terminate => AgentStatus::Terminated,
                    OrphanAction::Retry => AgentStatus::Active,
                };
                return Err(not_in_place(state, id, to));
            };
            agent.recovered_at = Some(now);
            match action {
                OrphanAction::Terminate => {
                    transition(&mut agent, AgentStatus::Terminated)?;
                    agent.recovery_action = Some("terminated".to_string());
                    agent.completed_at = Some(now);
                    state.completed.push(agent.clone());
                }
                OrphanAction::Retry => {
                    if !agent.has_retries_left() {
                        return Err(LifecycleError::RetryBudgetExhausted {
                            id: id.clone(),
                            retry_count: agent.retry_count,
                            max_retries: agent.max_retries,
                        });
                    }
                    transition(&mut agent, AgentStatus::Active)?;
                    agent.recovery_action = Some("retry".to_string());
                    agent.retry_count += 1;
                    agent.deadline = Some(after_ms(now, agent.timeout_ms));
                    state.active.push(agent.clone());
                }
            }
            Ok(agent)
        })?;

        if let (OrphanAction::Retry, Some(deadline)) = (action, agent.deadline) {
            self.arm(id, deadline);
        }
        tracing::info!(unit = %id, %action, retry_count = agent.retry_count, "Orphan recovered");
        Ok(agent)
    }

    /// Report live units older than the staleness factor times their timeout
    ///
    /// Report only; nothing is transitioned.
    ///
    /// # Errors
    /// Storage failures.
    pub fn check_stale(&self) -> Result<StaleReport, LifecycleError> {
        let now = self.store.clock().now();
        let state = self.doc().load()?;
        let multiplier = self.stale_multiplier;

        #[allow(clippy::cast_precision_loss)]
        let stale_agents = state
            .active
            .iter()
            .filter_map(|agent| {
                let elapsed = elapsed_ms(agent.spawned_at, now);
                (elapsed as f64 > agent.timeout_ms as f64 * multiplier).then(|| StaleAgent {
                    id: agent.id.clone(),
                    unit_type: agent.unit_type.clone(),
                    status: agent.status,
                    elapsed_ms: elapsed,
                    timeout_ms: agent.timeout_ms,
                    stale_reason: format!("exceeded {multiplier}x timeout"),
                })
            })
            .collect::<Vec<_>>();

        if !stale_agents.is_empty() {
            tracing::warn!(count = stale_agents.len(), multiplier, "Stale agents found");
        }
        Ok(StaleReport {
            stale_agents,
            active_count: state.active.len(),
        })
    }

    /// Arm a timer for every live unit from its persisted deadline
    ///
    /// Overdue units fire immediately. Returns the number of timers armed.
    ///
    /// # Errors
    /// Storage failures.
    pub fn rearm_timers(&self) -> Result<usize, LifecycleError> {
        let state = self.doc().load()?;
        let armed = state
            .active
            .iter()
            .filter(|a| a.status.is_live())
            .filter(|a| self.arm(&a.id, effective_deadline(a)))
            .count();
        tracing::info!(armed, "Deadline timers re-armed");
        Ok(armed)
    }

    /// Purge terminal records finished more than `older_than_days` ago
    ///
    /// # Errors
    /// Lease or storage failures.
    pub fn cleanup(&self, older_than_days: u32) -> Result<CleanupReport, LifecycleError> {
        let cutoff = self.store.clock().now() - Duration::days(i64::from(older_than_days));
        let report = self.mutate(|state| {
            let before = state.completed.len();
            state
                .completed
                .retain(|a| a.completed_at.is_some_and(|at| at > cutoff));
            Ok(CleanupReport {
                removed_count: before - state.completed.len(),
                remaining_count: state.completed.len(),
            })
        })?;
        tracing::info!(
            removed = report.removed_count,
            remaining = report.remaining_count,
            "Completed agents cleaned up"
        );
        Ok(report)
    }

    /// Live records
    ///
    /// # Errors
    /// Storage failures.
    pub fn list_active(&self) -> Result<Vec<AgentRecord>, LifecycleError> {
        Ok(self.doc().load()?.active)
    }

    /// Orphans awaiting an operator
    ///
    /// # Errors
    /// Storage failures.
    pub fn list_orphaned(&self) -> Result<Vec<AgentRecord>, LifecycleError> {
        Ok(self.doc().load()?.orphaned)
    }

    /// Terminal records
    ///
    /// # Errors
    /// Storage failures.
    pub fn list_completed(&self) -> Result<Vec<AgentRecord>, LifecycleError> {
        Ok(self.doc().load()?.completed)
    }

    /// Record by id from any collection
    ///
    /// # Errors
    /// `UnknownUnit`, storage failures.
    pub fn get(&self, id: &UnitId) -> Result<AgentRecord, LifecycleError> {
        self.doc()
            .load()?
            .find(id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownUnit(id.clone()))
    }

    fn arm(&self, id: &UnitId, deadline: DateTime<Utc>) -> bool {
        let delay = (deadline - self.store.clock().now())
            .to_std()
            .unwrap_or_default();
        let manager = self.clone();
        // The timer only shortens latency; `sweep_deadlines` is authoritative
        // and orphans the unit on a later pass if this attempt loses a lease
        // race (for example against a concurrent `tick` under the same holder).
        self.timers.arm(id.clone(), delay, move |unit| {
            if let Err(e) = manager.on_deadline(unit) {
                tracing::warn!(
                    unit = %unit,
                    error = %e,
                    "Deadline timer could not orphan unit, deferring to the sweep"
                );
            }
        })
    }
}

fn transition(agent: &mut AgentRecord, to: AgentStatus) -> Result<(), LifecycleError> {
    if !validate_transition(agent.status, to) {
        return Err(LifecycleError::IllegalTransition {
            id: agent.id.clone(),
            from: agent.status,
            to,
        });
    }
    agent.status = to;
    Ok(())
}

fn orphan(agent: &mut AgentRecord, now: DateTime<Utc>) {
    agent.status = AgentStatus::Orphaned;
    agent.orphaned_at = Some(now);
    agent.orphan_reason = Some("timeout".to_string());
}

fn effective_deadline(agent: &AgentRecord) -> DateTime<Utc> {
    agent
        .deadline
        .unwrap_or_else(|| after_ms(agent.spawned_at, agent.timeout_ms))
}

/// Index of the live record `id`, checked against the move to `to`
fn live_index(state: &AgentState, id: &UnitId, to: AgentStatus) -> Result<usize, LifecycleError> {
    match state.active.iter().position(|a| &a.id == id) {
        Some(idx) if validate_transition(state.active[idx].status, to) => Ok(idx),
        Some(idx) => Err(LifecycleError::IllegalTransition {
            id: id.clone(),
            from: state.active[idx].status,
            to,
        }),
        None => Err(not_in_place(state, id, to)),
    }
}

fn not_in_place(state: &AgentState, id: &UnitId, to: AgentStatus) -> LifecycleError {
    match state.find(id) {
        Some(agent) => LifecycleError::IllegalTransition {
            id: id.clone(),
            from: agent.status,
            to,
        },
        None => LifecycleError::UnknownUnit(id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fixtures;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use stagehand_core::{Clock, ManualClock};

    struct Harness {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        manager: LifecycleManager,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join(fixtures::CODER_PROMPT);
        std::fs::create_dir_all(prompt.parent().unwrap()).unwrap();
        std::fs::write(&prompt, "# Coding agent\n").unwrap();

        let clock = ManualClock::default();
        let store = Store::open(dir.path(), clock.shared()).with_holder("test");
        let manager = LifecycleManager::new(Arc::new(fixtures::registry()), store);
        Harness {
            _dir: dir,
            clock,
            manager,
        }
    }

    fn spawn_coder(h: &Harness) -> UnitId {
        h.manager
            .spawn("coder", json!({"task": "parser"}), SpawnOptions::default())
            .unwrap()
            .agent
            .id
    }

    #[test]
    fn spawn_persists_an_active_record_with_deadline() {
        let h = harness();
        let spawned = h
            .manager
            .spawn("coder", json!({}), SpawnOptions::default().with_spawned_by("orchestrator"))
            .unwrap();

        let agent = &spawned.agent;
        assert!(agent.id.as_str().starts_with("coder-"));
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.spawned_by, "orchestrator");
        assert_eq!(agent.deadline, Some(after_ms(agent.spawned_at, 900_000)));
        assert_eq!(h.manager.list_active().unwrap(), vec![agent.clone()]);
    }

    #[test]
    fn spawn_rejects_unknown_type_and_missing_artifact() {
        let h = harness();

        let err = h
            .manager
            .spawn("painter", json!({}), SpawnOptions::default())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownType { ref available, .. } if available.len() == 2));

        let err = h
            .manager
            .spawn("planner", json!({}), SpawnOptions::default())
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ArtifactMissing { .. }));
        assert!(h.manager.list_active().unwrap().is_empty());
    }

    #[test]
    fn complete_moves_to_completed_with_duration() {
        let h = harness();
        let id = spawn_coder(&h);
        h.clock.advance_ms(1_500);

        let agent = h.manager.complete(&id, json!({"files": 3})).unwrap();

        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.duration_ms, Some(1_500));
        assert!(h.manager.list_active().unwrap().is_empty());
        assert_eq!(h.manager.list_completed().unwrap().len(), 1);
    }

    #[test]
    fn retries_are_bounded_by_the_budget() {
        let h = harness();
        let id = spawn_coder(&h);

        for expected in 1..=3 {
            let outcome = h
                .manager
                .fail(&id, "SyntaxError: Unexpected token", true)
                .unwrap();
            assert!(outcome.retry);
            assert_eq!(outcome.retry_count, expected);
            assert_eq!(outcome.agent.status, AgentStatus::Retrying);
        }

        let outcome = h
            .manager
            .fail(&id, "SyntaxError: Unexpected token", true)
            .unwrap();
        assert!(!outcome.retry);
        assert_eq!(outcome.agent.status, AgentStatus::Failed);
        assert_eq!(outcome.agent.retry_count, 3);
        assert!(h.manager.list_active().unwrap().is_empty());
    }

    #[test]
    fn non_retryable_failure_is_terminal() {
        let h = harness();
        let id = spawn_coder(&h);

        let outcome = h.manager.fail(&id, "disk full", false).unwrap();

        assert!(!outcome.retry);
        assert_eq!(outcome.agent.error.as_deref(), Some("disk full"));
        let err = h.manager.complete(&id, json!({})).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IllegalTransition { from: AgentStatus::Failed, .. }
        ));
    }

    #[test]
    fn resume_restarts_the_deadline() {
        let h = harness();
        let id = spawn_coder(&h);
        h.manager.fail(&id, "flaky", true).unwrap();
        h.clock.advance_ms(10_000);

        let agent = h.manager.resume(&id).unwrap();

        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.deadline, Some(after_ms(h.clock.now(), 900_000)));
        assert!(matches!(
            h.manager.resume(&id).unwrap_err(),
            LifecycleError::IllegalTransition { from: AgentStatus::Active, .. }
        ));
    }

    #[test]
    fn timeout_orphans_once_and_completion_wins() {
        let h = harness();
        let id = spawn_coder(&h);

        assert!(h.manager.on_timeout(&id).unwrap().is_some());
        assert!(h.manager.on_timeout(&id).unwrap().is_none());
        assert_eq!(h.manager.list_orphaned().unwrap().len(), 1);

        let done = spawn_coder(&h);
        h.manager.complete(&done, json!({})).unwrap();
        assert!(h.manager.on_timeout(&done).unwrap().is_none());
        assert_eq!(h.manager.get(&done).unwrap().status, AgentStatus::Completed);
    }

    #[test]
    fn sweep_orphans_only_past_deadline() {
        let h = harness();
        let id = spawn_coder(&h);

        h.clock.advance_ms(899_999);
        assert!(h.manager.sweep_deadlines().unwrap().is_empty());

        h.clock.advance_ms(1);
        assert_eq!(h.manager.sweep_deadlines().unwrap(), vec![id.clone()]);
        assert!(h.manager.sweep_deadlines().unwrap().is_empty());

        let orphan = h.manager.get(&id).unwrap();
        assert_eq!(orphan.status, AgentStatus::Orphaned);
        assert_eq!(orphan.orphan_reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn recover_retry_counts_against_the_budget() {
        let h = harness();
        let id = spawn_coder(&h);
        for _ in 0..3 {
            h.manager.fail(&id, "flaky", true).unwrap();
        }
        h.manager.on_timeout(&id).unwrap();

        let err = h.manager.recover(&id, OrphanAction::Retry).unwrap_err();
        assert!(matches!(err, LifecycleError::RetryBudgetExhausted { retry_count: 3, .. }));
        assert_eq!(h.manager.list_orphaned().unwrap().len(), 1);

        let agent = h.manager.recover(&id, OrphanAction::Terminate).unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert_eq!(h.manager.list_completed().unwrap().len(), 1);
    }

    #[test]
    fn recover_retry_reinstates_with_fresh_deadline() {
        let h = harness();
        let id = spawn_coder(&h);
        h.clock.advance_ms(900_000);
        h.manager.sweep_deadlines().unwrap();

        let agent = h.manager.recover(&id, OrphanAction::Retry).unwrap();

        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.retry_count, 1);
        assert_eq!(agent.deadline, Some(after_ms(h.clock.now(), 900_000)));
        assert_eq!(agent.recovery_action.as_deref(), Some("retry"));
        assert!(h.manager.list_orphaned().unwrap().is_empty());
    }

    #[test]
    fn recover_unknown_unit_is_not_found() {
        let h = harness();
        let err = h
            .manager
            .recover(&UnitId::new("coder-missing"), OrphanAction::Terminate)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn stale_check_uses_the_multiplier() {
        let h = harness();
        let id = spawn_coder(&h);

        h.clock.advance_ms(1_800_000);
        assert!(h.manager.check_stale().unwrap().stale_agents.is_empty());

        h.clock.advance_ms(1);
        let report = h.manager.check_stale().unwrap();
        assert_eq!(report.active_count, 1);
        assert_eq!(report.stale_agents[0].id, id);

        let strict = h.manager.clone().with_stale_multiplier(1.0);
        assert_eq!(strict.check_stale().unwrap().stale_agents.len(), 1);
    }

    #[test]
    fn cleanup_purges_old_terminal_records() {
        let h = harness();
        let old = spawn_coder(&h);
        h.manager.complete(&old, json!({})).unwrap();
        h.clock.advance_ms(8 * 24 * 60 * 60 * 1000);
        let recent = spawn_coder(&h);
        h.manager.complete(&recent, json!({})).unwrap();

        let report = h.manager.cleanup(7).unwrap();

        assert_eq!(
            report,
            CleanupReport {
                removed_count: 1,
                remaining_count: 1
            }
        );
        assert!(h.manager.get(&old).unwrap_err().is_not_found());
    }

    #[test]
    fn orphan_action_parses() {
        assert_eq!("retry".parse::<OrphanAction>(), Ok(OrphanAction::Retry));
        assert!("restart".parse::<OrphanAction>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_timer_orphans_exactly_once() {
        let h = harness();
        let id = spawn_coder(&h);
        assert!(h.manager.timers().is_armed(&id));

        h.clock.advance_ms(900_000);
        tokio::time::sleep(std::time::Duration::from_millis(900_001)).await;

        assert_eq!(h.manager.get(&id).unwrap().status, AgentStatus::Orphaned);
        assert!(h.manager.sweep_deadlines().unwrap().is_empty());
        assert_eq!(h.manager.list_orphaned().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_cancels_the_timer() {
        let h = harness();
        let id = spawn_coder(&h);

        h.manager.complete(&id, json!({})).unwrap();
        assert!(!h.manager.timers().is_armed(&id));

        h.clock.advance_ms(900_000);
        tokio::time::sleep(std::time::Duration::from_millis(900_001)).await;

        assert_eq!(h.manager.get(&id).unwrap().status, AgentStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_restores_timers_from_persisted_deadlines() {
        let h = harness();
        let id = spawn_coder(&h);
        let restarted = LifecycleManager::new(Arc::new(fixtures::registry()), h.manager.store.clone());
        h.manager.timers().cancel(&id);

        assert_eq!(restarted.rearm_timers().unwrap(), 1);
        h.clock.advance_ms(900_000);
        tokio::time::sleep(std::time::Duration::from_millis(900_001)).await;

        assert_eq!(restarted.list_orphaned().unwrap().len(), 1);
    }
}
