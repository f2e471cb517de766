//! Project state ⇄ memory synchronization
//!
//! The memory document is written by note-taking collaborators; decisions,
//! blockers and progress recorded there are mirrored into the project state
//! and the workflow position is mirrored back as progress entries. Every
//! direction runs under the `state-sync` lease, and writes to the project
//! state additionally take the `project-state` lease.

use crate::error::KernelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use stagehand_core::{elapsed_ms, Issue, ProjectState, StageStatus};
use stagehand_store::{keys, JsonDocument, Store, StoreError};
use std::collections::BTreeMap;

/// Drift between the two sync timestamps that calls for a new sync
pub const MAX_SYNC_DRIFT_MS: u64 = 60_000;

/// Block reason set while memory blockers exist
pub const MEMORY_BLOCKERS: &str = "memory_blockers";

/// Entry maps of the memory document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySections {
    /// Decisions by key
    #[serde(default)]
    pub decisions: BTreeMap<String, Value>,
    /// Progress entries by key
    #[serde(default)]
    pub progress: BTreeMap<String, Value>,
    /// Open blockers by key
    #[serde(default)]
    pub blockers: BTreeMap<String, Value>,
    /// Free-form notes by key
    #[serde(default)]
    pub notes: BTreeMap<String, Value>,
    /// Sections owned by other tools
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemorySections {
    fn total_entries(&self) -> usize {
        self.decisions.len() + self.progress.len() + self.blockers.len() + self.notes.len()
    }
}

/// Counters kept alongside the entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    /// Entries over all sections
    #[serde(default)]
    pub total_entries: usize,
    /// Counters owned by other tools
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The memory document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDocument {
    /// Entry maps
    #[serde(default)]
    pub memory: MemorySections,
    /// Last project → memory sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_project_state_sync: Option<DateTime<Utc>>,
    /// Last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Counters
    #[serde(default)]
    pub statistics: MemoryStatistics,
    /// Fields owned by other tools
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One change made by a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncChange {
    /// An entry was copied
    Synced {
        /// Section
        field: String,
        /// Entry key
        key: String,
    },
    /// The stage status followed the memory blockers
    StageStatusChanged {
        /// Status before
        from: StageStatus,
        /// Status after
        to: StageStatus,
        /// Why
        reason: String,
    },
}

/// Result of one sync direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// When the sync ran
    pub synced_at: DateTime<Utc>,
    /// What changed
    pub changes: Vec<SyncChange>,
}

/// Result of syncing both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BothReport {
    /// Memory → project
    pub memory_to_project: SyncReport,
    /// Project → memory
    pub project_to_memory: SyncReport,
    /// Changes over both directions
    pub total_changes: usize,
}

/// How far apart the two documents are
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Last memory → project sync
    pub project_state_last_sync: Option<DateTime<Utc>>,
    /// Last project → memory sync
    pub memory_last_sync: Option<DateTime<Utc>>,
    /// Distance between the two timestamps
    pub sync_difference_ms: Option<u64>,
    /// Whether a sync is advisable
    pub needs_sync: bool,
    /// Findings
    pub issues: Vec<Issue>,
}

/// Result of a repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// When the repair ran
    pub repaired_at: DateTime<Utc>,
    /// Issues before
    pub issues_found: usize,
    /// Changes made
    pub changes: usize,
    /// Issues after
    pub issues_after: usize,
    /// Whether a sync is still advisable
    pub needs_sync_after: bool,
}

/// Synchronizer bound to a project
#[derive(Debug, Clone)]
pub struct StateSync {
    store: Store,
}

impl StateSync {
    /// Synchronizer over `store`
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn memory_doc(&self) -> JsonDocument<MemoryDocument> {
        self.store.document(self.store.layout().memory())
    }

    /// Current memory document (empty when absent)
    ///
    /// # Errors
    /// Storage failures.
    pub fn memory(&self) -> Result<MemoryDocument, StoreError> {
        self.memory_doc().load()
    }

    /// Mirror memory decisions, blockers and progress into the project state
    ///
    /// # Errors
    /// Lease conflicts, an uninitialized project or storage failures.
    pub fn memory_to_project(&self) -> Result<SyncReport, KernelError> {
        self.store.locked(keys::STATE_SYNC, || self.pull())
    }

    /// Mirror the workflow position into memory progress entries
    ///
    /// # Errors
    /// Lease conflicts, an uninitialized project or storage failures.
    pub fn project_to_memory(&self) -> Result<SyncReport, KernelError> {
        self.store.locked(keys::STATE_SYNC, || self.push())
    }

    /// Memory → project, then project → memory
    ///
    /// # Errors
    /// See [`Self::memory_to_project`].
    pub fn sync_both(&self) -> Result<BothReport, KernelError> {
        self.store.locked(keys::STATE_SYNC, || self.both())
    }

    /// Compare the two documents without writing
    ///
    /// # Errors
    /// An uninitialized project or storage failures.
    pub fn status(&self) -> Result<SyncStatus, KernelError> {
        let state = self.store.project_state().load_existing()?;
        let memory = self.memory()?;
        Ok(compare(&state, &memory))
    }

    /// Sync both directions and report what is left
    ///
    /// # Errors
    /// See [`Self::memory_to_project`].
    pub fn repair(&self) -> Result<RepairReport, KernelError> {
        let repaired_at = self.store.clock().now();
        self.store.locked(keys::STATE_SYNC, || {
            let before = self.status()?;
            let both = self.both()?;
            let after = self.status()?;
            tracing::info!(
                issues_found = before.issues.len(),
                changes = both.total_changes,
                issues_after = after.issues.len(),
                "State repaired"
            );
            Ok(RepairReport {
                repaired_at,
                issues_found: before.issues.len(),
                changes: both.total_changes,
                issues_after: after.issues.len(),
                needs_sync_after: after.needs_sync,
            })
        })
    }

    fn both(&self) -> Result<BothReport, KernelError> {
        let memory_to_project = self.pull()?;
        let project_to_memory = self.push()?;
        Ok(BothReport {
            total_changes: memory_to_project.changes.len() + project_to_memory.changes.len(),
            memory_to_project,
            project_to_memory,
        })
    }

    fn pull(&self) -> Result<SyncReport, KernelError> {
        let now = self.store.clock().now();
        let memory = self.memory()?.memory;

        let changes = self.store.locked(keys::PROJECT_STATE, || {
            self.store.project_state().try_update_existing(|state| {
                let mut changes = Vec::new();
                mirror(&memory.decisions, &mut state.decisions, "decisions", &mut changes);
                mirror(&memory.blockers, &mut state.blockers, "blockers", &mut changes);
                mirror(&memory.progress, &mut state.memory_progress, "progress", &mut changes);
                changes.extend(follow_blockers(state, !memory.blockers.is_empty()));
                state.last_memory_sync = Some(now);
                Ok::<_, KernelError>(changes)
            })
        })?;

        tracing::info!(changes = changes.len(), "Memory synced into project state");
        Ok(SyncReport {
            synced_at: now,
            changes,
        })
    }

    fn push(&self) -> Result<SyncReport, KernelError> {
        let now = self.store.clock().now();
        let state = self.store.project_state().load_existing()?;

        let changes = self.memory_doc().update(|memory| {
            let mut changes = Vec::new();
            let progress = &mut memory.memory.progress;

            if let Some(stage) = &state.current_stage {
                let mut add = |key: String, value: String, context: String| {
                    if !progress.contains_key(&key) {
                        progress.insert(key.clone(), progress_entry(&key, &value, &context, now));
                        changes.push(SyncChange::Synced {
                            field: "progress".to_string(),
                            key,
                        });
                    }
                };
                add(
                    format!("current-phase-{stage}"),
                    stage.to_string(),
                    "Current phase from project state".to_string(),
                );
                add(
                    format!("phase-status-{stage}"),
                    state.stage_status.to_string(),
                    format!("Phase {stage} status"),
                );
            }

            for stage in &state.completed_stages {
                let key = format!("phase-complete-{stage}");
                if !progress.contains_key(&key) {
                    let entry = progress_entry(&key, "complete", &format!("Phase {stage} completed"), now);
                    progress.insert(key.clone(), entry);
                    changes.push(SyncChange::Synced {
                        field: "progress".to_string(),
                        key,
                    });
                }
            }

            memory.last_project_state_sync = Some(now);
            memory.updated_at = Some(now);
            memory.statistics.total_entries = memory.memory.total_entries();
            changes
        })?;

        tracing::info!(changes = changes.len(), "Project state synced into memory");
        Ok(SyncReport {
            synced_at: now,
            changes,
        })
    }
}

/// Copy new or changed entries of `from` into `into`
fn mirror(
    from: &BTreeMap<String, Value>,
    into: &mut BTreeMap<String, Value>,
    field: &str,
    changes: &mut Vec<SyncChange>,
) {
    for (key, value) in from {
        if into.get(key) != Some(value) {
            into.insert(key.clone(), value.clone());
            changes.push(SyncChange::Synced {
                field: field.to_string(),
                key: key.clone(),
            });
        }
    }
}

/// Block on memory blockers; unblock only a block this sync set
fn follow_blockers(state: &mut ProjectState, has_blockers: bool) -> Option<SyncChange> {
    let blocked = state.stage_status == StageStatus::Blocked;
    if has_blockers && !blocked {
        let from = state.stage_status;
        state.block(MEMORY_BLOCKERS);
        return Some(SyncChange::StageStatusChanged {
            from,
            to: StageStatus::Blocked,
            reason: "Active blockers in memory".to_string(),
        });
    }
    if !has_blockers && blocked && state.blocked_reason.as_deref() == Some(MEMORY_BLOCKERS) {
        state.unblock();
        return Some(SyncChange::StageStatusChanged {
            from: StageStatus::Blocked,
            to: StageStatus::InProgress,
            reason: "All blockers resolved".to_string(),
        });
    }
    None
}

fn progress_entry(key: &str, value: &str, context: &str, now: DateTime<Utc>) -> Value {
    json!({
        "key": key,
        "value": value,
        "category": "progress",
        "timestamp": now,
        "context": context,
    })
}

fn compare(state: &ProjectState, memory: &MemoryDocument) -> SyncStatus {
    let mut status = SyncStatus {
        project_state_last_sync: state.last_memory_sync,
        memory_last_sync: memory.last_project_state_sync,
        sync_difference_ms: None,
        needs_sync: false,
        issues: Vec::new(),
    };

    match (state.last_memory_sync, memory.last_project_state_sync) {
        (Some(project), Some(mem)) => {
            let drift = elapsed_ms(project.min(mem), project.max(mem));
            status.sync_difference_ms = Some(drift);
            if drift > MAX_SYNC_DRIFT_MS {
                status.needs_sync = true;
                status.issues.push(Issue::warning(
                    "last_memory_sync",
                    format!("Sync difference exceeds 1 minute ({drift} ms)"),
                ));
            }
        }
        _ => {
            status.needs_sync = true;
            status
                .issues
                .push(Issue::error("last_memory_sync", "No sync timestamp found"));
        }
    }

    let missing_in_memory: Vec<&str> = state
        .decisions
        .keys()
        .filter(|k| !memory.memory.decisions.contains_key(*k))
        .map(String::as_str)
        .collect();
    let missing_in_project: Vec<&str> = memory
        .memory
        .decisions
        .keys()
        .filter(|k| !state.decisions.contains_key(*k))
        .map(String::as_str)
        .collect();

    if !missing_in_memory.is_empty() {
        status.needs_sync = true;
        status.issues.push(Issue::warning(
            "decisions",
            format!("Decisions in project state not in memory: {}", missing_in_memory.join(", ")),
        ));
    }
    if !missing_in_project.is_empty() {
        status.needs_sync = true;
        status.issues.push(Issue::warning(
            "decisions",
            format!("Decisions in memory not in project state: {}", missing_in_project.join(", ")),
        ));
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stagehand_core::{ManualClock, StageId};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        sync: StateSync,
        store: Store,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = Store::open(dir.path(), clock.clone()).with_holder("sync-test");
        store
            .project_state()
            .save(&ProjectState::at_stage("phase_01"))
            .unwrap();
        Fixture {
            _dir: dir,
            clock,
            sync: StateSync::new(store.clone()),
            store,
        }
    }

    fn write_memory(f: &Fixture, memory: &MemoryDocument) {
        f.store
            .document::<MemoryDocument>(f.store.layout().memory())
            .save(memory)
            .unwrap();
    }

    #[test]
    fn memory_blockers_block_and_clear() {
        let f = fixture();
        let mut memory = MemoryDocument::default();
        memory
            .memory
            .decisions
            .insert("db".into(), json!({"value": "postgres"}));
        memory
            .memory
            .blockers
            .insert("vendor".into(), json!({"value": "waiting on contract"}));
        write_memory(&f, &memory);

        let report = f.sync.memory_to_project().unwrap();
        assert_eq!(report.changes.len(), 3);
        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.stage_status, StageStatus::Blocked);
        assert_eq!(state.blocked_reason.as_deref(), Some(MEMORY_BLOCKERS));
        assert!(state.decisions.contains_key("db"));

        memory.memory.blockers.clear();
        write_memory(&f, &memory);
        let report = f.sync.memory_to_project().unwrap();
        assert_eq!(
            report.changes,
            [SyncChange::StageStatusChanged {
                from: StageStatus::Blocked,
                to: StageStatus::InProgress,
                reason: "All blockers resolved".into(),
            }]
        );
    }

    #[test]
    fn other_blocks_are_left_alone() {
        let f = fixture();
        f.store
            .project_state()
            .update(|s| s.block("ESC-1"))
            .unwrap();

        f.sync.memory_to_project().unwrap();

        let state = f.store.project_state().load().unwrap();
        assert_eq!(state.blocked_reason.as_deref(), Some("ESC-1"));
    }

    #[test]
    fn project_position_becomes_progress_once() {
        let f = fixture();
        f.store
            .project_state()
            .update(|s| s.completed_stages.push(StageId::from("phase_00")))
            .unwrap();

        let first = f.sync.project_to_memory().unwrap();
        let second = f.sync.project_to_memory().unwrap();

        assert_eq!(first.changes.len(), 3);
        assert!(second.changes.is_empty());
        let memory = f.sync.memory().unwrap();
        assert_eq!(memory.memory.progress["phase-complete-phase_00"]["value"], "complete");
        assert_eq!(memory.memory.progress["current-phase-phase_01"]["value"], "phase_01");
        assert_eq!(memory.statistics.total_entries, 3);
    }

    #[test]
    fn status_reports_drift_and_missing_decisions() {
        let f = fixture();
        let status = f.sync.status().unwrap();
        assert!(status.needs_sync);
        assert_eq!(status.issues[0].message, "No sync timestamp found");

        f.sync.sync_both().unwrap();
        assert!(!f.sync.status().unwrap().needs_sync);

        f.clock.advance_ms(120_000);
        f.sync.project_to_memory().unwrap();
        f.store
            .project_state()
            .update(|s| {
                s.decisions.insert("api".into(), json!("rest"));
            })
            .unwrap();

        let status = f.sync.status().unwrap();
        assert_eq!(status.sync_difference_ms, Some(120_000));
        assert_eq!(status.issues.len(), 2);
        assert!(status.issues[1].message.ends_with("not in memory: api"));
    }

    #[test]
    fn repair_leaves_nothing_to_do() {
        let f = fixture();
        let report = f.sync.repair().unwrap();
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.issues_after, 0);
        assert!(!report.needs_sync_after);
    }
}
