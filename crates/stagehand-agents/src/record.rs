//! Agent records and the agent-state document

use crate::status::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::UnitId;

/// One spawned unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unit id, `<type>-<ULID>`
    pub id: UnitId,
    /// Unit type name
    #[serde(rename = "type")]
    pub unit_type: String,
    /// Display name of the type
    #[serde(default)]
    pub name: String,
    /// Spawn time
    pub spawned_at: DateTime<Utc>,
    /// Who spawned it
    pub spawned_by: String,
    /// Caller-supplied context
    #[serde(default)]
    pub context: Value,
    /// Deadline length
    pub timeout_ms: u64,
    /// Current deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Retries allowed
    pub max_retries: u32,
    /// Retries used
    #[serde(default)]
    pub retry_count: u32,
    /// Status
    pub status: AgentStatus,
    /// Result payload of a completed unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Final error of a failed unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error of the latest retried failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the record left the active set for good
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the unit failed terminally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Spawn to terminal report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// When the deadline passed unreported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_at: Option<DateTime<Utc>>,
    /// Why it was orphaned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_reason: Option<String>,
    /// When an operator recovered the orphan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<DateTime<Utc>>,
    /// How it was recovered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_action: Option<String>,
}

impl AgentRecord {
    /// Whether a retry is still allowed
    #[inline]
    #[must_use]
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// The agent-state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Live records (active or retrying)
    #[serde(default)]
    pub active: Vec<AgentRecord>,
    /// Terminal records (completed, failed or terminated)
    #[serde(default)]
    pub completed: Vec<AgentRecord>,
    /// Orphans awaiting an operator
    #[serde(default)]
    pub orphaned: Vec<AgentRecord>,
}

impl AgentState {
    /// Remove an orphan
    pub fn take_orphaned(&mut self, id: &UnitId) -> Option<AgentRecord> {
        let idx = self.orphaned.iter().position(|a| &a.id == id)?;
        Some(self.orphaned.remove(idx))
    }

    /// Record by id, wherever it lives
    #[must_use]
    pub fn find(&self, id: &UnitId) -> Option<&AgentRecord> {
        self.active
            .iter()
            .chain(&self.orphaned)
            .chain(&self.completed)
            .find(|a| &a.id == id)
    }
}
