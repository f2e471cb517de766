//! Per-stage escalation policies

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stagehand_core::StageId;

/// How cases for one stage are escalated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Role that normally approves the stage
    pub primary_approver: String,
    /// Ordered approval levels, level 0 first
    pub path: Vec<String>,
    /// Inactivity after which a pending case is due for escalation
    pub timeout_hours: u64,
    /// Whether overdue cases are escalated automatically
    #[serde(default = "default_auto_escalate")]
    pub auto_escalate: bool,
}

fn default_auto_escalate() -> bool {
    true
}

/// Policies keyed by stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: IndexMap<StageId, EscalationPolicy>,
}

impl PolicyTable {
    /// Table from `(stage, policy)` pairs
    #[must_use]
    pub fn new(policies: impl IntoIterator<Item = (StageId, EscalationPolicy)>) -> Self {
        Self {
            policies: policies.into_iter().collect(),
        }
    }

    /// Policy for `stage`
    #[inline]
    #[must_use]
    pub fn get(&self, stage: &StageId) -> Option<&EscalationPolicy> {
        self.policies.get(stage)
    }

    /// All policies in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&StageId, &EscalationPolicy)> {
        self.policies.iter()
    }

    /// Number of stages with a policy
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no stage has a policy
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
