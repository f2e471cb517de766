//! Bounded ledger of known-good checkpoints

use crate::history::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::UnitId;
use std::collections::VecDeque;

/// A recorded known-good state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Revision reference (for git, a commit)
    pub reference: String,
    /// Unit whose work produced the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitId>,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// The checkpoint-ledger document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointLedger {
    /// Checkpoints, oldest first
    #[serde(default)]
    pub checkpoints: VecDeque<Checkpoint>,
    /// Reference of the latest known-good checkpoint
    #[serde(default)]
    pub last_good: Option<String>,
    /// Bookkeeping
    #[serde(default)]
    pub metadata: Metadata,
}

impl CheckpointLedger {
    /// Append `checkpoint`, keep at most `retention` entries, and make it
    /// the last good one
    pub fn record(&mut self, checkpoint: Checkpoint, retention: usize) {
        self.metadata.touch(checkpoint.recorded_at);
        self.last_good = Some(checkpoint.reference.clone());
        self.checkpoints.push_back(checkpoint);
        while self.checkpoints.len() > retention.max(1) {
            self.checkpoints.pop_front();
        }
    }

    /// The last good checkpoint
    #[must_use]
    pub fn last_good(&self) -> Option<&Checkpoint> {
        let reference = self.last_good.as_deref()?;
        self.checkpoints.iter().rev().find(|c| c.reference == reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(reference: &str) -> Checkpoint {
        Checkpoint {
            reference: reference.to_string(),
            unit: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn ledger_is_bounded_and_tracks_the_latest() {
        let mut ledger = CheckpointLedger::default();
        for i in 0..15 {
            ledger.record(checkpoint(&format!("c{i}")), 10);
        }

        assert_eq!(ledger.checkpoints.len(), 10);
        assert_eq!(ledger.checkpoints.front().map(|c| c.reference.as_str()), Some("c5"));
        assert_eq!(ledger.last_good.as_deref(), Some("c14"));
        assert_eq!(ledger.last_good().map(|c| c.reference.as_str()), Some("c14"));
    }
}
