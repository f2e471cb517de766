//! Attempt history document

use crate::similarity::jaccard;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::UnitId;
use std::collections::BTreeMap;

/// One attempt at a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Session number of the attempt
    pub session: u32,
    /// Whether it worked
    pub success: bool,
    /// How it was tackled
    pub approach: String,
    /// Failure text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// Everything known about one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitHistory {
    /// Attempts, oldest first
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// First attempt time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Marked stuck
    #[serde(default)]
    pub stuck: bool,
    /// Why it is stuck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_reason: Option<String>,
}

impl UnitHistory {
    /// Whether `approach` repeats recent attempts
    ///
    /// Needs at least `window` prior attempts. Compares `approach` with
    /// each of the last `window` approaches and reports a circular fix when
    /// at least `repetitions` of them are more similar than `similarity`.
    #[must_use]
    pub fn is_circular(&self, approach: &str, window: usize, similarity: f64, repetitions: usize) -> bool {
        if window == 0 || self.attempts.len() < window {
            return false;
        }
        let recent = &self.attempts[self.attempts.len() - window..];
        let similar = recent
            .iter()
            .filter(|a| jaccard(approach, &a.approach) > similarity)
            .count();
        similar >= repetitions
    }
}

/// Bookkeeping timestamps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Document creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Metadata {
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.last_updated = Some(now);
    }
}

/// The attempt-history document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptHistory {
    /// Per-unit histories
    #[serde(default)]
    pub units: BTreeMap<UnitId, UnitHistory>,
    /// Units marked stuck, in marking order
    #[serde(default)]
    pub stuck_units: Vec<UnitId>,
    /// Bookkeeping
    #[serde(default)]
    pub metadata: Metadata,
}

impl AttemptHistory {
    /// Attempts recorded for `unit`
    #[must_use]
    pub fn attempt_count(&self, unit: &UnitId) -> usize {
        self.units.get(unit).map_or(0, |h| h.attempts.len())
    }

    /// Append an attempt, returning the unit's new attempt count
    pub fn push(&mut self, unit: &UnitId, attempt: AttemptRecord) -> usize {
        let now = attempt.timestamp;
        let history = self.units.entry(unit.clone()).or_default();
        history.created_at.get_or_insert(now);
        history.attempts.push(attempt);
        let count = history.attempts.len();
        self.metadata.touch(now);
        count
    }

    /// Mark `unit` stuck; returns false if it already was
    pub fn mark_stuck(&mut self, unit: &UnitId, reason: &str, now: DateTime<Utc>) -> bool {
        if let Some(history) = self.units.get_mut(unit) {
            history.stuck = true;
            history.stuck_reason = Some(reason.to_string());
        }
        self.metadata.touch(now);
        if self.stuck_units.contains(unit) {
            return false;
        }
        self.stuck_units.push(unit.clone());
        true
    }

    /// Total attempts over all units
    #[must_use]
    pub fn total_attempts(&self) -> usize {
        self.units.values().map(|h| h.attempts.len()).sum()
    }
}
