//! Stagehand Recovery - recovery manager
//!
//! The last line of defense when a unit of work keeps failing:
//! - classifies failure text through an ordered, pluggable rule list
//! - keeps an append-only attempt history per unit
//! - detects circular fixes (repeated, textually similar approaches)
//! - keeps a bounded ledger of known-good checkpoints and rolls the
//!   working tree back to the latest one
//! - marks units stuck and drops a `PAUSE` marker that halts automation
//!   until a human removes it
//!
//! Circular-fix detection is a cheap word-overlap heuristic, not semantic
//! matching; false positives and negatives are expected.

pub mod checkpoint;
pub mod error;
pub mod history;
pub mod manager;
pub mod rules;
pub mod similarity;
pub mod worktree;

pub use checkpoint::{Checkpoint, CheckpointLedger};
pub use error::RecoveryError;
pub use history::{AttemptHistory, AttemptRecord, UnitHistory};
pub use manager::{Attempt, Classification, Recommendation, RecoveryManager, RecoverySummary};
pub use rules::{
    FailureClassifier, FailureRule, FailureRules, FailureSeverity, PatternClassifier,
    RecoveryAction, RecoveryConfig, RecoveryThresholds,
};
pub use similarity::jaccard;
pub use worktree::{GitWorkingTree, WorkingTree};
