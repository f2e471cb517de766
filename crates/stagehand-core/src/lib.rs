//! Stagehand Core - shared vocabulary
//!
//! Types every kernel component agrees on:
//! - Identifiers for units, escalation cases and stages
//! - The injected [`Clock`]
//! - The persisted [`ProjectState`] document and the escalation cases it
//!   carries
//! - Validation [`Issue`]s with a severity
//!
//! Nothing in this crate touches the filesystem; persistence lives in
//! `stagehand-store`.

pub mod clock;
pub mod escalation;
pub mod ids;
pub mod issue;
pub mod project;

pub use clock::{after_ms, elapsed_ms, Clock, ManualClock, SharedClock, SystemClock};
pub use escalation::{
    Escalation, EscalationReason, EscalationStatus, TimelineAction, TimelineEntry,
};
pub use ids::{EscalationId, StageId, UnitId};
pub use issue::{Issue, Severity};
pub use project::{
    ArtifactEntry, Backlog, CriteriaKind, Decision, DecisionRecord, LastDecision, ProjectState,
    StageStatus, StageValidation, ValidationRecord,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
