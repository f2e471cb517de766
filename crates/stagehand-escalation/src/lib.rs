//! Stagehand Escalation - multi-level escalation engine
//!
//! Opens, tracks and resolves escalation cases tied to a stage and a
//! reason. Each stage has an ordered approval path; a case starts at level 0
//! and walks up one level per escalation.
//!
//! ```text
//! open -> acknowledged -> escalated (while level < max) -> resolved | rejected
//! ```
//!
//! Timeout detection ([`EscalationEngine::check_timeouts`]) only reports
//! overdue cases; performing the escalation is left to the caller so a
//! report-only run is possible.

pub mod engine;
pub mod error;
pub mod policy;

pub use engine::{CreateEscalation, DueEscalation, EscalationEngine, GoNoGoOutcome};
pub use error::EscalationError;
pub use policy::{EscalationPolicy, PolicyTable};
