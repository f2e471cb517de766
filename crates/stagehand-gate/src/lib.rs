//! Stagehand Gate - phase gate state machine
//!
//! A static table of stages, each with entry and exit criteria, an approver
//! and an optional next stage. A transition out of a stage is legal only
//! when its exit criteria and the next stage's entry criteria both hold.
//!
//! A required criterion is satisfied when it was explicitly marked
//! validated, or when the artifact it references is registered. Dynamic
//! criteria that nobody validated only produce warnings.
//!
//! # Modules
//! - [`table`]: the immutable gate table loaded from configuration
//! - [`evaluate`]: pure criteria evaluation against a [`ProjectState`]
//! - [`validator`]: pluggable artifact validators
//! - [`gate`]: the [`PhaseGate`] service reading and writing the project state
//!
//! [`ProjectState`]: stagehand_core::ProjectState

pub mod error;
pub mod evaluate;
pub mod gate;
pub mod table;
pub mod validator;

pub use error::GateError;
pub use evaluate::{Blocker, GateReport, Transition};
pub use gate::{ArtifactOutcome, PhaseGate};
pub use table::{ClosurePolicy, CompletionCondition, Criterion, GateTable, StageGate};
pub use validator::{ArtifactValidator, RequiredSections, ValidatorRegistry, Verdict};
