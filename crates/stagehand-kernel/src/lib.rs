//! Stagehand Kernel - composition root
//!
//! Loads the configuration, binds the lease lock, phase gate, escalation
//! engine, recovery manager and agent lifecycle manager to one project root,
//! and carries the control flow between them:
//!
//! ```text
//! spawn -> timeout/failure -> retry budget -> classify -> recommend
//!                                                  |-> escalate (case on current stage)
//!                                                  |-> pause (PAUSE marker, stuck unit)
//! advance -> gate check -> next stage | phase_gate_failed case
//! ```
//!
//! The `stagehand` binary exposes every operation as a subcommand that
//! prints a JSON payload and exits 0 or 1.

pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod sync;

pub use config::{ArtifactKind, ConfigSource, KernelConfig};
pub use error::{ErrorKind, KernelError};
pub use kernel::{
    FailureReport, Kernel, KernelStatus, StageAdvance, Tick, AUTO_ESCALATION_ACTOR,
    RECOVERY_REQUESTER,
};
pub use logging::LogFormat;
pub use sync::{MemoryDocument, StateSync, SyncStatus};
