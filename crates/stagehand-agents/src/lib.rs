//! Stagehand Agents - agent lifecycle manager
//!
//! Tracks time-bounded units of work from spawn to a terminal state:
//!
//! ```text
//! spawning -> active -> completed | failed | orphaned | retrying -> active
//! orphaned -> active (retry) | terminated (terminate)
//! ```
//!
//! Every record carries a persisted deadline. Two mechanisms enforce it:
//! an in-process tokio timer per unit (fast, lost on restart) and
//! [`LifecycleManager::sweep_deadlines`], which compares the persisted
//! deadlines against the clock and is the authoritative one. A completion
//! or failure that lands first always wins; orphaning a record that already
//! left the active set is a no-op.

pub mod error;
pub mod manager;
pub mod record;
pub mod registry;
pub mod status;
pub mod timers;

pub use error::LifecycleError;
pub use manager::{
    CleanupReport, FailOutcome, LifecycleManager, OrphanAction, SpawnOptions, Spawned, StaleAgent,
    StaleReport, DEFAULT_STALE_MULTIPLIER,
};
pub use record::{AgentRecord, AgentState};
pub use registry::{UnitType, UnitTypeRegistry};
pub use status::{allowed_transitions, validate_transition, AgentStatus};
pub use timers::DeadlineTimers;
