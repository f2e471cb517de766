//! Stagehand CLI
//!
//! Every command prints one JSON payload on stdout and exits 0 on success,
//! 1 on failure. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use stagehand_agents::{OrphanAction, SpawnOptions};
use stagehand_core::{
    CriteriaKind, Decision, EscalationId, EscalationReason, EscalationStatus, StageId,
    SystemClock, UnitId,
};
use stagehand_escalation::CreateEscalation;
use stagehand_kernel::{logging, Kernel, KernelConfig, KernelError, LogFormat};
use stagehand_recovery::Attempt;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Crash-recoverable orchestration kernel for multi-stage agent work", version)]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (default: <root>/.stagehand/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Lease holder identity (default: unique per invocation)
    #[arg(long, global = true)]
    holder: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Project overview
    Status,

    /// Agent lifecycle
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Phase gates
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },

    /// Escalations and go/no-go decisions
    Escalation {
        #[command(subcommand)]
        command: EscalationCommands,
    },

    /// Failure recovery
    Recovery {
        #[command(subcommand)]
        command: RecoveryCommands,
    },

    /// Lease locks
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },

    /// Project state and memory synchronization
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Spawn a unit
    Spawn {
        /// Unit type
        unit_type: String,
        /// Context as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,
        /// Timeout override
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Spawner identity
        #[arg(long)]
        spawned_by: Option<String>,
    },
    /// Mark a unit completed
    Complete {
        /// Unit id
        id: String,
        /// Result as JSON
        #[arg(long, default_value = "null")]
        result: String,
    },
    /// Report a failed unit
    Fail {
        /// Unit id
        id: String,
        /// Error text
        error: String,
        /// Do not spend a retry
        #[arg(long)]
        fatal: bool,
    },
    /// Finish the recovery chain of a failed unit
    Reclassify {
        /// Unit id
        id: String,
    },
    /// Acknowledge that a granted retry started
    Resume {
        /// Unit id
        id: String,
    },
    /// Decide what happens to an orphan
    Recover {
        /// Unit id
        id: String,
        /// `retry` or `terminate`
        action: OrphanAction,
    },
    /// Live units
    ListActive,
    /// Orphaned units
    ListOrphaned,
    /// Finished units
    ListCompleted,
    /// One unit
    Get {
        /// Unit id
        id: String,
    },
    /// Report live units far past their timeout
    CheckStale,
    /// Orphan every unit past its deadline
    Sweep,
    /// Purge old finished units
    Cleanup {
        /// Age in days
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Registered unit types
    Types,
    /// Re-arm timers, then sweep deadlines and overdue cases until interrupted
    Watch {
        /// Sweep interval (default: from configuration)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum GateCommands {
    /// Create the project state
    Init {
        /// Starting stage (default: first stage)
        #[arg(long)]
        stage: Option<String>,
    },
    /// Check the entry criteria of a stage
    ValidateEntry(StageArg),
    /// Check the exit criteria of a stage
    ValidateExit(StageArg),
    /// Check whether the workflow may leave a stage
    CanTransition(StageArg),
    /// Record a satisfied criterion
    MarkValidated {
        /// Stage id
        stage: String,
        /// `entry` or `exit`
        kind: CriteriaKind,
        /// Criterion id
        criterion: String,
        /// Backing artifact
        #[arg(long)]
        artifact: Option<String>,
    },
    /// Validate and register an artifact
    RegisterArtifact {
        /// Artifact id
        artifact: String,
        /// Artifact kind
        #[arg(long)]
        kind: String,
        /// JSON payload file
        #[arg(long)]
        payload: PathBuf,
        /// Registrant identity
        #[arg(long)]
        by: Option<String>,
    },
    /// Move to the next stage
    Advance {
        /// Actor identity
        #[arg(long, default_value = "user")]
        by: String,
    },
    /// Configured stage gates
    List,
}

#[derive(Args)]
struct StageArg {
    /// Stage id (default: current stage)
    stage: Option<String>,
}

#[derive(Subcommand)]
enum EscalationCommands {
    /// Open a case
    Create {
        /// Reason code
        #[arg(long)]
        reason: EscalationReason,
        /// Stage id
        #[arg(long)]
        stage: String,
        /// Requester identity
        #[arg(long)]
        requester: String,
        /// What happened
        #[arg(long)]
        description: String,
        /// Impact statement
        #[arg(long)]
        impact: Option<String>,
        /// Proposed resolution
        #[arg(long)]
        proposed_resolution: Option<String>,
        /// Triggering decision
        #[arg(long)]
        decision: Option<Decision>,
    },
    /// Acknowledge a case
    Acknowledge(ActorArgs),
    /// Move a case one level up
    Escalate(ActorArgs),
    /// Close a case with a resolution
    Resolve {
        /// Case id
        id: String,
        /// Resolver identity
        #[arg(long)]
        by: String,
        /// Resolution text
        #[arg(long)]
        resolution: String,
        /// New decision
        #[arg(long)]
        decision: Option<Decision>,
    },
    /// Close a case without action
    Reject {
        /// Case id
        id: String,
        /// Rejecter identity
        #[arg(long)]
        by: String,
        /// Rejection reason
        #[arg(long)]
        reason: String,
    },
    /// Record a go/no-go decision
    GoNoGo {
        /// Stage id
        stage: String,
        /// `go` or `no-go`
        decision: Decision,
        /// Approver identity
        #[arg(long)]
        approver: String,
        /// Comments
        #[arg(long)]
        comments: Option<String>,
    },
    /// Report overdue cases
    CheckTimeouts,
    /// Escalate overdue cases
    ApplyTimeouts,
    /// Cases, optionally filtered by status
    List {
        /// Status filter
        #[arg(long)]
        status: Option<EscalationStatus>,
    },
    /// One case
    Get {
        /// Case id
        id: String,
    },
}

#[derive(Args)]
struct ActorArgs {
    /// Case id
    id: String,
    /// Actor identity
    #[arg(long)]
    by: String,
    /// Comments
    #[arg(long)]
    comments: Option<String>,
}

#[derive(Subcommand)]
enum RecoveryCommands {
    /// Classify an error for a unit
    Classify {
        /// Unit id
        unit: String,
        /// Error text
        error: String,
    },
    /// Append to a unit's attempt history
    RecordAttempt {
        /// Unit id
        unit: String,
        /// Session number
        #[arg(long)]
        session: u32,
        /// Approach taken
        #[arg(long)]
        approach: String,
        /// Error text of a failed attempt
        #[arg(long)]
        error: Option<String>,
        /// The attempt succeeded
        #[arg(long)]
        success: bool,
    },
    /// Recommend an action after a failure
    Recommend {
        /// Unit id
        unit: String,
        /// Failure type
        failure_type: String,
    },
    /// Check an approach against recent attempts
    DetectCircular {
        /// Unit id
        unit: String,
        /// New approach
        approach: String,
    },
    /// Record a known-good checkpoint
    Checkpoint {
        /// Version-control reference
        reference: String,
        /// Unit that produced it
        #[arg(long)]
        unit: Option<String>,
    },
    /// Reset the working tree to the last good checkpoint
    Rollback,
    /// Create the pause marker
    Pause {
        /// Reason
        reason: String,
    },
    /// Remove the pause marker
    Resume,
    /// Mark a unit stuck
    Stuck {
        /// Unit id
        unit: String,
        /// Reason
        reason: String,
    },
    /// Recovery overview
    Summary,
    /// A unit's attempts
    History {
        /// Unit id
        unit: String,
    },
}

#[derive(Subcommand)]
enum LeaseCommands {
    /// Take a lease
    Acquire {
        /// Key
        key: String,
        /// Time-to-live (default: from configuration)
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Give a lease back
    Release {
        /// Key
        key: String,
    },
    /// Remove a lease regardless of holder
    ForceRelease {
        /// Key
        key: String,
    },
    /// State of one key
    Check {
        /// Key
        key: String,
    },
    /// Every lease file
    List,
    /// Remove expired and unreadable leases
    Cleanup,
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Copy memory decisions and blockers into the project state
    MemoryToProject,
    /// Write the workflow position into memory
    ProjectToMemory,
    /// Both directions
    Both,
    /// Drift and missing keys
    Status,
    /// Fix what status reports
    Repair,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match run(&root, cli.config.as_deref(), cli.holder, cli.command).await {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            let mut payload = json!({
                "success": false,
                "kind": e.kind(),
                "error": e.to_string(),
                "retryable": e.is_retryable(),
                "requires_human": e.requires_human(),
            });
            if let KernelError::TransitionRefused {
                transition,
                escalation,
            } = &e
            {
                payload["transition"] = serde_json::to_value(transition)?;
                payload["escalation"] = serde_json::to_value(escalation)?;
            }
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(
    root: &Path,
    config: Option<&Path>,
    holder: Option<String>,
    command: Commands,
) -> Result<Value, KernelError> {
    let (config, source) = KernelConfig::resolve(root, config)?;
    tracing::debug!(?source, root = %root.display(), "Configuration resolved");

    let mut store = stagehand_store::Store::open(root, SystemClock::shared());
    if let Some(holder) = holder {
        store = store.with_holder(holder);
    }
    let kernel = Kernel::new(config, store)?;

    match command {
        Commands::Status => render(&kernel.status()?),
        Commands::Agents { command } => agents(&kernel, command).await,
        Commands::Gate { command } => gate(&kernel, command),
        Commands::Escalation { command } => escalation(&kernel, command),
        Commands::Recovery { command } => recovery(&kernel, command),
        Commands::Lease { command } => lease(&kernel, command),
        Commands::Sync { command } => sync(&kernel, command),
    }
}

async fn agents(kernel: &Kernel, command: AgentCommands) -> Result<Value, KernelError> {
    let agents = kernel.agents();
    match command {
        AgentCommands::Spawn {
            unit_type,
            context,
            timeout_ms,
            spawned_by,
        } => {
            let context: Value = serde_json::from_str(&context)?;
            let mut options = SpawnOptions::default();
            if let Some(timeout_ms) = timeout_ms {
                options = options.with_timeout_ms(timeout_ms);
            }
            if let Some(spawned_by) = spawned_by {
                options = options.with_spawned_by(spawned_by);
            }
            render(&kernel.spawn(&unit_type, context, options)?)
        }
        AgentCommands::Complete { id, result } => {
            let result: Value = serde_json::from_str(&result)?;
            render(&agents.complete(&UnitId::new(id), result)?)
        }
        AgentCommands::Fail { id, error, fatal } => {
            render(&kernel.report_failure(&UnitId::new(id), &error, !fatal)?)
        }
        AgentCommands::Reclassify { id } => render(&kernel.reclassify(&UnitId::new(id))?),
        AgentCommands::Resume { id } => render(&kernel.resume(&UnitId::new(id))?),
        AgentCommands::Recover { id, action } => render(&kernel.recover(&UnitId::new(id), action)?),
        AgentCommands::ListActive => render(&agents.list_active()?),
        AgentCommands::ListOrphaned => render(&agents.list_orphaned()?),
        AgentCommands::ListCompleted => render(&agents.list_completed()?),
        AgentCommands::Get { id } => render(&agents.get(&UnitId::new(id))?),
        AgentCommands::CheckStale => render(&agents.check_stale()?),
        AgentCommands::Sweep => render(&json!({ "orphaned": agents.sweep_deadlines()? })),
        AgentCommands::Cleanup { days } => render(&agents.cleanup(days)?),
        AgentCommands::Types => render(agents.list_types()),
        AgentCommands::Watch { interval_ms } => {
            let interval_ms = interval_ms.unwrap_or(kernel.config().sweep_interval_ms);
            watch(kernel, Duration::from_millis(interval_ms.max(1))).await
        }
    }
}

async fn watch(kernel: &Kernel, every: Duration) -> Result<Value, KernelError> {
    let armed = kernel.agents().rearm_timers()?;
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(armed, every_ms = every.as_millis(), "Watching deadlines");
    let mut passes = 0u64;
    let mut orphaned = 0usize;
    let mut escalated = 0usize;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match kernel.tick() {
                    Ok(tick) => {
                        passes += 1;
                        orphaned += tick.orphaned.len();
                        escalated += tick.escalated.len();
                        if !tick.orphaned.is_empty() || !tick.escalated.is_empty() {
                            tracing::info!(
                                orphaned = tick.orphaned.len(),
                                escalated = tick.escalated.len(),
                                "Maintenance pass"
                            );
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(error = %e, "Maintenance pass skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Interrupted, stopping watch");
                break;
            }
        }
    }

    Ok(json!({
        "timers_armed": armed,
        "passes": passes,
        "orphaned": orphaned,
        "escalated": escalated,
    }))
}

fn gate(kernel: &Kernel, command: GateCommands) -> Result<Value, KernelError> {
    let gate = kernel.gate();
    match command {
        GateCommands::Init { stage } => render(&gate.initialize(stage.map(StageId::from))?),
        GateCommands::ValidateEntry(arg) => {
            let stage = stage_or_current(kernel, arg.stage)?;
            render(&gate.validate_entry(&stage)?)
        }
        GateCommands::ValidateExit(arg) => {
            let stage = stage_or_current(kernel, arg.stage)?;
            render(&gate.validate_exit(&stage)?)
        }
        GateCommands::CanTransition(arg) => {
            let stage = arg.stage.map(StageId::from);
            render(&gate.can_transition(stage.as_ref())?)
        }
        GateCommands::MarkValidated {
            stage,
            kind,
            criterion,
            artifact,
        } => render(&gate.mark_validated(&StageId::from(stage), kind, &criterion, artifact)?),
        GateCommands::RegisterArtifact {
            artifact,
            kind,
            payload,
            by,
        } => {
            let content = std::fs::read_to_string(&payload).map_err(|source| KernelError::Io {
                path: payload.clone(),
                source,
            })?;
            let payload: Value = serde_json::from_str(&content)?;
            render(&gate.register_artifact(&artifact, &kind, &payload, by.as_deref())?)
        }
        GateCommands::Advance { by } => render(&kernel.advance_stage(&by)?),
        GateCommands::List => render(gate.table()),
    }
}

fn escalation(kernel: &Kernel, command: EscalationCommands) -> Result<Value, KernelError> {
    let engine = kernel.escalations();
    match command {
        EscalationCommands::Create {
            reason,
            stage,
            requester,
            description,
            impact,
            proposed_resolution,
            decision,
        } => {
            let mut request = CreateEscalation::new(reason, stage, requester, description);
            if let Some(impact) = impact {
                request = request.with_impact(impact);
            }
            if let Some(proposal) = proposed_resolution {
                request = request.with_proposed_resolution(proposal);
            }
            if let Some(decision) = decision {
                request = request.with_decision(decision);
            }
            render(&engine.create(request)?)
        }
        EscalationCommands::Acknowledge(args) => {
            render(&engine.acknowledge(&EscalationId::new(args.id), &args.by, args.comments)?)
        }
        EscalationCommands::Escalate(args) => {
            render(&engine.escalate(&EscalationId::new(args.id), &args.by, args.comments)?)
        }
        EscalationCommands::Resolve {
            id,
            by,
            resolution,
            decision,
        } => render(&engine.resolve(&EscalationId::new(id), &by, &resolution, decision)?),
        EscalationCommands::Reject { id, by, reason } => {
            render(&engine.reject(&EscalationId::new(id), &by, &reason)?)
        }
        EscalationCommands::GoNoGo {
            stage,
            decision,
            approver,
            comments,
        } => render(&engine.process_go_no_go(&StageId::from(stage), decision, &approver, comments)?),
        EscalationCommands::CheckTimeouts => render(&engine.check_timeouts()?),
        EscalationCommands::ApplyTimeouts => render(&kernel.apply_auto_escalations()?),
        EscalationCommands::List { status } => render(&kernel.escalation_list(status)?),
        EscalationCommands::Get { id } => render(&engine.get(&EscalationId::new(id))?),
    }
}

fn recovery(kernel: &Kernel, command: RecoveryCommands) -> Result<Value, KernelError> {
    let recovery = kernel.recovery();
    match command {
        RecoveryCommands::Classify { unit, error } => render(&recovery.classify(&error, &UnitId::new(unit))?),
        RecoveryCommands::RecordAttempt {
            unit,
            session,
            approach,
            error,
            success,
        } => {
            let attempt = if success {
                Attempt::succeeded(session, approach)
            } else {
                Attempt::failed(session, approach, error.unwrap_or_default())
            };
            render(&recovery.record_attempt(&UnitId::new(unit), attempt)?)
        }
        RecoveryCommands::Recommend { unit, failure_type } => {
            render(&recovery.recommend_action(&UnitId::new(unit), &failure_type)?)
        }
        RecoveryCommands::DetectCircular { unit, approach } => {
            let circular = recovery.detect_circular_fix(&UnitId::new(unit), &approach)?;
            render(&json!({ "circular": circular }))
        }
        RecoveryCommands::Checkpoint { reference, unit } => {
            let unit = unit.map(UnitId::new);
            render(&recovery.record_good_checkpoint(&reference, unit.as_ref())?)
        }
        RecoveryCommands::Rollback => render(&json!({ "reference": recovery.rollback_to_last_good()? })),
        RecoveryCommands::Pause { reason } => {
            recovery.create_pause_marker(&reason)?;
            render(&json!({ "paused": true, "marker": kernel.store().layout().pause_marker() }))
        }
        RecoveryCommands::Resume => render(&json!({ "removed": recovery.clear_pause()? })),
        RecoveryCommands::Stuck { unit, reason } => {
            let unit = UnitId::new(unit);
            recovery.mark_stuck(&unit, &reason)?;
            render(&json!({ "unit": unit, "stuck": true }))
        }
        RecoveryCommands::Summary => render(&recovery.summary()?),
        RecoveryCommands::History { unit } => render(&recovery.history(&UnitId::new(unit))?),
    }
}

fn lease(kernel: &Kernel, command: LeaseCommands) -> Result<Value, KernelError> {
    let store = kernel.store();
    let leases = store.leases();
    match command {
        LeaseCommands::Acquire { key, ttl_ms } => {
            let ttl_ms = ttl_ms.unwrap_or(store.lease_ttl_ms());
            render(&leases.acquire(&key, store.holder(), ttl_ms)?)
        }
        LeaseCommands::Release { key } => {
            leases.release(&key, store.holder())?;
            render(&json!({ "key": key, "released": true }))
        }
        LeaseCommands::ForceRelease { key } => render(&json!({ "key": key, "removed": leases.force_release(&key)? })),
        LeaseCommands::Check { key } => render(&leases.status(&key)?),
        LeaseCommands::List => render(&leases.list()?),
        LeaseCommands::Cleanup => render(&json!({ "removed": leases.sweep_expired()? })),
    }
}

fn sync(kernel: &Kernel, command: SyncCommands) -> Result<Value, KernelError> {
    let sync = kernel.sync();
    match command {
        SyncCommands::MemoryToProject => render(&sync.memory_to_project()?),
        SyncCommands::ProjectToMemory => render(&sync.project_to_memory()?),
        SyncCommands::Both => render(&sync.sync_both()?),
        SyncCommands::Status => render(&sync.status()?),
        SyncCommands::Repair => render(&sync.repair()?),
    }
}

fn stage_or_current(kernel: &Kernel, stage: Option<String>) -> Result<StageId, KernelError> {
    match stage {
        Some(stage) => Ok(StageId::from(stage)),
        None => kernel
            .gate()
            .state()?
            .current_stage
            .ok_or_else(|| stagehand_gate::GateError::NoCurrentStage.into()),
    }
}

fn render<T: Serialize + ?Sized>(value: &T) -> Result<Value, KernelError> {
    Ok(serde_json::to_value(value)?)
}
