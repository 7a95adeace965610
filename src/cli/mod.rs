//! CLI subcommands — init, validate, schema, graph, plan, apply, destroy,
//! status, outputs, drift.

use crate::core::error::EngineError;
use crate::core::executor::{Executor, RunContext};
use crate::core::state::{FileStateStore, MemoryStateStore, StateStore};
use crate::core::types::{ApplyReport, PlanAction, PlanSummary, StackConfig, TerminalStatus};
use crate::core::{parser, planner};
use crate::provider::LocalProvider;
use crate::stack::{self, Stack};
use crate::tripwire::drift;
use crate::tripwire::eventlog::EventLog;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stack file and state location shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct StackArgs {
    /// Path to stack.yaml
    #[arg(short, long, default_value = "stack.yaml")]
    pub file: PathBuf,

    /// State directory
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stack.yaml and the resource graph it expands to
    Validate {
        /// Path to stack.yaml
        #[arg(short, long, default_value = "stack.yaml")]
        file: PathBuf,
    },

    /// Print the JSON Schema of stack.yaml
    Schema,

    /// Show the dependency graph as execution batches
    Graph {
        #[command(flatten)]
        stack: StackArgs,

        /// Show teardown order instead
        #[arg(long)]
        destroy: bool,
    },

    /// Show execution plan (diff desired vs recorded state)
    Plan {
        #[command(flatten)]
        stack: StackArgs,
    },

    /// Provision the stack
    Apply {
        #[command(flatten)]
        stack: StackArgs,

        /// Re-apply resources whose properties are unchanged
        #[arg(long)]
        force: bool,
    },

    /// Tear down every resource recorded in state
    Destroy {
        #[command(flatten)]
        stack: StackArgs,
    },

    /// Show recorded resource state
    Status {
        #[command(flatten)]
        stack: StackArgs,
    },

    /// Show stack exports
    Outputs {
        #[command(flatten)]
        stack: StackArgs,

        /// Print secret values in clear text
        #[arg(long)]
        show_secrets: bool,
    },

    /// Detect changes made outside infragraph
    Drift {
        #[command(flatten)]
        stack: StackArgs,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Schema => cmd_schema(),
        Commands::Graph { stack, destroy } => cmd_graph(&stack, destroy),
        Commands::Plan { stack } => cmd_plan(&stack),
        Commands::Apply { stack, force } => cmd_apply(&stack, force),
        Commands::Destroy { stack } => cmd_destroy(&stack),
        Commands::Status { stack } => cmd_status(&stack),
        Commands::Outputs {
            stack,
            show_secrets,
        } => cmd_outputs(&stack, show_secrets),
        Commands::Drift { stack, tripwire } => cmd_drift(&stack, tripwire),
    }
}

fn err(e: EngineError) -> String {
    e.to_string()
}

/// Everything a command needs to talk to one stack.
struct Session {
    config: StackConfig,
    stack: Stack,
    state_dir: PathBuf,
    store: Box<dyn StateStore>,
    provider: Arc<LocalProvider>,
}

impl Session {
    fn open(args: &StackArgs) -> Result<Self, String> {
        let config = parse_and_validate(&args.file)?;
        let stack = stack::build_stack(&config).map_err(err)?;
        let store: Box<dyn StateStore> = if config.policy.lock_file {
            Box::new(FileStateStore::new(&args.state_dir, &config.name))
        } else {
            Box::new(MemoryStateStore::new())
        };
        let inventory = LocalProvider::inventory_path(&args.state_dir, &config.name);
        let provider = LocalProvider::open(&config.settings.region, inventory)
            .map_err(|e| format!("cannot open local cloud: {}", e))?;
        Ok(Self {
            config,
            stack,
            state_dir: args.state_dir.clone(),
            store,
            provider: Arc::new(provider),
        })
    }

    fn events(&self) -> EventLog {
        if self.config.policy.tripwire {
            EventLog::new(&self.state_dir, &self.config.name)
        } else {
            EventLog::disabled(&self.config.name)
        }
    }

    fn executor(&self, force: bool) -> Executor {
        Executor::new(self.provider.clone())
            .with_retry(self.config.policy.retry.clone())
            .with_failure_policy(self.config.policy.failure)
            .with_force(force)
            .with_event_log(self.events())
    }

    /// Hand the graph and recorded state over to a run context.
    fn into_run(self) -> Result<(RunContext, Box<dyn StateStore>), String> {
        let states = self.store.load().map_err(err)?;
        let ctx = RunContext::new(
            self.config.name,
            self.stack.graph,
            self.stack.exports,
            states,
        );
        Ok((ctx, self.store))
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))
}

/// Cancel `token` on Ctrl-C. The returned task must be aborted once the run ends.
fn cancel_on_interrupt(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            eprintln!("Interrupted: cancelling in-flight calls, no further batches will start.");
            token.cancel();
        }
    })
}

const STACK_TEMPLATE: &str = r#"version: "1.0"
name: dev
description: "EKS cluster with Karpenter"

settings:
  cluster_name: eks-cluster
  region: us-east-2
  node_count: 3
  min_size: 1
  max_size: 5
  kubernetes_version: "1.33"
  instance_type: t3.medium
  availability_zones: [a, b, c]
  karpenter_namespace: kube-system
  karpenter_version: 1.6.3

params: {}

tags: {}

policy:
  failure: continue_independent
  tripwire: true
  lock_file: true
  retry:
    max_attempts: 3
    initial_delay_ms: 500
    max_delay_ms: 30000
    multiplier: 2.0
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("stack.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    std::fs::write(&config_path, STACK_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized infragraph stack at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a stack file, printing every validation error.
fn parse_and_validate(file: &Path) -> Result<StackConfig, String> {
    let config = parser::parse_config_file(file).map_err(err)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let stack = match stack::build_stack(&config) {
        Ok(stack) => stack,
        Err(EngineError::Validation(errors)) => {
            for e in &errors {
                eprintln!("  ERROR: {}", e);
            }
            return Err(format!("{} validation error(s)", errors.len()));
        }
        Err(e) => return Err(err(e)),
    };
    let plan = planner::plan(&stack.graph).map_err(err)?;
    println!(
        "OK: {} ({} resources, {} dependencies, {} batches)",
        config.name,
        stack.graph.len(),
        stack.graph.edge_count(),
        plan.len()
    );
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(StackConfig);
    let json = serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn cmd_graph(args: &StackArgs, destroy: bool) -> Result<(), String> {
    let config = parse_and_validate(&args.file)?;
    let stack = stack::build_stack(&config).map_err(err)?;
    let plan = if destroy {
        planner::plan_destroy(&stack.graph)
    } else {
        planner::plan(&stack.graph)
    }
    .map_err(err)?;

    println!(
        "{} ({} resources, {} batches)",
        config.name,
        plan.resource_count(),
        plan.len()
    );
    for (i, batch) in plan.batches.iter().enumerate() {
        println!("batch {}:", i + 1);
        for id in batch {
            let Some(node) = stack.graph.node_id(id) else {
                continue;
            };
            let kind = stack.graph.node(node).kind;
            let deps = stack.graph.dependency_ids(node);
            if deps.is_empty() {
                println!("  {} [{}]", id, kind);
            } else {
                println!("  {} [{}] <- {}", id, kind, deps.join(", "));
            }
        }
    }
    Ok(())
}

fn action_symbol(action: PlanAction) -> &'static str {
    match action {
        PlanAction::Create => "+",
        PlanAction::Update => "~",
        PlanAction::Delete => "-",
        PlanAction::NoOp => " ",
    }
}

fn cmd_plan(args: &StackArgs) -> Result<(), String> {
    let session = Session::open(args)?;
    let graph = &session.stack.graph;
    let states = session.store.load().map_err(err)?;

    let plan = planner::plan(graph).map_err(err)?;
    let preview = planner::preview_outputs(&states);
    let mut changes = planner::diff(graph, &plan, &states, &preview);
    changes.extend(planner::orphan_changes(&states, graph).map_err(err)?);

    println!(
        "Planning: {} ({} resources, {} batches)",
        session.config.name,
        graph.len(),
        plan.len()
    );
    println!();
    for change in &changes {
        println!("  {} {}", action_symbol(change.action), change.description);
    }
    println!();
    println!("Plan: {}.", PlanSummary::from_changes(&changes));
    Ok(())
}

fn status_symbol(status: &TerminalStatus) -> &'static str {
    match status {
        TerminalStatus::Created => "+",
        TerminalStatus::Updated => "~",
        TerminalStatus::Deleted => "-",
        TerminalStatus::Unchanged => " ",
        TerminalStatus::Failed(_) => "!",
        TerminalStatus::Skipped(_) => "?",
    }
}

/// Print every outcome, then the exports (secrets masked).
fn print_report(report: &ApplyReport) {
    for outcome in report.outcomes.values() {
        let retries = if outcome.attempts > 1 {
            format!(" after {} attempts", outcome.attempts)
        } else {
            String::new()
        };
        println!(
            "  {} {} [{}] {}{} ({:.1}s)",
            status_symbol(&outcome.status),
            outcome.resource_id,
            outcome.kind,
            outcome.status,
            retries,
            outcome.duration.as_secs_f64()
        );
    }
    if !report.exports.is_empty() {
        println!();
        println!("Outputs:");
        for (name, export) in &report.exports {
            println!("  {} = {}", name, export.display(false));
        }
    }
}

fn summarize(report: &ApplyReport, verb: &str) -> Result<(), String> {
    let changed = report.count(|s| {
        matches!(
            s,
            TerminalStatus::Created | TerminalStatus::Updated | TerminalStatus::Deleted
        )
    });
    let unchanged = report.count(|s| *s == TerminalStatus::Unchanged);
    println!();
    if report.is_success() {
        println!(
            "{} complete: {} changed, {} unchanged ({:.1}s).",
            verb,
            changed,
            unchanged,
            report.total_duration.as_secs_f64()
        );
        return Ok(());
    }
    println!(
        "{} completed with errors: {} changed, {} unchanged, {} FAILED, {} SKIPPED",
        verb,
        changed,
        unchanged,
        report.failed(),
        report.skipped()
    );
    match report.clone().into_result() {
        Ok(_) => Ok(()),
        Err(e) => Err(err(e)),
    }
}

fn cmd_apply(args: &StackArgs, force: bool) -> Result<(), String> {
    let session = Session::open(args)?;
    let plan = planner::plan(&session.stack.graph).map_err(err)?;
    let exec = session.executor(force);
    let (mut ctx, store) = session.into_run()?;

    println!(
        "Applying: {} ({} resources, {} batches)",
        ctx.stack,
        plan.resource_count(),
        plan.len()
    );
    let rt = runtime()?;
    let (report, pruned) = rt.block_on(async {
        let interrupt = cancel_on_interrupt(exec.cancel_token());
        let report = exec.apply(&mut ctx, &plan, store.as_ref()).await;
        let pruned = match &report {
            Ok(r) if r.is_success() && !planner::orphans(ctx.states(), ctx.graph()).is_empty() => {
                Some(exec.prune(&mut ctx, store.as_ref()).await)
            }
            _ => None,
        };
        interrupt.abort();
        (report, pruned)
    });
    let report = report.map_err(err)?;

    print_report(&report);
    if let Some(pruned) = pruned {
        let pruned = pruned.map_err(err)?;
        println!();
        println!("Removed resources no longer declared:");
        print_report(&pruned);
        summarize(&pruned, "Prune")?;
    }
    summarize(&report, "Apply")
}

fn cmd_destroy(args: &StackArgs) -> Result<(), String> {
    let session = Session::open(args)?;
    let plan = planner::plan_destroy(&session.stack.graph).map_err(err)?;
    let exec = session.executor(false);
    let (mut ctx, store) = session.into_run()?;

    println!("Destroying: {} ({} recorded resources)", ctx.stack, ctx.states().len());
    let rt = runtime()?;
    let report = rt.block_on(async {
        let interrupt = cancel_on_interrupt(exec.cancel_token());
        // state may still hold resources the stack file no longer declares
        let report = match exec.destroy(&mut ctx, &plan, store.as_ref()).await {
            Ok(mut r) if r.is_success() && !ctx.states().is_empty() => {
                exec.prune(&mut ctx, store.as_ref()).await.map(|orphans| {
                    r.outcomes.extend(orphans.outcomes);
                    r
                })
            }
            other => other,
        };
        interrupt.abort();
        report
    });
    let report = report.map_err(err)?;

    print_report(&report);
    summarize(&report, "Destroy")
}

fn cmd_status(args: &StackArgs) -> Result<(), String> {
    let session = Session::open(args)?;
    let states = session.store.load().map_err(err)?;
    if states.is_empty() {
        println!("No state found. Run `infragraph apply` first.");
        return Ok(());
    }

    println!("Stack: {}", session.config.name);
    println!("  Resources: {}", states.len());
    for (id, state) in &states {
        let duration = state
            .duration_seconds
            .map(|d| format!(" ({:.2}s)", d))
            .unwrap_or_default();
        let provider_id = state.provider_id.as_deref().unwrap_or("-");
        println!(
            "    {}: {} [{}] {}{}",
            id, state.status, state.kind, provider_id, duration
        );
    }
    Ok(())
}

fn cmd_outputs(args: &StackArgs, show_secrets: bool) -> Result<(), String> {
    let session = Session::open(args)?;
    let exports = session.store.load_outputs().map_err(err)?;
    if exports.is_empty() {
        println!("No outputs recorded. Run `infragraph apply` first.");
        return Ok(());
    }
    for (name, export) in &exports {
        println!("{} = {}", name, export.display(show_secrets));
    }
    Ok(())
}

fn cmd_drift(args: &StackArgs, tripwire_mode: bool) -> Result<(), String> {
    let session = Session::open(args)?;
    let states = session.store.load().map_err(err)?;
    let events = session.config.policy.tripwire.then(|| session.events());

    println!("Checking {} ({} resources)...", session.config.name, states.len());
    let rt = runtime()?;
    let report = rt.block_on(drift::detect_drift(
        session.provider.as_ref(),
        &states,
        events.as_ref(),
    ));

    for f in &report.findings {
        println!("  DRIFTED: {} [{}] ({})", f.resource_id, f.kind, f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    for (id, e) in &report.errors {
        println!("  ERROR: {} ({})", id, e);
    }

    if report.has_drift() {
        println!();
        println!("Drift detected: {} resource(s)", report.findings.len());
        if tripwire_mode {
            return Err(format!("{} drift finding(s)", report.findings.len()));
        }
    } else {
        println!("No drift detected ({} checked).", report.checked);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::StateMap;
    use crate::core::types::ResourceStatus;

    fn recorded_states(args: &StackArgs) -> StateMap {
        let session = Session::open(args).unwrap();
        session.store.load().unwrap()
    }

    fn project() -> (tempfile::TempDir, StackArgs) {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let args = StackArgs {
            file: dir.path().join("stack.yaml"),
            state_dir: dir.path().join("state"),
        };
        (dir, args)
    }

    #[test]
    fn test_init_writes_valid_stack() {
        let (dir, args) = project();
        assert!(dir.path().join("state").is_dir());
        cmd_validate(&args.file).unwrap();
    }

    #[test]
    fn test_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stack.yaml");
        std::fs::write(&file, "version: \"2.0\"\nname: \"\"\n").unwrap();
        assert_eq!(cmd_validate(&file).unwrap_err(), "2 validation error(s)");
    }

    #[test]
    fn test_schema_and_graph() {
        let (_dir, args) = project();
        cmd_schema().unwrap();
        cmd_graph(&args, false).unwrap();
        cmd_graph(&args, true).unwrap();
    }

    #[test]
    fn test_status_and_outputs_before_apply() {
        let (_dir, args) = project();
        cmd_status(&args).unwrap();
        cmd_outputs(&args, false).unwrap();
        assert!(recorded_states(&args).is_empty());
    }

    #[test]
    fn test_apply_plan_drift_destroy() {
        let (dir, args) = project();
        cmd_plan(&args).unwrap();
        cmd_apply(&args, false).unwrap();

        let states = recorded_states(&args);
        assert_eq!(states.len(), 32);
        assert!(states.values().all(|s| s.status == ResourceStatus::Created));
        assert!(dir.path().join("state/dev/cloud.json").exists());
        assert!(dir.path().join("state/dev/events.jsonl").exists());

        cmd_plan(&args).unwrap();
        cmd_apply(&args, false).unwrap();
        cmd_outputs(&args, true).unwrap();
        cmd_drift(&args, true).unwrap();

        cmd_destroy(&args).unwrap();
        assert!(recorded_states(&args).is_empty());
    }

    #[test]
    fn test_drift_tripwire_fails_on_tampering() {
        let (_dir, args) = project();
        cmd_apply(&args, false).unwrap();

        let session = Session::open(&args).unwrap();
        let states = session.store.load().unwrap();
        let vpc = states["eks-cluster-vpc"].provider_id.clone().unwrap();
        assert!(session
            .provider
            .tamper(&vpc, "cidr_block", serde_json::json!("10.9.0.0/16")));
        drop(session);

        assert!(cmd_drift(&args, false).is_ok());
        assert!(cmd_drift(&args, true).is_err());
    }
}
