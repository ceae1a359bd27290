//! Run command - execute a plan file to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use nebula_config::StoreKind;
use nebula_engine::{
    ApprovalEvent, ApprovalGate, ApprovalTicket, EngineConfig, ExecutionCoordinator,
    ExecutionPlan, FilePlanStore, InMemoryPlanStore, PlanStore, RunReport, RunState, SharedState,
};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Context;
use crate::capabilities;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Plan file (.json or .toml)
    pub plan: PathBuf,

    /// Approve every approval request without prompting
    #[arg(long, conflicts_with = "deny_approvals")]
    pub auto_approve: bool,

    /// Deny every approval request without prompting
    #[arg(long)]
    pub deny_approvals: bool,

    /// Seed shared state before the run (KEY=VALUE, VALUE parsed as JSON if possible)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub initial: Vec<(String, Value)>,

    /// Output the final status as JSON (for scripting)
    #[arg(long)]
    pub json: bool,
}

/// How approval requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalMode {
    Approve,
    Deny,
    Prompt,
}

fn parse_key_value(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err("key cannot be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let plan = ExecutionPlan::from_file(&args.plan)?;
    plan.validate()?;
    let plan_id = plan.plan_id.clone();

    let config = &ctx.config.config;
    let store = open_store(config, plan).await?;
    let invokers = capabilities::registry(config)?;
    let coordinator = ExecutionCoordinator::new(EngineConfig::from(&config.engine()), store, invokers);

    let mode = if args.auto_approve {
        ApprovalMode::Approve
    } else if args.deny_approvals {
        ApprovalMode::Deny
    } else {
        ApprovalMode::Prompt
    };
    // Subscribe before starting so the first request is never missed
    let gate = coordinator.approvals().clone();
    let events = gate.subscribe();
    let responder = tokio::spawn(answer_approvals(gate, events, mode));

    let initial: SharedState = args.initial.into_iter().collect();
    let handle = coordinator.start_with_state(&plan_id, initial).await?;

    let wait = handle.wait();
    tokio::pin!(wait);
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(plan_id = %plan_id, "Interrupted, cancelling run");
            coordinator.cancel(&plan_id);
            wait.await?
        }
    };
    responder.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.status)?);
    } else {
        print_report(&report, ctx.verbose);
    }

    if !report.is_completed() {
        bail!("Run {} finished as {}", plan_id, report.status.state);
    }
    Ok(())
}

/// Build the configured plan store and make the plan loadable from it.
async fn open_store(
    config: &nebula_config::NebulaConfig,
    plan: ExecutionPlan,
) -> Result<Arc<dyn PlanStore>> {
    let section = config.store();
    match section.kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryPlanStore::with_plans([plan]))),
        StoreKind::File => {
            let root = section
                .path
                .context("store.path is required for the file store")?;
            let store = FilePlanStore::new(root);
            store
                .save_plan(&plan)
                .await
                .context("Failed to write plan to store")?;
            Ok(Arc::new(store))
        }
    }
}

async fn answer_approvals(
    gate: Arc<ApprovalGate>,
    mut events: broadcast::Receiver<ApprovalEvent>,
    mode: ApprovalMode,
) {
    let mut answers: Option<mpsc::UnboundedReceiver<String>> = None;

    loop {
        let ticket = match events.recv().await {
            Ok(ApprovalEvent::Requested(ticket)) => ticket,
            Ok(ApprovalEvent::Resolved { .. }) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed approval events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let approved = match mode {
            ApprovalMode::Approve => true,
            ApprovalMode::Deny => false,
            ApprovalMode::Prompt => prompt(&ticket, answers.get_or_insert_with(stdin_lines)).await,
        };
        if !gate.decide(&ticket.plan_id, &ticket.step_id, approved) {
            debug!(step_id = %ticket.step_id, "Approval ticket already resolved");
        }
    }
}

/// Stdin lines, read on a plain thread so a pending read never holds up exit.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Ask on the terminal. EOF or anything but yes denies.
async fn prompt(ticket: &ApprovalTicket, answers: &mut mpsc::UnboundedReceiver<String>) -> bool {
    eprint!(
        "\n{} {}\n  step '{}' (expires {})\nApprove? [y/N] ",
        style("Approval required:").yellow().bold(),
        ticket.description,
        ticket.step_id,
        ticket.expires_at.format("%H:%M:%S UTC"),
    );

    match answers.recv().await {
        Some(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        None => false,
    }
}

fn print_report(report: &RunReport, verbose: bool) {
    let status = &report.status;
    let dim = Style::new().dim();
    let state = match status.state {
        RunState::Completed => style(status.state.as_str()).green(),
        RunState::Cancelled => style(status.state.as_str()).yellow(),
        _ => style(status.state.as_str()).red(),
    };

    println!();
    println!("{} {}", style(&status.plan_id).bold(), state);
    println!("{}", dim.apply_to("─".repeat(40)));
    println!(
        "  {} {}/{}",
        dim.apply_to("Steps:"),
        status.completed_steps,
        status.total_steps
    );
    if let (Some(started), Some(ended)) = (status.started_at, status.ended_at) {
        let elapsed = ended - started;
        println!(
            "  {} {:.3}s",
            dim.apply_to("Elapsed:"),
            elapsed.num_milliseconds() as f64 / 1000.0
        );
    }
    if let Some(failure) = &status.failure {
        println!("  {} {}", dim.apply_to("Failure:"), style(failure).red());
    }
    if status.degraded {
        println!(
            "  {} {}",
            dim.apply_to("Store:"),
            style("degraded (progress not fully persisted)").yellow()
        );
    }
    if verbose {
        println!("  {} {:?}", dim.apply_to("Outcome:"), report.outcome);
    }
    println!();
}
