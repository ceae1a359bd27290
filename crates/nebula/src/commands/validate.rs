//! Validate command - parse and check a plan file.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use nebula_engine::{ExecutionPlan, FlowNode};
use serde::Serialize;

use super::Context;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Plan file (.json or .toml)
    pub plan: PathBuf,

    /// Output as JSON (for scripting)
    #[arg(long)]
    pub json: bool,
}

/// Validation summary for JSON output.
#[derive(Debug, Serialize)]
struct ValidateOutput {
    plan_id: String,
    name: String,
    total_steps: usize,
    approval_steps: Vec<String>,
    capabilities: Vec<String>,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let plan = ExecutionPlan::from_file(&args.plan)?;
    plan.validate()?;

    let mut approval_steps = Vec::new();
    plan.root.for_each_step(&mut |step| {
        if step.requires_approval {
            approval_steps.push(step.id.clone());
        }
    });

    if args.json {
        let output = ValidateOutput {
            plan_id: plan.plan_id.clone(),
            name: plan.name.clone(),
            total_steps: plan.step_count(),
            approval_steps,
            capabilities: plan.capabilities(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!("{} {}", style("✓").green(), style(&plan.plan_id).bold());
    if !plan.name.is_empty() {
        println!("  {} {}", dim.apply_to("Name:"), plan.name);
    }
    println!("  {} {}", dim.apply_to("Steps:"), plan.step_count());
    println!(
        "  {} {}",
        dim.apply_to("Capabilities:"),
        plan.capabilities().join(", ")
    );
    if !approval_steps.is_empty() {
        println!(
            "  {} {}",
            dim.apply_to("Approvals:"),
            approval_steps.join(", ")
        );
    }

    if ctx.verbose {
        println!();
        print_tree(&plan.root, 1);
    }
    println!();

    Ok(())
}

fn print_tree(node: &FlowNode, depth: usize) {
    let indent = "  ".repeat(depth);
    match node {
        FlowNode::Step(step) => {
            let gate = if step.requires_approval { " [approval]" } else { "" };
            println!("{}- {} ({}){}", indent, step.id, step.capability, gate);
        }
        FlowNode::Sequential { children } => {
            println!("{}sequential", indent);
            children.iter().for_each(|c| print_tree(c, depth + 1));
        }
        FlowNode::Parallel {
            children,
            wait_for_all,
        } => {
            let mode = if *wait_for_all { "all" } else { "first" };
            println!("{}parallel (wait: {})", indent, mode);
            children.iter().for_each(|c| print_tree(c, depth + 1));
        }
        FlowNode::Conditional {
            predicate,
            then_branch,
            else_branch,
        } => {
            println!("{}if {}", indent, predicate);
            print_tree(then_branch, depth + 1);
            if let Some(else_branch) = else_branch {
                println!("{}else", indent);
                print_tree(else_branch, depth + 1);
            }
        }
        FlowNode::Loop {
            body,
            exit_condition,
            max_iterations,
            ..
        } => {
            println!(
                "{}loop until {} (max {})",
                indent, exit_condition, max_iterations
            );
            print_tree(body, depth + 1);
        }
        FlowNode::SubFlow { flow } => {
            println!("{}sub_flow", indent);
            print_tree(flow, depth + 1);
        }
    }
}
