use super::{colored_status, format_time};
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::{CheckpointStore, RunFilter, RunRepository, RunStatus, WorkflowRun};
use serde_json::json;

pub async fn execute(
    ctx: &CliContext,
    subject: Option<&str>,
    status: Option<&str>,
    workflow: Option<&str>,
) -> Result<()> {
    let status = status
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = ctx.store().await?;
    let runs = store
        .list_runs(&RunFilter {
            subject_id: subject.map(str::to_string),
            status,
            workflow_type: workflow.map(str::to_string),
        })
        .await?;

    if ctx.json {
        return ctx.print_json(&runs);
    }

    if runs.is_empty() {
        println!("{}", "No workflow runs found.".yellow());
        return Ok(());
    }

    print_table(&runs);
    Ok(())
}

/// Runs whose checkpoint records a failed verification awaiting retry.
pub async fn pending_retries(ctx: &CliContext) -> Result<()> {
    let store = ctx.store().await?;
    let pending = store.runs_with_pending_retries().await?;

    if ctx.json {
        let rows: Vec<_> = pending
            .iter()
            .map(|(run_id, retry)| json!({ "runId": run_id, "pendingRetry": retry }))
            .collect();
        return ctx.print_json(&rows);
    }

    if pending.is_empty() {
        println!("{}", "No runs are waiting on a retry.".green());
        return Ok(());
    }

    println!("\n{}", "Pending Retries".yellow().bold());
    println!("{}", "─".repeat(100).dimmed());
    for (run_id, retry) in &pending {
        println!(
            "{:<44} {:<20} attempt {:<3} {}",
            run_id.cyan(),
            retry.step,
            retry.attempt,
            retry.error.dimmed()
        );
    }
    Ok(())
}

fn print_table(runs: &[WorkflowRun]) {
    println!("\n{}", "Workflow Runs".green().bold());
    println!("{}", "─".repeat(120).dimmed());

    println!(
        "{:<44} {:<14} {:<16} {:<10} {:<18} {:<20}",
        "ID".bold(),
        "WORKFLOW".bold(),
        "SUBJECT".bold(),
        "STATUS".bold(),
        "STEP".bold(),
        "CREATED".bold()
    );
    println!("{}", "─".repeat(120).dimmed());

    for run in runs {
        println!(
            "{:<44} {:<14} {:<16} {:<10} {:<18} {:<20}",
            run.id.cyan(),
            run.workflow_type,
            run.subject_id,
            colored_status(run.status).to_string(),
            run.current_step.as_deref().unwrap_or("-"),
            format_time(&run.created_at).dimmed()
        );
    }

    println!("{}", "─".repeat(120).dimmed());
    println!("\nTotal: {}", runs.len().to_string().cyan());
}
