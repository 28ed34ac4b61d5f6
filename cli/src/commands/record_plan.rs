use crate::context::CliContext;
use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::{json, Value};
use std::path::Path;

pub async fn execute(ctx: &CliContext, run_id: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read plan file {}", file.display()))?;
    let plan: Value = serde_json::from_str(&content)
        .with_context(|| format!("Plan file {} is not valid JSON", file.display()))?;

    let store = ctx.store().await?;
    let plan_id = store.record_strategic_plan(run_id, &plan).await?;

    if ctx.json {
        return ctx.print_json(&json!({ "runId": run_id, "planId": plan_id }));
    }

    println!("{}", "Strategic plan recorded.".green().bold());
    println!("  Run:  {}", run_id.cyan());
    println!("  Plan: {}", plan_id.cyan());
    Ok(())
}
