use super::workflows::describe;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::workflow_toml::load_workflow_file;
use serde_json::json;
use std::path::PathBuf;
use tracing::warn;

pub fn execute(ctx: &CliContext, files: &[PathBuf]) -> Result<()> {
    let mut failures = 0;
    let mut results = Vec::new();

    for file in files {
        match load_workflow_file(file) {
            Ok(definition) => {
                let unreferenced = definition.unreferenced_steps();
                for step in &unreferenced {
                    warn!("{}: step '{}' is never reached", file.display(), step);
                }
                if ctx.json {
                    results.push(json!({
                        "file": file.display().to_string(),
                        "valid": true,
                        "workflow": describe(&definition),
                    }));
                } else {
                    println!(
                        "{} {} ({}, {} steps)",
                        "ok".green().bold(),
                        file.display(),
                        definition.workflow_type().cyan(),
                        definition.steps().len()
                    );
                    if !unreferenced.is_empty() {
                        println!(
                            "   {} {}",
                            "unreachable:".yellow(),
                            unreferenced.join(", ")
                        );
                    }
                }
            }
            Err(e) => {
                failures += 1;
                if ctx.json {
                    results.push(json!({
                        "file": file.display().to_string(),
                        "valid": false,
                        "error": e.to_string(),
                    }));
                } else {
                    println!("{} {}: {}", "FAIL".red().bold(), file.display(), e);
                }
            }
        }
    }

    if ctx.json {
        ctx.print_json(&results)?;
    }

    if failures > 0 {
        anyhow::bail!("{} of {} workflow file(s) failed validation", failures, files.len());
    }
    Ok(())
}
