pub mod artifacts;
pub mod cancel;
pub mod escalations;
pub mod events;
pub mod gate;
pub mod init;
pub mod list;
pub mod pause;
pub mod record_plan;
pub mod register_artifact;
pub mod register_version;
pub mod resume;
pub mod start;
pub mod status;
pub mod step;
pub mod validate;
pub mod workflows;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};
use quire_core::{GatePrompt, RunStatus, StepOutcome, StepReport, WorkflowRun};
use serde_json::{Map, Value};

/// Parse a JSON argument, naming the flag it came from on failure.
pub fn parse_json(raw: &str, flag: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON: {}", flag, raw))
}

/// Turn `KEY=VALUE` pairs into a data map. Values that parse as JSON are
/// stored as JSON, anything else as a plain string.
pub fn parse_data(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut data = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Empty key in '{}'", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        data.insert(key.to_string(), value);
    }
    Ok(data)
}

pub fn colored_status(status: RunStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        RunStatus::Pending => text.white(),
        RunStatus::Running => text.green(),
        RunStatus::Paused => text.yellow(),
        RunStatus::Completed => text.blue(),
        RunStatus::Failed => text.red(),
    }
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = time.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn print_run_line(run: &WorkflowRun) {
    println!("  Run:      {}", run.id.cyan());
    println!("  Workflow: {}", run.workflow_type);
    println!("  Subject:  {}", run.subject_id);
    println!("  Status:   {}", colored_status(run.status));
}

pub fn print_gate(prompt: &GatePrompt) {
    println!(
        "\n{} {}",
        "Waiting for a human decision at".yellow().bold(),
        prompt.step.cyan().bold()
    );
    println!("  {}", prompt.prompt);

    if !prompt.context.is_empty() {
        println!("\n  {}", "Context:".bold());
        for (key, value) in &prompt.context {
            let shown = match value {
                Value::String(s) => s.clone(),
                Value::Null => "(not set)".dimmed().to_string(),
                other => other.to_string(),
            };
            println!("    {:<18} {}", key, shown);
        }
    }

    println!("\n  {}", "Options:".bold());
    for option in &prompt.options {
        let target = option.next_step.as_deref().unwrap_or("end of workflow");
        let input = if option.requires_input {
            " (requires --input)".yellow().to_string()
        } else {
            String::new()
        };
        println!("    - {} -> {}{}", option.label.green(), target.dimmed(), input);
    }
}

/// Human-readable rendering of a runner report.
pub fn print_report(report: &StepReport) {
    println!("  Run:    {}", report.run_id.cyan());
    println!("  Status: {}", colored_status(report.status));

    match &report.outcome {
        StepOutcome::Ready {
            step,
            command,
            retry,
        } => {
            println!("\n{} {}", "Next step:".green().bold(), step.cyan().bold());
            println!("  Command: {}", command);
            if let Some(retry) = retry {
                println!(
                    "  {} attempt {} after: {}",
                    "Retry:".yellow().bold(),
                    retry.attempt,
                    retry.error
                );
            }
        }
        StepOutcome::AwaitingHuman(prompt) => print_gate(prompt),
        StepOutcome::Completed => {
            println!("\n{}", "Workflow completed.".green().bold());
        }
        StepOutcome::AlreadyAdvanced { step } => {
            println!(
                "\n{} {} {}",
                "Step".yellow(),
                step.cyan(),
                "was already verified; nothing changed.".yellow()
            );
            println!("  Current step: {}", report.current_step.cyan());
        }
    }
}

/// Print a report as JSON or text depending on `--json`.
pub fn emit_report(ctx: &crate::context::CliContext, report: &StepReport) -> Result<()> {
    if ctx.json {
        ctx.print_json(report)
    } else {
        print_report(report);
        Ok(())
    }
}
