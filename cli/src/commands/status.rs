use super::{colored_status, format_time, print_gate, print_run_line};
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::EscalationStatus;

pub async fn execute(ctx: &CliContext, run_id: &str) -> Result<()> {
    let runner = ctx.runner().await?;
    let summary = runner.status(run_id).await?;

    if ctx.json {
        return ctx.print_json(&summary);
    }

    let run = &summary.run;
    println!("\n{}", "Workflow Run".green().bold());
    println!("{}", "─".repeat(60).dimmed());
    print_run_line(run);
    if let Some(version) = &run.input_version_id {
        println!("  Input:    {}", version);
    }
    if let Some(version) = &run.output_version_id {
        println!("  Output:   {}", version);
    }
    println!("  Created:  {}", format_time(&run.created_at).dimmed());
    println!("  Updated:  {}", format_time(&run.updated_at).dimmed());

    match &summary.resume {
        Some(resume) => {
            println!("\n  Current step: {}", resume.current_step.cyan().bold());
            if resume.completed_steps.is_empty() {
                println!("  Completed:    {}", "(none)".dimmed());
            } else {
                println!("  Completed:    {}", resume.completed_steps.join(" -> "));
            }
            if let Some(retry) = &resume.pending_retry {
                println!(
                    "  {} {} attempt {}: {}",
                    "Pending retry:".yellow().bold(),
                    retry.step,
                    retry.attempt,
                    retry.error
                );
            }
        }
        None => println!("\n  {}", "No checkpoint recorded.".yellow()),
    }

    if !summary.iteration_counts.is_empty() {
        println!("\n  {}", "Iterations:".bold());
        for (step, count) in &summary.iteration_counts {
            println!("    {:<20} {}", step, count);
        }
    }

    if summary.is_terminal {
        println!("\n  {}", "Run is finished.".dimmed());
    } else {
        let next: Vec<String> = summary
            .valid_transitions
            .iter()
            .map(|s| colored_status(*s).to_string())
            .collect();
        println!("\n  Can move to: {}", next.join(", "));
    }

    let open: Vec<_> = summary
        .escalations
        .iter()
        .filter(|e| e.status != EscalationStatus::Resolved)
        .collect();
    if !open.is_empty() {
        println!("\n  {}", "Open escalations:".red().bold());
        for escalation in open {
            println!(
                "    {} [{}] {} -> {}",
                escalation.id.cyan(),
                escalation.status,
                escalation.reason,
                escalation.escalated_to.yellow()
            );
        }
    }

    if let Some(gate) = &summary.gate {
        print_gate(gate);
    }

    Ok(())
}
