use super::format_time;
use crate::context::CliContext;
use anyhow::Result;
use clap::Subcommand;
use colored::{ColoredString, Colorize};
use quire_core::{Escalation, EscalationStatus, EscalationStore, RunRepository};

#[derive(Subcommand)]
pub enum EscalationCommands {
    /// List escalations nobody has acknowledged, or every escalation of one run
    List {
        /// Show all escalations for this run, whatever their status
        #[arg(long)]
        run: Option<String>,
    },

    /// Mark an escalation as seen
    Ack {
        /// Escalation ID
        id: String,
    },

    /// Close an escalation with a note on how it was handled
    Resolve {
        /// Escalation ID
        id: String,

        /// How the escalation was resolved
        resolution: String,
    },
}

pub async fn execute(ctx: &CliContext, cmd: &EscalationCommands) -> Result<()> {
    let store = ctx.store().await?;

    match cmd {
        EscalationCommands::List { run } => {
            let escalations = match run {
                Some(run_id) => {
                    if store.get_run(run_id).await?.is_none() {
                        anyhow::bail!("Workflow run not found: {}", run_id);
                    }
                    store.escalations_for_run(run_id).await?
                }
                None => store.pending_escalations().await?,
            };

            if ctx.json {
                return ctx.print_json(&escalations);
            }
            if escalations.is_empty() {
                println!("{}", "No escalations.".yellow());
                return Ok(());
            }
            print_table(&escalations);
        }

        EscalationCommands::Ack { id } => {
            let escalation = store.acknowledge_escalation(id).await?;
            print_one(ctx, &escalation, "Acknowledged")?;
        }

        EscalationCommands::Resolve { id, resolution } => {
            if resolution.trim().is_empty() {
                anyhow::bail!("Resolution must not be empty");
            }
            let escalation = store.resolve_escalation(id, resolution).await?;
            print_one(ctx, &escalation, "Resolved")?;
        }
    }

    Ok(())
}

fn colored_escalation_status(status: EscalationStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        EscalationStatus::Pending => text.red(),
        EscalationStatus::Acknowledged => text.yellow(),
        EscalationStatus::Resolved => text.green(),
    }
}

fn print_one(ctx: &CliContext, escalation: &Escalation, verb: &str) -> Result<()> {
    if ctx.json {
        return ctx.print_json(escalation);
    }
    println!(
        "{} escalation {}",
        verb.green().bold(),
        escalation.id.cyan()
    );
    println!("  Run:    {}", escalation.run_id);
    println!("  Step:   {}", escalation.step);
    println!("  Status: {}", colored_escalation_status(escalation.status));
    if let Some(resolution) = &escalation.resolution {
        println!("  Resolution: {}", resolution);
    }
    Ok(())
}

fn print_table(escalations: &[Escalation]) {
    println!("\n{}", "Escalations".green().bold());
    println!("{}", "─".repeat(120).dimmed());
    println!(
        "{:<40} {:<40} {:<16} {:<14} {:<20}",
        "ID".bold(),
        "RUN".bold(),
        "STEP".bold(),
        "STATUS".bold(),
        "OPENED".bold()
    );
    println!("{}", "─".repeat(120).dimmed());

    for escalation in escalations {
        println!(
            "{:<40} {:<40} {:<16} {:<14} {:<20}",
            escalation.id.cyan(),
            escalation.run_id,
            escalation.step,
            colored_escalation_status(escalation.status).to_string(),
            format_time(&escalation.created_at).dimmed()
        );
        println!(
            "    {} -> {}: {}",
            escalation.kind.as_str().dimmed(),
            escalation.escalated_to.yellow(),
            escalation.reason
        );
    }

    println!("{}", "─".repeat(120).dimmed());
    println!("\nTotal: {}", escalations.len().to_string().cyan());
}
