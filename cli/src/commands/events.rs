use super::format_time;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::{EventEmitter, EventType, RunRepository, WorkflowEvent};

pub async fn execute(ctx: &CliContext, run_id: &str, latest: bool) -> Result<()> {
    let store = ctx.store().await?;
    if store.get_run(run_id).await?.is_none() {
        anyhow::bail!("Workflow run not found: {}", run_id);
    }

    let events: Vec<WorkflowEvent> = if latest {
        store.latest_event(run_id).await?.into_iter().collect()
    } else {
        store.events_for_run(run_id).await?
    };

    if ctx.json {
        return ctx.print_json(&events);
    }

    if events.is_empty() {
        println!("{}", "No events recorded.".yellow());
        return Ok(());
    }

    println!("\n{} {}", "Events for".green().bold(), run_id.cyan());
    println!("{}", "─".repeat(100).dimmed());
    for event in &events {
        print_event(event);
    }
    println!("{}", "─".repeat(100).dimmed());

    Ok(())
}

fn print_event(event: &WorkflowEvent) {
    let kind = event.event_type.as_str();
    let kind = match event.event_type {
        EventType::Started | EventType::Resumed => kind.green(),
        EventType::Completed => kind.blue(),
        EventType::Rejected => kind.red(),
        EventType::Escalated => kind.red().bold(),
        EventType::Paused => kind.yellow(),
    };

    let data = event
        .data
        .as_ref()
        .map(|d| d.to_string())
        .unwrap_or_default();

    println!(
        "{} {:<10} {:<18} {}",
        format_time(&event.created_at).dimmed(),
        kind.to_string(),
        event.agent_name.as_deref().unwrap_or("-"),
        data.dimmed()
    );
}
