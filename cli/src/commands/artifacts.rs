use super::format_time;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::{Artifact, ArtifactRegistry, ArtifactType};

pub async fn execute(
    ctx: &CliContext,
    run_id: Option<&str>,
    artifact_type: Option<&str>,
) -> Result<()> {
    let artifact_type = artifact_type
        .map(|t| t.parse::<ArtifactType>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = ctx.store().await?;
    let artifacts = match (run_id, artifact_type) {
        (Some(run), Some(kind)) => store.artifacts_by_run_and_type(run, kind).await?,
        (Some(run), None) => store.artifacts_by_run(run).await?,
        (None, Some(kind)) => store.artifacts_by_type(kind).await?,
        (None, None) => anyhow::bail!("Give a run ID, --type, or both"),
    };

    if ctx.json {
        return ctx.print_json(&artifacts);
    }

    if artifacts.is_empty() {
        println!("{}", "No artifacts registered.".yellow());
        return Ok(());
    }

    print_table(&artifacts);
    Ok(())
}

fn print_table(artifacts: &[Artifact]) {
    println!("\n{}", "Artifacts".green().bold());
    println!("{}", "─".repeat(110).dimmed());
    println!(
        "{:<42} {:<18} {:<30} {:<20}",
        "ID".bold(),
        "TYPE".bold(),
        "PATH".bold(),
        "REGISTERED".bold()
    );
    println!("{}", "─".repeat(110).dimmed());

    for artifact in artifacts {
        println!(
            "{:<42} {:<18} {:<30} {:<20}",
            artifact.id.cyan(),
            artifact.artifact_type.as_str().yellow().to_string(),
            artifact.artifact_path,
            format_time(&artifact.created_at).dimmed()
        );
    }

    println!("{}", "─".repeat(110).dimmed());
    println!("\nTotal: {}", artifacts.len().to_string().cyan());
}
