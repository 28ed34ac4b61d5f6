use super::parse_json;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::{ArtifactRegistry, ArtifactType, NewArtifact, RunRepository};

pub async fn execute(
    ctx: &CliContext,
    run_id: &str,
    artifact_type: &str,
    path: &str,
    metadata: Option<&str>,
) -> Result<()> {
    let artifact_type: ArtifactType = artifact_type.parse().map_err(|e: String| {
        let valid: Vec<&str> = ArtifactType::ALL.iter().map(ArtifactType::as_str).collect();
        anyhow::anyhow!("{} (expected one of: {})", e, valid.join(", "))
    })?;
    let metadata = metadata.map(|m| parse_json(m, "--metadata")).transpose()?;

    let store = ctx.store().await?;
    if store.get_run(run_id).await?.is_none() {
        anyhow::bail!("Workflow run not found: {}", run_id);
    }

    let artifact = store
        .register_artifact(NewArtifact {
            run_id: run_id.to_string(),
            artifact_type,
            artifact_path: path.to_string(),
            metadata,
        })
        .await?;

    if ctx.json {
        return ctx.print_json(&artifact);
    }

    println!("{}", "Artifact registered.".green().bold());
    println!("  ID:   {}", artifact.id.cyan());
    println!("  Type: {}", artifact.artifact_type.as_str().yellow());
    println!("  Path: {}", artifact.artifact_path);

    Ok(())
}
