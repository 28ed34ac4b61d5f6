use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use serde_json::json;

pub async fn execute(ctx: &CliContext, version_id: &str, subject_id: &str) -> Result<()> {
    let store = ctx.store().await?;
    store.insert_version(version_id, subject_id).await?;

    if ctx.json {
        return ctx.print_json(&json!({ "id": version_id, "subjectId": subject_id }));
    }

    println!(
        "{} {} for {}",
        "Version recorded:".green().bold(),
        version_id.cyan(),
        subject_id
    );
    Ok(())
}
