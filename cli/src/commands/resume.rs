use super::emit_report;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;

pub async fn execute(ctx: &CliContext, run_id: &str) -> Result<()> {
    let runner = ctx.runner().await?;
    let report = runner.resume(run_id).await?;

    if !ctx.json {
        println!("{}", "Resuming from checkpoint.".green().bold());
    }
    emit_report(ctx, &report)
}
