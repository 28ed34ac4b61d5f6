use super::emit_report;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;

pub async fn execute(
    ctx: &CliContext,
    run_id: &str,
    option: &str,
    input: Option<String>,
) -> Result<()> {
    let runner = ctx.runner().await?;
    let report = runner.answer_gate(run_id, option, input).await?;

    if !ctx.json {
        println!("{} {}", "Gate answered:".green().bold(), option.cyan());
    }
    emit_report(ctx, &report)
}
