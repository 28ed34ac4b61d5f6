use super::colored_status;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;

pub async fn execute(ctx: &CliContext, run_id: &str) -> Result<()> {
    let runner = ctx.runner().await?;
    let run = runner.cancel(run_id).await?;

    if ctx.json {
        return ctx.print_json(&run);
    }

    println!("{}", "Run cancelled.".red().bold());
    println!("  Run:    {}", run.id.cyan());
    println!("  Status: {}", colored_status(run.status));
    if let Some(step) = &run.current_step {
        println!("  Stopped at: {}", step);
    }

    Ok(())
}
