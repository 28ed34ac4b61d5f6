use super::colored_status;
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;

pub async fn execute(ctx: &CliContext, run_id: &str) -> Result<()> {
    let runner = ctx.runner().await?;
    let run = runner.pause(run_id).await?;

    if ctx.json {
        return ctx.print_json(&run);
    }

    println!("{}", "Run paused.".yellow().bold());
    println!("  Run:    {}", run.id.cyan());
    println!("  Status: {}", colored_status(run.status));
    if let Some(step) = &run.current_step {
        println!("  Step:   {}", step.cyan());
    }
    println!(
        "\n{}",
        format!("Continue with: quire resume {}", run.id).dimmed()
    );

    Ok(())
}
