use super::{emit_report, parse_data};
use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use tracing::info;

pub async fn execute(
    ctx: &CliContext,
    workflow_type: &str,
    subject_id: &str,
    input_version: Option<&str>,
    data: &[String],
) -> Result<()> {
    let data = parse_data(data)?;
    let runner = ctx.runner().await?;

    if !ctx.json {
        println!(
            "{}",
            format!("Starting {} for {}", workflow_type, subject_id)
                .green()
                .bold()
        );
    }

    let report = runner
        .start_with_data(workflow_type, subject_id, input_version, data)
        .await?;
    info!("Run {} started at {}", report.run_id, report.current_step);

    emit_report(ctx, &report)
}
