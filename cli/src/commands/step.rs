use super::{emit_report, parse_data, parse_json};
use crate::context::CliContext;
use anyhow::Result;
use quire_core::StepCompletion;
use serde_json::Value;

/// Show what the current step needs without changing the run.
pub async fn prepare(ctx: &CliContext, run_id: &str) -> Result<()> {
    let runner = ctx.runner().await?;
    let report = runner.prepare(run_id).await?;
    emit_report(ctx, &report)
}

/// Report `step` as finished and advance the run.
pub async fn report(
    ctx: &CliContext,
    run_id: &str,
    step: &str,
    result: Option<&str>,
    data: &[String],
    output_version: Option<String>,
) -> Result<()> {
    let completion = StepCompletion {
        result: match result {
            Some(raw) => parse_json(raw, "--result")?,
            None => Value::Null,
        },
        data: parse_data(data)?,
        output_version_id: output_version,
    };

    let runner = ctx.runner().await?;
    let report = runner.report_step(run_id, step, completion).await?;
    emit_report(ctx, &report)
}
