//! Built-in condition kinds usable from workflow files.
//!
//! Each kind is declared once under `[conditions.<name>]` with a `kind`
//! tag and the fields it needs, for example:
//!
//! ```toml
//! [conditions.layout_plan_saved]
//! kind = "file_exists"
//! path = "data/w2-artifacts/{run_id}/layout-plan.json"
//! error = "Layout plan not saved"
//! ```

use crate::definition::{Condition, ConditionCheck, ConditionContext};
use crate::errors::{DefinitionError, DefinitionResult, StoreResult};
use crate::expression_eval::{EvalContext, Predicate};
use crate::run_state::RunStatus;
use crate::traits::ArtifactType;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::warn;

/// Declarative form of a condition as written in a workflow file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionSpec {
    /// A file exists. `{run_id}`, `{subject_id}` and `{step}` are substituted.
    FileExists { path: String },

    /// `data[key]` holds a path to an existing file.
    DataPathExists { key: String },

    /// `data[key]` (dotted) is present and not null.
    DataPresent { key: String },

    /// An expression over `data`, `result`, `run` and `gate` is truthy.
    Expression { expr: String },

    GateDecisionRecorded,

    StrategicPlanExists,

    /// At least one artifact, optionally of one type, is registered for the run.
    ArtifactsRegistered {
        #[serde(default)]
        artifact_type: Option<ArtifactType>,
    },

    /// The version named by `data[key]`, or the run's input version when
    /// `key` is absent, exists.
    VersionExists {
        #[serde(default)]
        key: Option<String>,
    },

    /// The run's persisted status matches.
    RunStatus { status: RunStatus },
}

impl ConditionSpec {
    /// Compile into a runnable condition.
    pub fn build(&self, name: &str, error: &str) -> DefinitionResult<Condition> {
        let check = match self {
            ConditionSpec::FileExists { path } => Builtin::FileExists(path.clone()),
            ConditionSpec::DataPathExists { key } => Builtin::DataPathExists(key.clone()),
            ConditionSpec::DataPresent { key } => Builtin::DataPresent(key.clone()),
            ConditionSpec::Expression { expr } => {
                let predicate =
                    Predicate::compile(expr).map_err(|e| DefinitionError::InvalidCondition {
                        condition: name.to_string(),
                        reason: e.to_string(),
                    })?;
                Builtin::Expression(predicate)
            }
            ConditionSpec::GateDecisionRecorded => Builtin::GateDecisionRecorded,
            ConditionSpec::StrategicPlanExists => Builtin::StrategicPlanExists,
            ConditionSpec::ArtifactsRegistered { artifact_type } => {
                Builtin::ArtifactsRegistered(*artifact_type)
            }
            ConditionSpec::VersionExists { key } => Builtin::VersionExists(key.clone()),
            ConditionSpec::RunStatus { status } => Builtin::RunStatus(*status),
        };
        Ok(Condition::new(name, error, check))
    }
}

enum Builtin {
    FileExists(String),
    DataPathExists(String),
    DataPresent(String),
    Expression(Predicate),
    GateDecisionRecorded,
    StrategicPlanExists,
    ArtifactsRegistered(Option<ArtifactType>),
    VersionExists(Option<String>),
    RunStatus(RunStatus),
}

fn render_template(template: &str, ctx: &ConditionContext<'_>) -> String {
    template
        .replace("{run_id}", &ctx.run.id)
        .replace("{subject_id}", &ctx.run.subject_id)
        .replace("{step}", &ctx.checkpoint.current_step)
}

fn resolve_path(path: &str, ctx: &ConditionContext<'_>) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        ctx.base_dir.join(path)
    }
}

/// Variables visible to `expression` conditions.
fn expression_context(ctx: &ConditionContext<'_>) -> EvalContext {
    let gate = match &ctx.checkpoint.gate_decision {
        Some(decision) => json!({
            "gate": decision.gate,
            "option": decision.option,
            "input": decision.input,
        }),
        None => Value::Null,
    };
    EvalContext::new()
        .with_root("data", Value::Object(ctx.checkpoint.data.clone()))
        .with_root("result", ctx.result.cloned().unwrap_or(Value::Null))
        .with_root(
            "run",
            json!({
                "id": ctx.run.id,
                "subject_id": ctx.run.subject_id,
                "workflow_type": ctx.run.workflow_type,
                "status": ctx.run.status.as_str(),
            }),
        )
        .with_root("gate", gate)
}

#[async_trait]
impl ConditionCheck for Builtin {
    async fn check(&self, ctx: &ConditionContext<'_>) -> StoreResult<bool> {
        let passed = match self {
            Builtin::FileExists(template) => {
                resolve_path(&render_template(template, ctx), ctx).exists()
            }
            Builtin::DataPathExists(key) => match ctx.checkpoint.lookup(key) {
                Some(Value::String(path)) => resolve_path(path, ctx).exists(),
                _ => false,
            },
            Builtin::DataPresent(key) => {
                matches!(ctx.checkpoint.lookup(key), Some(v) if !v.is_null())
            }
            Builtin::Expression(predicate) => {
                match predicate.test(&expression_context(ctx)) {
                    Ok(passed) => passed,
                    Err(e) => {
                        warn!(
                            run_id = %ctx.run.id,
                            expression = %predicate,
                            error = %e,
                            "Condition expression failed to evaluate"
                        );
                        false
                    }
                }
            }
            Builtin::GateDecisionRecorded => ctx.checkpoint.gate_decision.is_some(),
            Builtin::StrategicPlanExists => ctx.db.strategic_plan_exists(&ctx.run.id).await?,
            Builtin::ArtifactsRegistered(artifact_type) => {
                ctx.db.artifacts_exist(&ctx.run.id, *artifact_type).await?
            }
            Builtin::VersionExists(key) => {
                let version_id = match key {
                    Some(key) => ctx
                        .checkpoint
                        .lookup(key)
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    None => ctx.run.input_version_id.clone(),
                };
                match version_id {
                    Some(id) => ctx.db.version_exists(&id).await?,
                    None => false,
                }
            }
            Builtin::RunStatus(expected) => {
                ctx.db.workflow_status(&ctx.run.id).await? == Some(*expected)
            }
        };
        Ok(passed)
    }
}
