/// Workflow definitions written as TOML
///
/// ```toml
/// type = "w2_pdf"
/// name = "W2 PDF Publication Workflow"
/// initial_step = "pm-review"
///
/// [conditions.pm_review_saved]
/// kind = "file_exists"
/// path = "data/w2-artifacts/{run_id}/pm-review.json"
/// error = "PM review not saved"
///
/// [[steps]]
/// name = "pm-review"
/// command = "pnpm w2:pm-review"
/// postconditions = ["pm_review_saved"]
/// next = "layout"
///
/// [[steps]]
/// name = "editor-review"
/// command = "pnpm w2:editor-review"
/// next = { condition = "result.approved === true", on_true = "human-gate", on_false = "layout", max_iterations = 3 }
///
/// [[steps]]
/// name = "finalize"
/// command = "pnpm w2:finalize"
/// next = { end = true }
/// ```
///
/// Gated steps carry a `[steps.human_gate]` table whose options name a
/// `next_step` or set `end = true`.
use crate::conditions::ConditionSpec;
use crate::definition::{
    define_workflow, Condition, GateOption, HumanGate, Transition, WorkflowDefinition,
    WorkflowSpec, WorkflowStep,
};
use crate::errors::{DefinitionError, DefinitionResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

fn default_max_iterations() -> u32 {
    3
}

/// A named condition declaration
#[derive(Debug, Clone, Deserialize)]
pub struct TomlCondition {
    pub error: String,
    #[serde(flatten)]
    pub spec: ConditionSpec,
}

/// The `next` field of a step
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TomlNext {
    Step(String),
    Branch {
        condition: String,
        on_true: String,
        on_false: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    End {
        end: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlGateOption {
    pub label: String,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub requires_input: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlGate {
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<String>,
    pub options: Vec<TomlGateOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    #[serde(default)]
    pub next: Option<TomlNext>,
    #[serde(default)]
    pub human_gate: Option<TomlGate>,
}

/// TOML-friendly workflow definition
#[derive(Debug, Clone, Deserialize)]
pub struct TomlWorkflow {
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub initial_step: String,
    #[serde(default)]
    pub conditions: BTreeMap<String, TomlCondition>,
    pub steps: Vec<TomlStep>,
}

impl TomlWorkflow {
    /// Compile conditions and predicates, then validate the graph.
    pub fn into_definition(self) -> DefinitionResult<WorkflowDefinition> {
        let mut conditions: BTreeMap<String, Condition> = BTreeMap::new();
        for (name, decl) in &self.conditions {
            conditions.insert(name.clone(), decl.spec.build(name, &decl.error)?);
        }

        let lookup = |step: &str, names: &[String]| -> DefinitionResult<Vec<Condition>> {
            names
                .iter()
                .map(|name| {
                    conditions
                        .get(name)
                        .cloned()
                        .ok_or_else(|| DefinitionError::UnknownCondition {
                            step: step.to_string(),
                            condition: name.clone(),
                        })
                })
                .collect()
        };

        let mut steps = Vec::with_capacity(self.steps.len());
        for toml_step in self.steps {
            let mut step = WorkflowStep::new(&toml_step.name, &toml_step.command);
            step.description = toml_step.description;
            step.preconditions = lookup(&toml_step.name, &toml_step.preconditions)?;
            step.postconditions = lookup(&toml_step.name, &toml_step.postconditions)?;
            step.next = match toml_step.next {
                None => None,
                Some(next) => Some(convert_next(&toml_step.name, next)?),
            };
            step.human_gate = match toml_step.human_gate {
                None => None,
                Some(gate) => Some(convert_gate(&toml_step.name, gate)?),
            };
            steps.push(step);
        }

        define_workflow(WorkflowSpec {
            workflow_type: self.workflow_type,
            name: self.name,
            description: self.description,
            initial_step: self.initial_step,
            steps,
        })
    }
}

fn convert_next(step: &str, next: TomlNext) -> DefinitionResult<Transition> {
    match next {
        TomlNext::Step(target) => Ok(Transition::Unconditional(target)),
        TomlNext::Branch {
            condition,
            on_true,
            on_false,
            max_iterations,
        } => Transition::conditional(&condition, on_true, on_false, max_iterations).map_err(|e| {
            DefinitionError::InvalidPredicate {
                step: step.to_string(),
                predicate: condition.clone(),
                reason: e.to_string(),
            }
        }),
        TomlNext::End { end: true } => Ok(Transition::Terminal),
        TomlNext::End { end: false } => Err(DefinitionError::Parse(format!(
            "step \"{}\": `next = {{ end = false }}` is not a transition",
            step
        ))),
    }
}

fn convert_gate(step: &str, gate: TomlGate) -> DefinitionResult<HumanGate> {
    let options = gate
        .options
        .into_iter()
        .map(|opt| match (opt.next_step, opt.end) {
            (Some(target), false) => Ok(GateOption {
                label: opt.label,
                next_step: Some(target),
                requires_input: opt.requires_input,
            }),
            (None, true) => Ok(GateOption {
                label: opt.label,
                next_step: None,
                requires_input: opt.requires_input,
            }),
            _ => Err(DefinitionError::Parse(format!(
                "step \"{}\": gate option \"{}\" needs exactly one of `next_step` or `end = true`",
                step, opt.label
            ))),
        })
        .collect::<DefinitionResult<Vec<_>>>()?;

    Ok(HumanGate {
        prompt: gate.prompt,
        context: gate.context,
        options,
    })
}

/// Parse and validate a workflow from TOML text.
pub fn parse_workflow(content: &str) -> DefinitionResult<WorkflowDefinition> {
    let toml_workflow: TomlWorkflow =
        toml::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    toml_workflow.into_definition()
}

pub fn load_workflow_file(path: &Path) -> DefinitionResult<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DefinitionError::Io(format!("{}: {}", path.display(), e)))?;
    parse_workflow(&content)
}
