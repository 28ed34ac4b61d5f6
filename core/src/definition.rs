//! Workflow definitions: steps, transitions, human gates and the conditions
//! guarding them.
//!
//! A [`WorkflowDefinition`] is only obtainable through [`define_workflow`],
//! which refuses any graph with a dangling reference. Definitions are
//! immutable and shared across runs behind an `Arc`.

use crate::checkpoint::Checkpoint;
use crate::errors::{DefinitionError, DefinitionResult, StoreResult};
use crate::expression_eval::{EvalResult, Predicate};
use crate::traits::{ConditionDatabase, WorkflowRun};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// CONDITIONS
// ============================================================================

/// What a condition may look at. Conditions read; they never write.
pub struct ConditionContext<'a> {
    pub run: &'a WorkflowRun,
    pub checkpoint: &'a Checkpoint,
    /// Result reported for the step being verified, if any.
    pub result: Option<&'a Value>,
    pub db: &'a dyn ConditionDatabase,
    /// Directory relative file paths are resolved against.
    pub base_dir: &'a Path,
}

#[async_trait]
pub trait ConditionCheck: Send + Sync {
    async fn check(&self, ctx: &ConditionContext<'_>) -> StoreResult<bool>;
}

struct FnCheck<F>(F);

#[async_trait]
impl<F> ConditionCheck for FnCheck<F>
where
    F: Fn(&ConditionContext<'_>) -> bool + Send + Sync,
{
    async fn check(&self, ctx: &ConditionContext<'_>) -> StoreResult<bool> {
        Ok((self.0)(ctx))
    }
}

/// A named predicate used as a step precondition or postcondition.
#[derive(Clone)]
pub struct Condition {
    name: String,
    error: String,
    check: Arc<dyn ConditionCheck>,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("name", &self.name)
            .field("error", &self.error)
            .finish()
    }
}

impl Condition {
    pub fn new(
        name: impl Into<String>,
        error: impl Into<String>,
        check: impl ConditionCheck + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            check: Arc::new(check),
        }
    }

    /// Condition backed by a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, error: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ConditionContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self::new(name, error, FnCheck(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub async fn evaluate(&self, ctx: &ConditionContext<'_>) -> StoreResult<bool> {
        let passed = self.check.check(ctx).await?;
        debug!(
            run_id = %ctx.run.id,
            condition = %self.name,
            passed,
            "Evaluated condition"
        );
        Ok(passed)
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Branch on a predicate over the step's result, looping back through
/// `on_false` at most `max_iterations` times.
#[derive(Debug, Clone)]
pub struct ConditionalNext {
    pub predicate: Predicate,
    pub on_true: String,
    pub on_false: String,
    pub max_iterations: u32,
}

/// Where a step goes once it completes.
#[derive(Debug, Clone)]
pub enum Transition {
    Unconditional(String),
    Conditional(ConditionalNext),
    Terminal,
}

impl Transition {
    pub fn to(step: impl Into<String>) -> Self {
        Transition::Unconditional(step.into())
    }

    /// Compile `expression` and build a bounded conditional branch.
    pub fn conditional(
        expression: &str,
        on_true: impl Into<String>,
        on_false: impl Into<String>,
        max_iterations: u32,
    ) -> EvalResult<Self> {
        Ok(Transition::Conditional(ConditionalNext {
            predicate: Predicate::compile(expression)?,
            on_true: on_true.into(),
            on_false: on_false.into(),
            max_iterations,
        }))
    }

    /// Step names this transition can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Transition::Unconditional(target) => vec![target.as_str()],
            Transition::Conditional(c) => vec![c.on_true.as_str(), c.on_false.as_str()],
            Transition::Terminal => Vec::new(),
        }
    }
}

// ============================================================================
// HUMAN GATES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOption {
    pub label: String,
    /// `None` ends the workflow.
    pub next_step: Option<String>,
    pub requires_input: bool,
}

impl GateOption {
    pub fn to(label: impl Into<String>, next_step: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_step: Some(next_step.into()),
            requires_input: false,
        }
    }

    pub fn end(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            next_step: None,
            requires_input: false,
        }
    }

    pub fn requiring_input(mut self) -> Self {
        self.requires_input = true;
        self
    }
}

/// Suspends the run until a human picks one of `options`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HumanGate {
    pub prompt: String,
    /// Checkpoint keys (dotted paths allowed) shown alongside the prompt.
    pub context: Vec<String>,
    pub options: Vec<GateOption>,
}

impl HumanGate {
    pub fn option(&self, label: &str) -> Option<&GateOption> {
        self.options.iter().find(|o| o.label == label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.options.iter().map(|o| o.label.clone()).collect()
    }
}

// ============================================================================
// STEPS
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub name: String,
    /// External command that performs the step; opaque to the engine.
    pub command: String,
    pub description: Option<String>,
    pub preconditions: Vec<Condition>,
    pub postconditions: Vec<Condition>,
    pub next: Option<Transition>,
    pub human_gate: Option<HumanGate>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            description: None,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            next: None,
            human_gate: None,
        }
    }

    pub fn with_precondition(mut self, condition: Condition) -> Self {
        self.preconditions.push(condition);
        self
    }

    pub fn with_postcondition(mut self, condition: Condition) -> Self {
        self.postconditions.push(condition);
        self
    }

    pub fn with_next(mut self, next: Transition) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_gate(mut self, gate: HumanGate) -> Self {
        self.human_gate = Some(gate);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// True exactly when the step's transition is the explicit end marker.
pub fn is_terminal_step(step: &WorkflowStep) -> bool {
    matches!(step.next, Some(Transition::Terminal))
}

// ============================================================================
// DEFINITIONS
// ============================================================================

/// Unvalidated input to [`define_workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub workflow_type: String,
    pub name: String,
    pub description: Option<String>,
    pub initial_step: String,
    pub steps: Vec<WorkflowStep>,
}

/// A validated, immutable step graph.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    workflow_type: String,
    name: String,
    description: Option<String>,
    initial_step: String,
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
}

impl WorkflowDefinition {
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Non-initial steps no transition or gate option leads to.
    pub fn unreferenced_steps(&self) -> Vec<&str> {
        let mut referenced: HashSet<&str> = HashSet::new();
        referenced.insert(self.initial_step.as_str());
        for step in &self.steps {
            if let Some(next) = &step.next {
                referenced.extend(next.targets());
            }
            if let Some(gate) = &step.human_gate {
                referenced.extend(gate.options.iter().filter_map(|o| o.next_step.as_deref()));
            }
        }
        self.steps
            .iter()
            .map(|s| s.name.as_str())
            .filter(|name| !referenced.contains(name))
            .collect()
    }
}

pub fn get_step<'a>(definition: &'a WorkflowDefinition, name: &str) -> Option<&'a WorkflowStep> {
    definition.step(name)
}

/// Validate `spec` and freeze it into a definition.
///
/// Checks, stopping at the first violation:
/// 1. the initial step exists
/// 2. step names are unique
/// 3. every step has a transition or a human gate, and every
///    transition target exists
/// 4. every non-terminal gate option target exists
pub fn define_workflow(spec: WorkflowSpec) -> DefinitionResult<WorkflowDefinition> {
    let workflow = spec.workflow_type.clone();

    if !spec.steps.iter().any(|s| s.name == spec.initial_step) {
        return Err(DefinitionError::UnknownInitialStep {
            workflow,
            step: spec.initial_step,
        });
    }

    let mut index = HashMap::with_capacity(spec.steps.len());
    for (i, step) in spec.steps.iter().enumerate() {
        if index.insert(step.name.clone(), i).is_some() {
            return Err(DefinitionError::DuplicateStep {
                workflow,
                step: step.name.clone(),
            });
        }
    }

    for step in &spec.steps {
        match &step.next {
            None if step.human_gate.is_none() => {
                return Err(DefinitionError::IncompleteStep {
                    workflow,
                    step: step.name.clone(),
                });
            }
            None => {}
            Some(next) => {
                if let Some(target) = next.targets().into_iter().find(|t| !index.contains_key(*t)) {
                    return Err(DefinitionError::DanglingTransition {
                        workflow,
                        step: step.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
    }

    for step in &spec.steps {
        let Some(gate) = &step.human_gate else {
            continue;
        };
        for option in &gate.options {
            if let Some(target) = &option.next_step {
                if !index.contains_key(target) {
                    return Err(DefinitionError::DanglingGateOption {
                        workflow,
                        step: step.name.clone(),
                        option: option.label.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    let definition = WorkflowDefinition {
        workflow_type: spec.workflow_type,
        name: spec.name,
        description: spec.description,
        initial_step: spec.initial_step,
        steps: spec.steps,
        index,
    };

    for name in definition.unreferenced_steps() {
        if let Some(step) = definition.step(name) {
            if !is_terminal_step(step) {
                debug!(
                    workflow = %definition.workflow_type,
                    step = name,
                    "Step is unreachable and not terminal"
                );
            }
        }
    }

    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(steps: Vec<WorkflowStep>) -> WorkflowSpec {
        WorkflowSpec {
            workflow_type: "test".into(),
            name: "Test".into(),
            description: None,
            initial_step: "a".into(),
            steps,
        }
    }

    fn gate(options: Vec<GateOption>) -> HumanGate {
        HumanGate {
            prompt: "Decide".into(),
            context: vec![],
            options,
        }
    }

    #[test]
    fn test_valid_definition() {
        let def = define_workflow(spec(vec![
            WorkflowStep::new("a", "cmd a").with_next(Transition::to("b")),
            WorkflowStep::new("b", "cmd b")
                .with_next(Transition::conditional("result.ok == true", "c", "a", 3).unwrap()),
            WorkflowStep::new("c", "cmd c").with_gate(gate(vec![
                GateOption::to("Again", "a").requiring_input(),
                GateOption::end("Done"),
            ])),
        ]))
        .unwrap();

        assert_eq!(def.initial_step(), "a");
        assert_eq!(get_step(&def, "b").unwrap().command, "cmd b");
        assert!(get_step(&def, "z").is_none());
        assert!(def.unreferenced_steps().is_empty());
    }

    #[test]
    fn test_rejects_unknown_initial_step() {
        let mut s = spec(vec![WorkflowStep::new("b", "x").with_next(Transition::Terminal)]);
        s.initial_step = "a".into();
        assert!(matches!(
            define_workflow(s),
            Err(DefinitionError::UnknownInitialStep { step, .. }) if step == "a"
        ));
    }

    #[test]
    fn test_rejects_dangling_unconditional_target() {
        let err = define_workflow(spec(vec![
            WorkflowStep::new("a", "x").with_next(Transition::to("missing"))
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid workflow definition: step \"a\" references non-existent next step \"missing\""
        );
    }

    #[test]
    fn test_rejects_dangling_conditional_targets() {
        for (on_true, on_false) in [("missing", "a"), ("a", "missing")] {
            let err = define_workflow(spec(vec![WorkflowStep::new("a", "x")
                .with_next(Transition::conditional("result.ok", on_true, on_false, 2).unwrap())]))
            .unwrap_err();
            assert!(matches!(
                err,
                DefinitionError::DanglingTransition { ref target, .. } if target == "missing"
            ));
        }
    }

    #[test]
    fn test_rejects_dangling_gate_option() {
        let err = define_workflow(spec(vec![WorkflowStep::new("a", "x").with_gate(gate(vec![
            GateOption::end("Stop"),
            GateOption::to("Go", "nowhere"),
        ]))]))
        .unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::DanglingGateOption { ref option, ref target, .. }
                if option == "Go" && target == "nowhere"
        ));
    }

    #[test]
    fn test_rejects_step_without_transition_or_gate() {
        let err = define_workflow(spec(vec![WorkflowStep::new("a", "x")])).unwrap_err();
        assert!(matches!(err, DefinitionError::IncompleteStep { .. }));
    }

    #[test]
    fn test_rejects_duplicate_steps() {
        let err = define_workflow(spec(vec![
            WorkflowStep::new("a", "x").with_next(Transition::Terminal),
            WorkflowStep::new("a", "y").with_next(Transition::Terminal),
        ]))
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStep { .. }));
    }

    #[test]
    fn test_initial_step_checked_before_targets() {
        let mut s = spec(vec![WorkflowStep::new("b", "x").with_next(Transition::to("missing"))]);
        s.initial_step = "nope".into();
        assert!(matches!(
            define_workflow(s),
            Err(DefinitionError::UnknownInitialStep { .. })
        ));
    }

    #[test]
    fn test_terminal_detection() {
        let terminal = WorkflowStep::new("a", "x").with_next(Transition::Terminal);
        let unconditional = WorkflowStep::new("a", "x").with_next(Transition::to("b"));
        let conditional = WorkflowStep::new("a", "x")
            .with_next(Transition::conditional("result.ok", "a", "b", 1).unwrap());
        let unset = WorkflowStep::new("a", "x");

        assert!(is_terminal_step(&terminal));
        assert!(!is_terminal_step(&unconditional));
        assert!(!is_terminal_step(&conditional));
        assert!(!is_terminal_step(&unset));
    }

    #[test]
    fn test_unreferenced_steps() {
        let def = define_workflow(spec(vec![
            WorkflowStep::new("a", "x").with_next(Transition::Terminal),
            WorkflowStep::new("orphan", "y").with_next(Transition::to("a")),
        ]))
        .unwrap();
        assert_eq!(def.unreferenced_steps(), vec!["orphan"]);
    }
}
