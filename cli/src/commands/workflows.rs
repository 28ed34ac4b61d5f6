use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::{is_terminal_step, Condition, Transition, WorkflowDefinition, WorkflowStep};
use serde_json::{json, Value};

pub fn execute(ctx: &CliContext, workflow_type: Option<&str>) -> Result<()> {
    let registry = ctx.registry()?;

    match workflow_type {
        Some(workflow_type) => {
            let definition = registry
                .get(workflow_type)
                .ok_or_else(|| anyhow::anyhow!("Unknown workflow type: {}", workflow_type))?;
            if ctx.json {
                return ctx.print_json(&describe(&definition));
            }
            print_definition(&definition);
        }
        None => {
            if ctx.json {
                let all: Vec<Value> = registry.definitions().map(|d| summary(d)).collect();
                return ctx.print_json(&all);
            }
            println!("\n{}", "Workflows".green().bold());
            println!("{}", "─".repeat(80).dimmed());
            for definition in registry.definitions() {
                println!(
                    "{:<16} {:<28} {} steps, starts at {}",
                    definition.workflow_type().cyan(),
                    definition.name(),
                    definition.steps().len(),
                    definition.initial_step().yellow()
                );
                if let Some(description) = definition.description() {
                    println!("{:<16} {}", "", description.dimmed());
                }
            }
        }
    }

    Ok(())
}

fn summary(definition: &WorkflowDefinition) -> Value {
    json!({
        "workflowType": definition.workflow_type(),
        "name": definition.name(),
        "description": definition.description(),
        "initialStep": definition.initial_step(),
        "steps": definition.steps().len(),
    })
}

fn condition_names(conditions: &[Condition]) -> Vec<&str> {
    conditions.iter().map(Condition::name).collect()
}

fn transition_json(next: Option<&Transition>) -> Value {
    match next {
        None => Value::Null,
        Some(Transition::Terminal) => json!({ "end": true }),
        Some(Transition::Unconditional(target)) => json!(target),
        Some(Transition::Conditional(c)) => json!({
            "condition": c.predicate.source(),
            "onTrue": c.on_true,
            "onFalse": c.on_false,
            "maxIterations": c.max_iterations,
        }),
    }
}

fn step_json(step: &WorkflowStep) -> Value {
    json!({
        "name": step.name,
        "command": step.command,
        "description": step.description,
        "preconditions": condition_names(&step.preconditions),
        "postconditions": condition_names(&step.postconditions),
        "next": transition_json(step.next.as_ref()),
        "humanGate": step.human_gate,
        "terminal": is_terminal_step(step),
    })
}

/// Full JSON description of a definition.
pub fn describe(definition: &WorkflowDefinition) -> Value {
    let mut value = summary(definition);
    value["steps"] = Value::Array(definition.steps().iter().map(step_json).collect());
    value["unreferencedSteps"] = json!(definition.unreferenced_steps());
    value
}

fn describe_next(next: Option<&Transition>) -> String {
    match next {
        None => "(gate decides)".to_string(),
        Some(Transition::Terminal) => "end".to_string(),
        Some(Transition::Unconditional(target)) => target.clone(),
        Some(Transition::Conditional(c)) => format!(
            "if {} then {} else {} (max {})",
            c.predicate.source(),
            c.on_true,
            c.on_false,
            c.max_iterations
        ),
    }
}

fn print_definition(definition: &WorkflowDefinition) {
    println!(
        "\n{} {}",
        definition.workflow_type().green().bold(),
        format!("({})", definition.name()).dimmed()
    );
    if let Some(description) = definition.description() {
        println!("  {}", description);
    }
    println!("{}", "─".repeat(80).dimmed());

    for step in definition.steps() {
        let marker = if step.name == definition.initial_step() {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!("{} {}", marker, step.name.cyan().bold());
        println!("    command: {}", step.command);
        if !step.preconditions.is_empty() {
            println!("    pre:     {}", condition_names(&step.preconditions).join(", "));
        }
        if !step.postconditions.is_empty() {
            println!("    post:    {}", condition_names(&step.postconditions).join(", "));
        }
        println!("    next:    {}", describe_next(step.next.as_ref()));
        if let Some(gate) = &step.human_gate {
            println!("    {} {}", "gate:".yellow(), gate.prompt);
            for option in &gate.options {
                println!(
                    "      - {} -> {}",
                    option.label,
                    option.next_step.as_deref().unwrap_or("end")
                );
            }
        }
    }
}
