//! Step Runner - drives one workflow run a single step at a time.
//!
//! The runner never executes step commands itself. Each call does one unit of
//! work and returns:
//! - `start` creates the run and enters the initial step
//! - `report_step` verifies a finished step and advances the checkpoint
//! - `answer_gate` resolves a human gate
//! - `pause` / `resume` / `cancel` drive the lifecycle
//!
//! The checkpoint is saved before any status change or event, so the stored
//! checkpoint always reflects the furthest confirmed progress.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::checkpoint::{create_checkpoint, Checkpoint, PendingRetry, ResumeContext};
use crate::definition::{
    Condition, ConditionContext, GateOption, HumanGate, Transition, WorkflowDefinition,
    WorkflowStep,
};
use crate::errors::{EngineError, EngineResult};
use crate::registry::WorkflowRegistry;
use crate::run_state::RunStatus;
use crate::traits::{
    Escalation, EscalationKind, EventType, NewEscalation, NewEvent, NewRun, WorkflowRun,
    WorkflowStore,
};

/// Postcondition failures tolerated per step before the run is escalated.
pub const DEFAULT_MAX_STEP_RETRIES: u32 = 1;

/// Who escalation records are addressed to unless configured otherwise.
pub const DEFAULT_ESCALATION_TARGET: &str = "human-reviewer";

/// What a human sees at a gated step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePrompt {
    pub step: String,
    pub prompt: String,
    /// Requested checkpoint keys; missing keys map to `null`.
    pub context: BTreeMap<String, Value>,
    pub options: Vec<GateOption>,
}

/// Where a run stands after one runner call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Preconditions hold; the caller should run `command`.
    Ready {
        step: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<PendingRetry>,
    },
    /// Suspended at a human gate.
    AwaitingHuman(GatePrompt),
    Completed,
    /// The reported step had already been verified; nothing changed.
    AlreadyAdvanced { step: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub run_id: String,
    pub status: RunStatus,
    pub current_step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// What a finished step hands back to the runner.
#[derive(Debug, Clone, Default)]
pub struct StepCompletion {
    /// Result object transition predicates are evaluated against.
    pub result: Value,
    /// Merged into the checkpoint data bag before verification.
    pub data: Map<String, Value>,
    pub output_version_id: Option<String>,
}

impl StepCompletion {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Status view used by CLI tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run: WorkflowRun,
    pub is_terminal: bool,
    pub valid_transitions: Vec<RunStatus>,
    pub iteration_counts: BTreeMap<String, u32>,
    pub resume: Option<ResumeContext>,
    pub gate: Option<GatePrompt>,
    /// Every escalation opened for the run, oldest first.
    pub escalations: Vec<Escalation>,
}

enum Resolution {
    Advance(String),
    Finish,
}

pub struct StepRunner<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    base_dir: PathBuf,
    max_step_retries: u32,
    escalation_target: String,
}

impl<S: WorkflowStore> StepRunner<S> {
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            store,
            registry,
            base_dir: PathBuf::from("."),
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            escalation_target: DEFAULT_ESCALATION_TARGET.to_string(),
        }
    }

    /// Directory relative condition paths are resolved against.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_max_step_retries(mut self, max_step_retries: u32) -> Self {
        self.max_step_retries = max_step_retries;
        self
    }

    pub fn with_escalation_target(mut self, target: impl Into<String>) -> Self {
        self.escalation_target = target.into();
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a run for `subject_id`, checkpoint it at the initial step and
    /// enter that step.
    pub async fn start(
        &self,
        workflow_type: &str,
        subject_id: &str,
        input_version_id: Option<&str>,
    ) -> EngineResult<StepReport> {
        self.start_with_data(workflow_type, subject_id, input_version_id, Map::new())
            .await
    }

    /// Like [`start`](Self::start), seeding the checkpoint data bag first so
    /// the initial step's preconditions can see it.
    pub async fn start_with_data(
        &self,
        workflow_type: &str,
        subject_id: &str,
        input_version_id: Option<&str>,
        data: Map<String, Value>,
    ) -> EngineResult<StepReport> {
        let definition = self
            .registry
            .get(workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_type.to_string()))?;

        let run = self
            .store
            .create_run(NewRun {
                workflow_type: workflow_type.to_string(),
                subject_id: subject_id.to_string(),
                input_version_id: input_version_id.map(str::to_string),
                session_id: None,
            })
            .await?;

        let mut checkpoint = create_checkpoint(&run.id, workflow_type, definition.initial_step());
        checkpoint.merge_data(data);
        self.store.save_checkpoint(&checkpoint).await?;
        let run = self.store.update_status(&run.id, RunStatus::Running).await?;

        info!(
            run_id = %run.id,
            workflow = workflow_type,
            subject = subject_id,
            "Started workflow run"
        );

        let outcome = self.enter_step(&definition, &run, &mut checkpoint).await?;
        self.report(&run.id, &checkpoint, outcome).await
    }

    /// Re-check the current step without changing anything.
    ///
    /// A step the run advanced to but never entered, because its
    /// preconditions failed at the time, is entered now.
    pub async fn prepare(&self, run_id: &str) -> EngineResult<StepReport> {
        let (run, definition, mut checkpoint) = self.load(run_id).await?;
        let step = self.current_step(&definition, &checkpoint)?;

        let outcome = match run.status {
            RunStatus::Completed => StepOutcome::Completed,
            RunStatus::Paused => match &step.human_gate {
                Some(gate) if checkpoint.gate_decision.is_none() => {
                    StepOutcome::AwaitingHuman(gate_prompt(step, gate, &checkpoint))
                }
                _ => {
                    return Err(EngineError::RunNotActive {
                        run_id: run.id,
                        status: run.status,
                    })
                }
            },
            RunStatus::Running if run.current_agent.as_deref() != Some(step.name.as_str()) => {
                debug!(run_id, step = %step.name, "Entering step left unentered");
                let outcome = self.enter_step(&definition, &run, &mut checkpoint).await?;
                return self.report(&run.id, &checkpoint, outcome).await;
            }
            RunStatus::Running => {
                self.check_preconditions(&run, &checkpoint, step).await?;
                match &step.human_gate {
                    Some(gate) => StepOutcome::AwaitingHuman(gate_prompt(step, gate, &checkpoint)),
                    None => StepOutcome::Ready {
                        step: step.name.clone(),
                        command: step.command.clone(),
                        retry: checkpoint.pending_retry.clone(),
                    },
                }
            }
            RunStatus::Pending | RunStatus::Failed => {
                return Err(EngineError::RunNotActive {
                    run_id: run.id,
                    status: run.status,
                })
            }
        };

        Ok(StepReport {
            run_id: run.id,
            status: run.status,
            current_step: checkpoint.current_step,
            outcome,
        })
    }

    /// Verify that `step_name` finished and advance the run.
    ///
    /// Reporting a step the run has already moved past is a no-op that
    /// returns [`StepOutcome::AlreadyAdvanced`].
    pub async fn report_step(
        &self,
        run_id: &str,
        step_name: &str,
        completion: StepCompletion,
    ) -> EngineResult<StepReport> {
        let (run, definition, mut checkpoint) = self.load(run_id).await?;

        if run.status.is_terminal() || checkpoint.current_step != step_name {
            if checkpoint.is_step_completed(step_name) {
                debug!(run_id, step = step_name, "Step already advanced past");
                return Ok(StepReport {
                    run_id: run.id,
                    status: run.status,
                    current_step: checkpoint.current_step,
                    outcome: StepOutcome::AlreadyAdvanced {
                        step: step_name.to_string(),
                    },
                });
            }
            if run.status.is_terminal() {
                return Err(EngineError::RunNotActive {
                    run_id: run.id,
                    status: run.status,
                });
            }
            return Err(EngineError::StepOutOfOrder {
                run_id: run.id,
                step: step_name.to_string(),
                current: checkpoint.current_step,
            });
        }

        let step = self.current_step(&definition, &checkpoint)?;
        if run.status == RunStatus::Running && finish_interrupted(step, &checkpoint) {
            warn!(run_id, step = step_name, "Completing run whose final step was already recorded");
            return self.finish_run(&run, step, &checkpoint).await;
        }
        if step.human_gate.is_some() {
            return Err(EngineError::GatePending {
                run_id: run.id,
                step: step.name.clone(),
            });
        }
        if run.status != RunStatus::Running {
            return Err(EngineError::RunNotActive {
                run_id: run.id,
                status: run.status,
            });
        }

        checkpoint.merge_data(completion.data);
        if let Some(version_id) = &completion.output_version_id {
            self.store.link_output_version(&run.id, version_id).await?;
        }

        self.verify_postconditions(&run, &mut checkpoint, step, &completion.result)
            .await?;

        let resolution = match &step.next {
            Some(Transition::Unconditional(target)) => Resolution::Advance(target.clone()),
            Some(Transition::Terminal) => Resolution::Finish,
            Some(Transition::Conditional(branch)) => {
                let passed = branch.predicate.test_result(&completion.result).map_err(|e| {
                    EngineError::Predicate {
                        run_id: run.id.clone(),
                        step: step.name.clone(),
                        source: e,
                    }
                })?;

                if passed {
                    Resolution::Advance(branch.on_true.clone())
                } else if checkpoint.iteration_count(&step.name) < branch.max_iterations {
                    let count = checkpoint.increment_iteration(&step.name);
                    info!(
                        run_id = %run.id,
                        step = %step.name,
                        count,
                        max_iterations = branch.max_iterations,
                        "Predicate false, looping back to {}",
                        branch.on_false
                    );
                    Resolution::Advance(branch.on_false.clone())
                } else {
                    self.escalate_iterations(&run, &mut checkpoint, step, branch.max_iterations)
                        .await?;
                    return Err(EngineError::IterationLimitExceeded {
                        run_id: run.id.clone(),
                        step: step.name.clone(),
                        count: checkpoint.iteration_count(&step.name),
                        max_iterations: branch.max_iterations,
                    });
                }
            }
            None => {
                return Err(EngineError::GatePending {
                    run_id: run.id,
                    step: step.name.clone(),
                })
            }
        };

        self.advance(&definition, &run, &mut checkpoint, step, completion.result, resolution)
            .await
    }

    /// Answer the human gate at the current step with one of its labels.
    pub async fn answer_gate(
        &self,
        run_id: &str,
        option_label: &str,
        input: Option<String>,
    ) -> EngineResult<StepReport> {
        let (run, definition, mut checkpoint) = self.load(run_id).await?;
        let step = self.current_step(&definition, &checkpoint)?;

        let gate = step.human_gate.as_ref().ok_or_else(|| EngineError::NoHumanGate {
            run_id: run.id.clone(),
            step: step.name.clone(),
        })?;
        if run.status != RunStatus::Paused {
            return Err(EngineError::RunNotActive {
                run_id: run.id,
                status: run.status,
            });
        }

        let option = gate
            .option(option_label)
            .ok_or_else(|| EngineError::InvalidGateOption {
                run_id: run.id.clone(),
                step: step.name.clone(),
                option: option_label.to_string(),
                valid: gate.labels(),
            })?;

        let input = input.filter(|text| !text.trim().is_empty());
        if option.requires_input && input.is_none() {
            return Err(EngineError::GateInputRequired {
                run_id: run.id,
                step: step.name.clone(),
                option: option.label.clone(),
            });
        }

        checkpoint.record_gate_decision(&step.name, &option.label, input.clone());
        let decision = json!({ "option": option.label, "input": input });

        self.verify_postconditions(&run, &mut checkpoint, step, &decision)
            .await?;

        let run = self.store.update_status(&run.id, RunStatus::Running).await?;
        self.store
            .emit(
                NewEvent::new(&run.id, EventType::Resumed)
                    .with_agent(&step.name)
                    .with_data(decision.clone()),
            )
            .await?;
        info!(run_id = %run.id, step = %step.name, option = %option.label, "Human gate answered");

        let resolution = match &option.next_step {
            Some(target) => Resolution::Advance(target.clone()),
            None => Resolution::Finish,
        };
        self.advance(&definition, &run, &mut checkpoint, step, decision, resolution)
            .await
    }

    pub async fn pause(&self, run_id: &str) -> EngineResult<WorkflowRun> {
        let before = self.require_run(run_id).await?;
        let run = self.store.update_status(run_id, RunStatus::Paused).await?;
        if before.status != run.status {
            let mut event = NewEvent::new(run_id, EventType::Paused);
            if let Some(step) = &run.current_step {
                event = event.with_agent(step);
            }
            self.store.emit(event).await?;
            info!(run_id, "Paused workflow run");
        }
        Ok(run)
    }

    /// Continue a paused run from its checkpoint.
    ///
    /// A run waiting on an unanswered gate is left untouched and the gate is
    /// reported again. Otherwise any retry marker is cleared and the current
    /// step is entered afresh.
    pub async fn resume(&self, run_id: &str) -> EngineResult<StepReport> {
        let (run, definition, mut checkpoint) = self.load(run_id).await?;
        let step = self.current_step(&definition, &checkpoint)?;

        if run.status == RunStatus::Paused && checkpoint.gate_decision.is_none() {
            if let Some(gate) = &step.human_gate {
                let outcome = StepOutcome::AwaitingHuman(gate_prompt(step, gate, &checkpoint));
                return self.report(&run.id, &checkpoint, outcome).await;
            }
        }

        let was_paused = run.status == RunStatus::Paused;
        let run = self.store.update_status(&run.id, RunStatus::Running).await?;

        checkpoint.clear_pending_retry();
        self.store.save_checkpoint(&checkpoint).await?;
        if was_paused {
            self.store
                .emit(NewEvent::new(&run.id, EventType::Resumed).with_agent(&step.name))
                .await?;
            info!(run_id = %run.id, step = %step.name, "Resumed workflow run");
        }

        let outcome = self.enter_step(&definition, &run, &mut checkpoint).await?;
        self.report(&run.id, &checkpoint, outcome).await
    }

    /// Force a running or paused run to `failed`. Completed steps stay done.
    pub async fn cancel(&self, run_id: &str) -> EngineResult<WorkflowRun> {
        let run = self.store.update_status(run_id, RunStatus::Failed).await?;
        self.store.set_current_agent(run_id, None).await?;
        warn!(run_id, "Cancelled workflow run");
        self.require_run(&run.id).await
    }

    pub async fn status(&self, run_id: &str) -> EngineResult<RunSummary> {
        let run = self.require_run(run_id).await?;
        let checkpoint = self.store.load_checkpoint(run_id).await?;

        let gate = match (&checkpoint, self.registry.get(&run.workflow_type)) {
            (Some(cp), Some(definition)) if run.status == RunStatus::Paused => definition
                .step(&cp.current_step)
                .and_then(|step| {
                    let gate = step.human_gate.as_ref()?;
                    cp.gate_decision
                        .is_none()
                        .then(|| gate_prompt(step, gate, cp))
                }),
            _ => None,
        };
        let escalations = self.store.escalations_for_run(run_id).await?;

        Ok(RunSummary {
            is_terminal: run.status.is_terminal(),
            valid_transitions: run.status.valid_transitions(),
            iteration_counts: checkpoint
                .as_ref()
                .map(|cp| cp.iteration_counts.clone())
                .unwrap_or_default(),
            resume: checkpoint.as_ref().map(Checkpoint::resume_context),
            gate,
            escalations,
            run,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn require_run(&self, run_id: &str) -> EngineResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    async fn load(
        &self,
        run_id: &str,
    ) -> EngineResult<(WorkflowRun, Arc<WorkflowDefinition>, Checkpoint)> {
        let run = self.require_run(run_id).await?;
        let definition = self
            .registry
            .get(&run.workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflow(run.workflow_type.clone()))?;
        let checkpoint = self
            .store
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(run_id.to_string()))?;
        Ok((run, definition, checkpoint))
    }

    fn current_step<'d>(
        &self,
        definition: &'d WorkflowDefinition,
        checkpoint: &Checkpoint,
    ) -> EngineResult<&'d WorkflowStep> {
        definition
            .step(&checkpoint.current_step)
            .ok_or_else(|| EngineError::StepNotFound {
                run_id: checkpoint.workflow_run_id.clone(),
                step: checkpoint.current_step.clone(),
            })
    }

    async fn report(
        &self,
        run_id: &str,
        checkpoint: &Checkpoint,
        outcome: StepOutcome,
    ) -> EngineResult<StepReport> {
        let run = self.require_run(run_id).await?;
        Ok(StepReport {
            run_id: run.id,
            status: run.status,
            current_step: checkpoint.current_step.clone(),
            outcome,
        })
    }

    /// First condition in `conditions` that does not hold.
    async fn first_failing<'c>(
        &self,
        conditions: &'c [Condition],
        ctx: &ConditionContext<'_>,
    ) -> EngineResult<Option<&'c Condition>> {
        for condition in conditions {
            if !condition.evaluate(ctx).await? {
                return Ok(Some(condition));
            }
        }
        Ok(None)
    }

    async fn check_preconditions(
        &self,
        run: &WorkflowRun,
        checkpoint: &Checkpoint,
        step: &WorkflowStep,
    ) -> EngineResult<()> {
        let ctx = ConditionContext {
            run,
            checkpoint,
            result: None,
            db: &*self.store,
            base_dir: &self.base_dir,
        };
        if let Some(failed) = self.first_failing(&step.preconditions, &ctx).await? {
            warn!(
                run_id = %run.id,
                step = %step.name,
                condition = failed.name(),
                "Precondition failed"
            );
            return Err(EngineError::PreconditionFailed {
                run_id: run.id.clone(),
                step: step.name.clone(),
                condition: failed.name().to_string(),
                message: failed.error().to_string(),
            });
        }
        Ok(())
    }

    /// Check postconditions against `result`. On failure the retry marker is
    /// persisted and the run escalates once the retry budget is spent.
    async fn verify_postconditions(
        &self,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &WorkflowStep,
        result: &Value,
    ) -> EngineResult<()> {
        let failed = {
            let ctx = ConditionContext {
                run,
                checkpoint,
                result: Some(result),
                db: &*self.store,
                base_dir: &self.base_dir,
            };
            self.first_failing(&step.postconditions, &ctx).await?
        };
        let Some(failed) = failed else {
            return Ok(());
        };

        let attempt = checkpoint.next_attempt(&step.name);
        checkpoint.record_pending_retry(&step.name, failed.error(), attempt);
        self.store.save_checkpoint(checkpoint).await?;
        self.store
            .emit(
                NewEvent::new(&run.id, EventType::Rejected)
                    .with_agent(&step.name)
                    .with_data(json!({
                        "condition": failed.name(),
                        "error": failed.error(),
                        "attempt": attempt,
                    })),
            )
            .await?;
        warn!(
            run_id = %run.id,
            step = %step.name,
            condition = failed.name(),
            attempt,
            "Postcondition failed"
        );

        if attempt > self.max_step_retries {
            self.store.update_status(&run.id, RunStatus::Paused).await?;
            let reason = format!(
                "Postcondition {} failed {} times: {}",
                failed.name(),
                attempt,
                failed.error()
            );
            let escalation = self
                .open_escalation(run, step, EscalationKind::RetriesExhausted, attempt, reason)
                .await?;
            self.store
                .emit(
                    NewEvent::new(&run.id, EventType::Escalated)
                        .with_agent(&step.name)
                        .with_data(json!({
                            "reason": EscalationKind::RetriesExhausted.as_str(),
                            "condition": failed.name(),
                            "attempts": attempt,
                            "escalationId": escalation.id,
                            "escalatedTo": escalation.escalated_to,
                        })),
                )
                .await?;
            warn!(
                run_id = %run.id,
                step = %step.name,
                attempts = attempt,
                escalation_id = %escalation.id,
                "Escalated for human attention"
            );
            return Err(EngineError::RetriesExhausted {
                run_id: run.id.clone(),
                step: step.name.clone(),
                attempts: attempt,
                message: failed.error().to_string(),
            });
        }

        Err(EngineError::PostconditionFailed {
            run_id: run.id.clone(),
            step: step.name.clone(),
            condition: failed.name().to_string(),
            message: failed.error().to_string(),
            attempt,
        })
    }

    /// The loop budget of a conditional transition is spent: pause the run
    /// at the same step instead of looping again. The count stays at the cap.
    async fn escalate_iterations(
        &self,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &WorkflowStep,
        max_iterations: u32,
    ) -> EngineResult<()> {
        let count = checkpoint.iteration_count(&step.name);
        let message = format!(
            "Exceeded {} iterations of the {} loop",
            max_iterations, step.name
        );
        checkpoint.record_pending_retry(&step.name, &message, count + 1);

        self.store.save_checkpoint(checkpoint).await?;
        self.store.update_status(&run.id, RunStatus::Paused).await?;
        let escalation = self
            .open_escalation(run, step, EscalationKind::MaxIterations, count, message)
            .await?;
        self.store
            .emit(
                NewEvent::new(&run.id, EventType::Escalated)
                    .with_agent(&step.name)
                    .with_data(json!({
                        "reason": EscalationKind::MaxIterations.as_str(),
                        "count": count,
                        "maxIterations": max_iterations,
                        "escalationId": escalation.id,
                        "escalatedTo": escalation.escalated_to,
                    })),
            )
            .await?;

        warn!(
            run_id = %run.id,
            step = %step.name,
            count,
            max_iterations,
            escalation_id = %escalation.id,
            "Iteration limit reached, escalating"
        );
        Ok(())
    }

    async fn open_escalation(
        &self,
        run: &WorkflowRun,
        step: &WorkflowStep,
        kind: EscalationKind,
        attempts: u32,
        reason: String,
    ) -> EngineResult<Escalation> {
        let escalation = self
            .store
            .create_escalation(NewEscalation {
                run_id: run.id.clone(),
                step: step.name.clone(),
                kind,
                attempts,
                escalated_to: self.escalation_target.clone(),
                reason,
            })
            .await?;
        Ok(escalation)
    }

    /// Record `step` as done and move to the resolved target.
    async fn advance(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &WorkflowStep,
        result: Value,
        resolution: Resolution,
    ) -> EngineResult<StepReport> {
        checkpoint.record_step_completion(&step.name, result);

        match resolution {
            Resolution::Advance(target) => {
                checkpoint.set_current_step(&target);
                self.store.save_checkpoint(checkpoint).await?;
                self.store
                    .emit(
                        NewEvent::new(&run.id, EventType::Completed)
                            .with_agent(&step.name)
                            .with_data(json!({ "next": target })),
                    )
                    .await?;
                info!(run_id = %run.id, from = %step.name, to = %target, "Advanced workflow");

                let run = self.require_run(&run.id).await?;
                let outcome = self.enter_step(definition, &run, checkpoint).await?;
                self.report(&run.id, checkpoint, outcome).await
            }
            Resolution::Finish => {
                self.store.save_checkpoint(checkpoint).await?;
                self.finish_run(run, step, checkpoint).await
            }
        }
    }

    /// Mark the run completed after its final step was checkpointed. The
    /// `completed` event is skipped when it was already emitted.
    async fn finish_run(
        &self,
        run: &WorkflowRun,
        step: &WorkflowStep,
        checkpoint: &Checkpoint,
    ) -> EngineResult<StepReport> {
        let announced = self.store.latest_event(&run.id).await?.is_some_and(|event| {
            event.event_type == EventType::Completed
                && event.agent_name.as_deref() == Some(step.name.as_str())
        });
        if !announced {
            self.store
                .emit(
                    NewEvent::new(&run.id, EventType::Completed)
                        .with_agent(&step.name)
                        .with_data(json!({ "next": Value::Null })),
                )
                .await?;
        }
        self.store.update_status(&run.id, RunStatus::Completed).await?;
        self.store.set_current_agent(&run.id, None).await?;
        info!(run_id = %run.id, step = %step.name, "Workflow run completed");
        self.report(&run.id, checkpoint, StepOutcome::Completed).await
    }

    /// Check preconditions of the checkpoint's current step and announce it.
    /// Gated steps suspend the run.
    async fn enter_step(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
    ) -> EngineResult<StepOutcome> {
        let step = self.current_step(definition, checkpoint)?;
        self.check_preconditions(run, checkpoint, step).await?;
        self.store.set_current_agent(&run.id, Some(&step.name)).await?;

        match &step.human_gate {
            Some(gate) => {
                checkpoint.clear_gate_decision();
                self.store.save_checkpoint(checkpoint).await?;
                self.store.update_status(&run.id, RunStatus::Paused).await?;
                self.store
                    .emit(
                        NewEvent::new(&run.id, EventType::Paused)
                            .with_agent(&step.name)
                            .with_data(json!({ "gate": gate.prompt })),
                    )
                    .await?;
                info!(run_id = %run.id, step = %step.name, "Waiting for human decision");
                Ok(StepOutcome::AwaitingHuman(gate_prompt(step, gate, checkpoint)))
            }
            None => {
                self.store
                    .emit(NewEvent::new(&run.id, EventType::Started).with_agent(&step.name))
                    .await?;
                Ok(StepOutcome::Ready {
                    step: step.name.clone(),
                    command: step.command.clone(),
                    retry: checkpoint.pending_retry.clone(),
                })
            }
        }
    }
}

/// The step ends the run and is already the last recorded completion, so only
/// the status change is missing.
fn finish_interrupted(step: &WorkflowStep, checkpoint: &Checkpoint) -> bool {
    if checkpoint.completed_steps.last() != Some(&step.name) {
        return false;
    }
    match (&step.next, &step.human_gate) {
        (Some(Transition::Terminal), _) => true,
        (_, Some(gate)) => checkpoint
            .gate_decision
            .as_ref()
            .filter(|decision| decision.gate == step.name)
            .and_then(|decision| gate.option(&decision.option))
            .is_some_and(|option| option.next_step.is_none()),
        _ => false,
    }
}

fn gate_prompt(step: &WorkflowStep, gate: &HumanGate, checkpoint: &Checkpoint) -> GatePrompt {
    let context = gate
        .context
        .iter()
        .map(|key| {
            let value = checkpoint.lookup(key).cloned().unwrap_or(Value::Null);
            (key.clone(), value)
        })
        .collect();
    GatePrompt {
        step: step.name.clone(),
        prompt: gate.prompt.clone(),
        context,
        options: gate.options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{define_workflow, HumanGate, WorkflowSpec};
    use crate::state_store::SqliteStore;
    use crate::traits::{
        CheckpointStore, EscalationStore, EventEmitter, RunRepository, SequentialIdGenerator,
    };

    fn has_key(key: &'static str) -> Condition {
        Condition::from_fn(key, format!("{} missing", key), move |ctx| {
            ctx.checkpoint.get_data(key).is_some()
        })
    }

    fn loop_workflow() -> WorkflowDefinition {
        define_workflow(WorkflowSpec {
            workflow_type: "loop".to_string(),
            name: "Loop".to_string(),
            description: None,
            initial_step: "draft".to_string(),
            steps: vec![
                WorkflowStep::new("draft", "make-draft")
                    .with_postcondition(has_key("draft"))
                    .with_next(Transition::to("review")),
                WorkflowStep::new("review", "review-draft")
                    .with_precondition(has_key("draft"))
                    .with_next(
                        Transition::conditional("result.approved == true", "gate", "draft", 2)
                            .unwrap(),
                    ),
                WorkflowStep::new("gate", "ask-human").with_gate(HumanGate {
                    prompt: "Ship?".to_string(),
                    context: vec!["draft".to_string()],
                    options: vec![
                        GateOption::to("Ship", "publish"),
                        GateOption::to("Redo", "draft").requiring_input(),
                        GateOption::end("Drop"),
                    ],
                }),
                WorkflowStep::new("publish", "publish").with_next(Transition::Terminal),
            ],
        })
        .unwrap()
    }

    /// `a` leads straight to `b`, which may only start once `flag` is set.
    fn flagged_workflow() -> WorkflowDefinition {
        define_workflow(WorkflowSpec {
            workflow_type: "flagged".to_string(),
            name: "Flagged".to_string(),
            description: None,
            initial_step: "a".to_string(),
            steps: vec![
                WorkflowStep::new("a", "do-a").with_next(Transition::to("b")),
                WorkflowStep::new("b", "do-b")
                    .with_precondition(has_key("flag"))
                    .with_next(Transition::Terminal),
            ],
        })
        .unwrap()
    }

    async fn runner() -> StepRunner<SqliteStore> {
        let store = SqliteStore::in_memory()
            .await
            .unwrap()
            .with_ids(Arc::new(SequentialIdGenerator::default()));
        let mut registry = WorkflowRegistry::new();
        registry.register(loop_workflow()).unwrap();
        registry.register(flagged_workflow()).unwrap();
        StepRunner::new(Arc::new(store), Arc::new(registry))
    }

    async fn event_trail(runner: &StepRunner<SqliteStore>, run_id: &str) -> Vec<String> {
        runner
            .store()
            .events_for_run(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| format!("{}:{}", e.event_type, e.agent_name.unwrap_or_default()))
            .collect()
    }

    /// Drive the loop workflow to its gate.
    async fn run_to_gate(runner: &StepRunner<SqliteStore>) -> String {
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        runner
            .report_step(&run_id, "review", StepCompletion::new(json!({"approved": true})))
            .await
            .unwrap();
        run_id
    }

    fn draft_done() -> StepCompletion {
        StepCompletion::new(json!({})).with_data("draft", json!("draft.md"))
    }

    #[tokio::test]
    async fn test_start_enters_initial_step() {
        let runner = runner().await;
        let report = runner.start("loop", "book-1", None).await.unwrap();

        assert_eq!(report.status, RunStatus::Running);
        assert_eq!(report.current_step, "draft");
        assert_eq!(
            report.outcome,
            StepOutcome::Ready {
                step: "draft".to_string(),
                command: "make-draft".to_string(),
                retry: None
            }
        );

        let run = runner.store().get_run(&report.run_id).await.unwrap().unwrap();
        assert_eq!(run.current_agent.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let runner = runner().await;
        assert!(matches!(
            runner.start("nope", "book-1", None).await,
            Err(EngineError::UnknownWorkflow(t)) if t == "nope"
        ));
    }

    #[tokio::test]
    async fn test_report_advances_and_is_idempotent() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;

        let report = runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        assert_eq!(report.current_step, "review");

        let again = runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        assert_eq!(
            again.outcome,
            StepOutcome::AlreadyAdvanced {
                step: "draft".to_string()
            }
        );
        assert_eq!(again.current_step, "review");

        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.completed_steps, vec!["draft"]);
    }

    #[tokio::test]
    async fn test_out_of_order_report_rejected() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        assert!(matches!(
            runner.report_step(&run_id, "review", StepCompletion::default()).await,
            Err(EngineError::StepOutOfOrder { current, .. }) if current == "draft"
        ));
    }

    #[tokio::test]
    async fn test_postcondition_failure_then_escalation() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;

        let first = runner
            .report_step(&run_id, "draft", StepCompletion::default())
            .await;
        assert!(matches!(
            first,
            Err(EngineError::PostconditionFailed { attempt: 1, .. })
        ));
        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.current_step, "draft");
        assert_eq!(cp.pending_retry.as_ref().unwrap().attempt, 1);

        let second = runner
            .report_step(&run_id, "draft", StepCompletion::default())
            .await;
        assert!(matches!(
            second,
            Err(EngineError::RetriesExhausted { attempts: 2, .. })
        ));
        let run = runner.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        let latest = runner.store().latest_event(&run_id).await.unwrap().unwrap();
        assert_eq!(latest.event_type, EventType::Escalated);
        let escalations = runner.store().escalations_for_run(&run_id).await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, EscalationKind::RetriesExhausted);
        assert_eq!(escalations[0].attempts, 2);
        assert_eq!(
            latest.data.unwrap()["escalationId"],
            json!(escalations[0].id)
        );

        // Resume clears the retry marker and the step can succeed.
        let resumed = runner.resume(&run_id).await.unwrap();
        assert!(matches!(resumed.outcome, StepOutcome::Ready { retry: None, .. }));
        let report = runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        assert_eq!(report.current_step, "review");
    }

    #[tokio::test]
    async fn test_precondition_failure_leaves_state() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        runner.report_step(&run_id, "draft", draft_done()).await.unwrap();

        // Drop the key the review step needs and re-check.
        let mut cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        cp.data.remove("draft");
        runner.store().save_checkpoint(&cp).await.unwrap();

        match runner.prepare(&run_id).await {
            Err(EngineError::PreconditionFailed {
                step, condition, ..
            }) => {
                assert_eq!(step, "review");
                assert_eq!(condition, "draft");
            }
            other => panic!("expected precondition failure, got {:?}", other),
        }
        let after = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(after, cp);
        let run = runner.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_iteration_bound_escalates() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        let rejected = || StepCompletion::new(json!({"approved": false}));

        for expected in 1..=2u32 {
            runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
            let report = runner.report_step(&run_id, "review", rejected()).await.unwrap();
            assert_eq!(report.current_step, "draft");
            let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
            assert_eq!(cp.iteration_count("review"), expected);
        }

        runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        match runner.report_step(&run_id, "review", rejected()).await {
            Err(EngineError::IterationLimitExceeded {
                count,
                max_iterations,
                ..
            }) => {
                assert_eq!(count, 2);
                assert_eq!(max_iterations, 2);
            }
            other => panic!("expected escalation, got {:?}", other),
        }

        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.current_step, "review");
        assert_eq!(cp.iteration_count("review"), 2);
        assert!(cp.pending_retry.is_some());
        let summary = runner.status(&run_id).await.unwrap();
        assert_eq!(summary.run.status, RunStatus::Paused);
        assert_eq!(summary.escalations.len(), 1);
        assert_eq!(summary.escalations[0].kind, EscalationKind::MaxIterations);
        assert_eq!(summary.escalations[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_escalation_target_is_configurable() {
        let runner = runner().await.with_escalation_target("senior-editor");
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        for _ in 0..2 {
            let _ = runner
                .report_step(&run_id, "draft", StepCompletion::default())
                .await;
        }
        let pending = runner.store().pending_escalations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].escalated_to, "senior-editor");
    }

    #[tokio::test]
    async fn test_prepare_enters_step_blocked_on_arrival() {
        let runner = runner().await;
        let run_id = runner.start("flagged", "book-1", None).await.unwrap().run_id;

        match runner.report_step(&run_id, "a", StepCompletion::default()).await {
            Err(EngineError::PreconditionFailed { step, .. }) => assert_eq!(step, "b"),
            other => panic!("expected precondition failure, got {:?}", other),
        }
        let run = runner.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.current_agent.as_deref(), Some("a"));

        let mut cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        cp.set_data("flag", json!(true));
        runner.store().save_checkpoint(&cp).await.unwrap();

        let report = runner.prepare(&run_id).await.unwrap();
        assert_eq!(
            report.outcome,
            StepOutcome::Ready {
                step: "b".to_string(),
                command: "do-b".to_string(),
                retry: None
            }
        );
        let run = runner.store().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.current_agent.as_deref(), Some("b"));
        assert_eq!(
            event_trail(&runner, &run_id).await,
            vec!["started:a", "completed:a", "started:b"]
        );

        // A second look announces nothing new.
        runner.prepare(&run_id).await.unwrap();
        assert_eq!(event_trail(&runner, &run_id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_rereport_after_interrupted_finish() {
        let runner = runner().await;
        let run_id = run_to_gate(&runner).await;
        runner.answer_gate(&run_id, "Ship", None).await.unwrap();

        // The final step was checkpointed but the status never changed.
        let mut cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        cp.record_step_completion("publish", json!({}));
        runner.store().save_checkpoint(&cp).await.unwrap();

        let done = runner
            .report_step(&run_id, "publish", StepCompletion::default())
            .await
            .unwrap();
        assert_eq!(done.outcome, StepOutcome::Completed);
        assert_eq!(done.status, RunStatus::Completed);

        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.completed_steps, vec!["draft", "review", "gate", "publish"]);
        let trail = event_trail(&runner, &run_id).await;
        assert_eq!(trail.iter().filter(|e| *e == "completed:publish").count(), 1);

        let again = runner
            .report_step(&run_id, "publish", StepCompletion::default())
            .await
            .unwrap();
        assert!(matches!(again.outcome, StepOutcome::AlreadyAdvanced { .. }));
    }

    #[tokio::test]
    async fn test_rereport_after_interrupted_gate_finish() {
        let runner = runner().await;
        let run_id = run_to_gate(&runner).await;

        // "Drop" ends the run; the crash hit after the event, before the status.
        let mut cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        cp.record_gate_decision("gate", "Drop", None);
        cp.record_step_completion("gate", json!({"option": "Drop", "input": null}));
        runner.store().save_checkpoint(&cp).await.unwrap();
        runner
            .store()
            .update_status(&run_id, RunStatus::Running)
            .await
            .unwrap();
        runner
            .store()
            .emit(NewEvent::new(&run_id, EventType::Completed).with_agent("gate"))
            .await
            .unwrap();

        let done = runner
            .report_step(&run_id, "gate", StepCompletion::default())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.completed_steps.iter().filter(|s| *s == "gate").count(), 1);
        let trail = event_trail(&runner, &run_id).await;
        assert_eq!(trail.iter().filter(|e| *e == "completed:gate").count(), 1);
    }

    #[tokio::test]
    async fn test_gate_flow() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        runner.report_step(&run_id, "draft", draft_done()).await.unwrap();

        let report = runner
            .report_step(&run_id, "review", StepCompletion::new(json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Paused);
        match &report.outcome {
            StepOutcome::AwaitingHuman(prompt) => {
                assert_eq!(prompt.step, "gate");
                assert_eq!(prompt.context["draft"], json!("draft.md"));
                assert_eq!(prompt.options.len(), 3);
            }
            other => panic!("expected gate, got {:?}", other),
        }

        // Resuming an unanswered gate changes nothing.
        let resumed = runner.resume(&run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Paused);
        assert!(matches!(resumed.outcome, StepOutcome::AwaitingHuman(_)));

        assert!(matches!(
            runner.report_step(&run_id, "gate", StepCompletion::default()).await,
            Err(EngineError::GatePending { .. })
        ));
        assert!(matches!(
            runner.answer_gate(&run_id, "Maybe", None).await,
            Err(EngineError::InvalidGateOption { .. })
        ));
        assert!(matches!(
            runner.answer_gate(&run_id, "Redo", Some("  ".to_string())).await,
            Err(EngineError::GateInputRequired { .. })
        ));

        let report = runner.answer_gate(&run_id, "Ship", None).await.unwrap();
        assert_eq!(report.current_step, "publish");
        assert_eq!(report.status, RunStatus::Running);

        let done = runner
            .report_step(&run_id, "publish", StepCompletion::default())
            .await
            .unwrap();
        assert_eq!(done.outcome, StepOutcome::Completed);
        assert_eq!(done.status, RunStatus::Completed);

        let cp = runner.store().load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(cp.completed_steps, vec!["draft", "review", "gate", "publish"]);
        assert_eq!(cp.gate_decision.as_ref().unwrap().option, "Ship");
    }

    #[tokio::test]
    async fn test_terminal_gate_option_completes_run() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;
        runner.report_step(&run_id, "draft", draft_done()).await.unwrap();
        runner
            .report_step(&run_id, "review", StepCompletion::new(json!({"approved": true})))
            .await
            .unwrap();

        let report = runner.answer_gate(&run_id, "Drop", None).await.unwrap();
        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_lifecycle_commands() {
        let runner = runner().await;
        let run_id = runner.start("loop", "book-1", None).await.unwrap().run_id;

        let paused = runner.pause(&run_id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert!(matches!(
            runner.report_step(&run_id, "draft", draft_done()).await,
            Err(EngineError::RunNotActive { status: RunStatus::Paused, .. })
        ));

        let resumed = runner.resume(&run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Running);

        let cancelled = runner.cancel(&run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Failed);
        assert!(cancelled.current_agent.is_none());

        let err = runner.resume(&run_id).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(runner.pause(&run_id).await.unwrap_err().is_invalid_transition());

        let kinds: Vec<EventType> = runner
            .store()
            .events_for_run(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::Started,
                EventType::Paused,
                EventType::Resumed,
                EventType::Started
            ]
        );
    }
}
