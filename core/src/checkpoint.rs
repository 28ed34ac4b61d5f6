//! Durable execution state of a single workflow run.
//!
//! A [`Checkpoint`] is serialized to JSON and written in one statement after
//! every mutation. Helpers here only change the in-memory value; persisting
//! is the caller's job (see [`crate::traits::CheckpointStore`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Marker that the current step failed verification and is being retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetry {
    pub step: String,
    pub error: String,
    pub attempt: u32,
}

/// A human's answer to a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub gate: String,
    pub option: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

/// Outcome recorded for a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub completed_at: DateTime<Utc>,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelItemStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelItemResult {
    pub status: ParallelItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Summary of multi-item bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub workflow_run_id: String,
    pub workflow_type: String,
    pub current_step: String,
    /// Append-only; a step revisited through a loop appears once per pass.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Latest result per step name.
    #[serde(default)]
    pub step_results: BTreeMap<String, StepRecord>,
    #[serde(default)]
    pub iteration_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_retry: Option<PendingRetry>,
    /// Reserved for multi-item steps; no runner operation writes it yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_results: Option<BTreeMap<String, ParallelItemResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_decision: Option<GateDecision>,
}

/// Everything a caller needs to pick a run back up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeContext {
    pub workflow_type: String,
    pub run_id: String,
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub last_step_output: Option<Value>,
    pub pending_retry: Option<PendingRetry>,
    pub parallel_status: Option<ParallelStatus>,
}

/// Fresh checkpoint positioned at `initial_step` with no history.
pub fn create_checkpoint(run_id: &str, workflow_type: &str, initial_step: &str) -> Checkpoint {
    Checkpoint {
        workflow_run_id: run_id.to_string(),
        workflow_type: workflow_type.to_string(),
        current_step: initial_step.to_string(),
        completed_steps: Vec::new(),
        step_results: BTreeMap::new(),
        iteration_counts: BTreeMap::new(),
        data: Map::new(),
        pending_retry: None,
        parallel_results: None,
        gate_decision: None,
    }
}

impl Checkpoint {
    /// Record a finished step and clear any retry marker.
    pub fn record_step_completion(&mut self, step: &str, result: Value) {
        self.completed_steps.push(step.to_string());
        self.step_results.insert(
            step.to_string(),
            StepRecord {
                completed_at: Utc::now(),
                result,
            },
        );
        self.pending_retry = None;
    }

    pub fn set_current_step(&mut self, step: &str) {
        self.current_step = step.to_string();
    }

    pub fn iteration_count(&self, step: &str) -> u32 {
        self.iteration_counts.get(step).copied().unwrap_or(0)
    }

    /// Bump the loop counter for `step`, returning the new value.
    pub fn increment_iteration(&mut self, step: &str) -> u32 {
        let count = self.iteration_counts.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Attempt number the next failure of `step` would be recorded as.
    pub fn next_attempt(&self, step: &str) -> u32 {
        match &self.pending_retry {
            Some(retry) if retry.step == step => retry.attempt + 1,
            _ => 1,
        }
    }

    pub fn record_pending_retry(&mut self, step: &str, error: &str, attempt: u32) {
        self.pending_retry = Some(PendingRetry {
            step: step.to_string(),
            error: error.to_string(),
            attempt,
        });
    }

    pub fn clear_pending_retry(&mut self) {
        self.pending_retry = None;
    }

    pub fn record_gate_decision(&mut self, gate: &str, option: &str, input: Option<String>) {
        self.gate_decision = Some(GateDecision {
            gate: gate.to_string(),
            option: option.to_string(),
            input,
        });
    }

    pub fn clear_gate_decision(&mut self) {
        self.gate_decision = None;
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Merge a map of values into `data`, overwriting existing keys.
    pub fn merge_data(&mut self, values: Map<String, Value>) {
        self.data.extend(values);
    }

    pub fn step_result(&self, step: &str) -> Option<&Value> {
        self.step_results.get(step).map(|r| &r.result)
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Result of the most recently completed step.
    pub fn last_result(&self) -> Option<&Value> {
        self.completed_steps
            .last()
            .and_then(|step| self.step_result(step))
    }

    pub fn initialize_parallel_results(&mut self, items: &[String]) {
        let results = items
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    ParallelItemResult {
                        status: ParallelItemStatus::Pending,
                        result: None,
                        error: None,
                        retry_count: 0,
                    },
                )
            })
            .collect();
        self.parallel_results = Some(results);
    }

    /// Returns false when no parallel tracking has been initialized.
    pub fn record_parallel_completion(&mut self, item: &str, result: Value) -> bool {
        let Some(results) = self.parallel_results.as_mut() else {
            return false;
        };
        let retry_count = results.get(item).map_or(0, |r| r.retry_count);
        results.insert(
            item.to_string(),
            ParallelItemResult {
                status: ParallelItemStatus::Completed,
                result: Some(result),
                error: None,
                retry_count,
            },
        );
        true
    }

    /// Returns false when no parallel tracking has been initialized.
    pub fn record_parallel_failure(&mut self, item: &str, error: &str) -> bool {
        let Some(results) = self.parallel_results.as_mut() else {
            return false;
        };
        let retry_count = results.get(item).map_or(0, |r| r.retry_count) + 1;
        results.insert(
            item.to_string(),
            ParallelItemResult {
                status: ParallelItemStatus::Failed,
                result: None,
                error: Some(error.to_string()),
                retry_count,
            },
        );
        true
    }

    pub fn parallel_status(&self) -> Option<ParallelStatus> {
        let results = self.parallel_results.as_ref()?;
        let keys_with = |status: ParallelItemStatus| -> Vec<String> {
            results
                .iter()
                .filter(|(_, r)| r.status == status)
                .map(|(k, _)| k.clone())
                .collect()
        };
        Some(ParallelStatus {
            total: results.len(),
            completed: keys_with(ParallelItemStatus::Completed).len(),
            failed: keys_with(ParallelItemStatus::Failed),
            pending: keys_with(ParallelItemStatus::Pending),
        })
    }

    pub fn clear_parallel_results(&mut self) {
        self.parallel_results = None;
    }

    /// Resolve a dotted key against `data`, then against step results in
    /// completion order.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        let parts: Vec<&str> = key.split('.').collect();
        if let Some(v) = traverse(self.data.get(parts[0]), &parts[1..]) {
            return Some(v);
        }
        self.completed_steps.iter().find_map(|step| {
            let result = self.step_result(step)?;
            traverse(Some(result), &parts)
        })
    }

    pub fn resume_context(&self) -> ResumeContext {
        ResumeContext {
            workflow_type: self.workflow_type.clone(),
            run_id: self.workflow_run_id.clone(),
            current_step: self.current_step.clone(),
            completed_steps: self.completed_steps.clone(),
            last_step_output: self.last_result().cloned(),
            pending_retry: self.pending_retry.clone(),
            parallel_status: self.parallel_status(),
        }
    }
}

fn traverse<'a>(root: Option<&'a Value>, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root?, |value, part| match value {
        Value::Object(map) => map.get(*part),
        Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get(i)),
        _ => None,
    })
}
