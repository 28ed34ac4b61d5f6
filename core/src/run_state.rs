//! Run lifecycle state machine.
//!
//! Guards the coarse status of a workflow run independently of which step
//! the run is on:
//!
//! ```text
//! pending ──► running ◄──► paused
//!               │  │          │
//!               │  └──► failed ◄┘
//!               ▼
//!           completed
//! ```
//!
//! `completed` and `failed` are terminal. Repositories must call
//! [`RunStatus::transition_to`] before persisting a new status.

use crate::errors::InvalidTransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not yet started
    Pending,

    /// Actively stepping
    Running,

    /// Waiting on a human (gate, escalation, or explicit pause)
    Paused,

    /// Reached a terminal step
    Completed,

    /// Cancelled or failed
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Check if this status allows a transition to another status
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        match (self, &target) {
            // From Pending
            (RunStatus::Pending, RunStatus::Running) => true,

            // From Running
            (RunStatus::Running, RunStatus::Paused) => true,
            (RunStatus::Running, RunStatus::Completed) => true,
            (RunStatus::Running, RunStatus::Failed) => true,

            // From Paused
            (RunStatus::Paused, RunStatus::Running) => true,
            (RunStatus::Paused, RunStatus::Failed) => true,

            // Terminal states - no transitions
            (RunStatus::Completed, _) => false,
            (RunStatus::Failed, _) => false,

            // Self transitions are no-ops
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Validate a transition, returning the target status on success.
    pub fn transition_to(&self, target: RunStatus) -> Result<RunStatus, InvalidTransitionError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(InvalidTransitionError {
                from: *self,
                to: target,
            })
        }
    }

    /// Statuses reachable from this one, excluding the self no-op.
    pub fn valid_transitions(&self) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s != self && self.can_transition_to(*s))
            .collect()
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Running or paused; at most one such run may exist per subject.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}
