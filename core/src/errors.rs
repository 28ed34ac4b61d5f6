/// Error types for the Quire workflow engine.
use crate::expression_eval::EvalError;
use crate::run_state::RunStatus;
use crate::traits::EscalationStatus;
use thiserror::Error;

/// A lifecycle change the run state machine does not permit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition from '{from}' to '{to}'")]
pub struct InvalidTransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Structural problems found while building a workflow definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Invalid workflow definition: initial step \"{step}\" not found in steps")]
    UnknownInitialStep { workflow: String, step: String },

    #[error("Invalid workflow definition: step \"{step}\" references non-existent next step \"{target}\"")]
    DanglingTransition {
        workflow: String,
        step: String,
        target: String,
    },

    #[error("Invalid workflow definition: step \"{step}\" gate option \"{option}\" references non-existent step \"{target}\"")]
    DanglingGateOption {
        workflow: String,
        step: String,
        option: String,
        target: String,
    },

    #[error("Invalid workflow definition: step \"{step}\" has no transition and no human gate")]
    IncompleteStep { workflow: String, step: String },

    #[error("Invalid workflow definition: step \"{step}\" is declared more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("Invalid workflow definition: step \"{step}\" has an unparseable predicate \"{predicate}\": {reason}")]
    InvalidPredicate {
        step: String,
        predicate: String,
        reason: String,
    },

    #[error("Invalid workflow definition: step \"{step}\" references undeclared condition \"{condition}\"")]
    UnknownCondition { step: String, condition: String },

    #[error("Invalid condition \"{condition}\": {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("Failed to parse workflow file: {0}")]
    Parse(String),

    #[error("Workflow type already registered: {0}")]
    DuplicateWorkflow(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransitionError),

    #[error("Subject {subject_id} already has an active run: {run_id}")]
    ActiveRunExists { subject_id: String, run_id: String },

    #[error("Invalid artifact path: path must not be empty")]
    InvalidArtifactPath,

    #[error("Escalation not found: {0}")]
    EscalationNotFound(String),

    #[error("Escalation {id} is {from} and cannot become {to}")]
    InvalidEscalationStatus {
        id: String,
        from: EscalationStatus,
        to: EscalationStatus,
    },

    #[error("Unknown value in column {column}: {value}")]
    InvalidColumn { column: String, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

/// Errors surfaced by the step runner to a single CLI invocation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    #[error("No checkpoint found for run {0}")]
    CheckpointNotFound(String),

    #[error("Run {run_id}: step \"{step}\" not found in workflow definition")]
    StepNotFound { run_id: String, step: String },

    #[error("Run {run_id} at step \"{step}\": precondition \"{condition}\" failed: {message}")]
    PreconditionFailed {
        run_id: String,
        step: String,
        condition: String,
        message: String,
    },

    #[error("Run {run_id} at step \"{step}\": postcondition \"{condition}\" failed (attempt {attempt}): {message}")]
    PostconditionFailed {
        run_id: String,
        step: String,
        condition: String,
        message: String,
        attempt: u32,
    },

    #[error("Run {run_id} escalated at step \"{step}\": {count} of {max_iterations} iterations used")]
    IterationLimitExceeded {
        run_id: String,
        step: String,
        count: u32,
        max_iterations: u32,
    },

    #[error("Run {run_id} escalated at step \"{step}\" after {attempts} failed attempts: {message}")]
    RetriesExhausted {
        run_id: String,
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Run {run_id} at step \"{step}\": invalid gate option \"{option}\" (valid: {})", .valid.join(", "))]
    InvalidGateOption {
        run_id: String,
        step: String,
        option: String,
        valid: Vec<String>,
    },

    #[error("Run {run_id} at step \"{step}\": gate option \"{option}\" requires input")]
    GateInputRequired {
        run_id: String,
        step: String,
        option: String,
    },

    #[error("Run {run_id} at step \"{step}\" is waiting for a human decision")]
    GatePending { run_id: String, step: String },

    #[error("Run {run_id}: step \"{step}\" has no human gate")]
    NoHumanGate { run_id: String, step: String },

    #[error("Run {run_id}: step \"{step}\" is not the current step \"{current}\"")]
    StepOutOfOrder {
        run_id: String,
        step: String,
        current: String,
    },

    #[error("Run {run_id} is {status}, expected an active run")]
    RunNotActive { run_id: String, status: RunStatus },

    #[error("Run {run_id} at step \"{step}\": predicate evaluation failed: {source}")]
    Predicate {
        run_id: String,
        step: String,
        #[source]
        source: EvalError,
    },

    #[error(transparent)]
    InvalidTransition(InvalidTransitionError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition(e) => EngineError::InvalidTransition(e),
            StoreError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<InvalidTransitionError> for EngineError {
    fn from(err: InvalidTransitionError) -> Self {
        EngineError::InvalidTransition(err)
    }
}

impl EngineError {
    /// Whether this error is a lifecycle rule violation rather than a failure.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, EngineError::InvalidTransition(_))
    }
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to write config: {0}")]
    Write(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
