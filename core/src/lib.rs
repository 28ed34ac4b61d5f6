// Quire: checkpointed workflow orchestration for content pipelines
// Core library providing workflow definitions, the step runner and SQLite persistence

pub mod checkpoint;
pub mod conditions;
pub mod config;
pub mod definition;
pub mod errors;
pub mod expression_eval;
pub mod registry;
pub mod run_state;
pub mod runner;
pub mod state_store;
pub mod traits;
pub mod workflow_toml;

// Re-export commonly used types
pub use errors::{
    ConfigError, ConfigResult, DefinitionError, DefinitionResult, EngineError, EngineResult,
    InvalidTransitionError, StoreError, StoreResult,
};

pub use traits::{
    Artifact, ArtifactRegistry, ArtifactType, CheckpointStore, ConditionDatabase, ContentVersion,
    Escalation, EscalationKind, EscalationStatus, EscalationStore, EventEmitter, EventType,
    IdGenerator, NewArtifact, NewEscalation, NewEvent, NewRun, RunFilter, RunRepository,
    SequentialIdGenerator, UuidIdGenerator, WorkflowEvent, WorkflowRun, WorkflowStore,
};

pub use checkpoint::{create_checkpoint, Checkpoint, GateDecision, PendingRetry, ResumeContext};

pub use definition::{
    define_workflow, get_step, is_terminal_step, Condition, ConditionContext, GateOption,
    HumanGate, Transition, WorkflowDefinition, WorkflowSpec, WorkflowStep,
};

pub use run_state::RunStatus;

pub use runner::{GatePrompt, RunSummary, StepCompletion, StepOutcome, StepReport, StepRunner};

pub use registry::WorkflowRegistry;

pub use state_store::SqliteStore;

pub use config::{ConfigManager, EngineConfig, LoggingConfig, QuireConfig, StorageConfig};
