/// Persisted record types and the collaborator traits the step runner depends on.
use crate::checkpoint::{Checkpoint, PendingRetry};
use crate::errors::StoreResult;
use crate::run_state::RunStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

// ============================================================================
// RUNS
// ============================================================================

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_type: String,
    /// The book (or other content unit) the run works on.
    pub subject_id: String,
    pub input_version_id: Option<String>,
    pub output_version_id: Option<String>,
    pub session_id: Option<String>,
    pub plan_id: Option<String>,
    pub status: RunStatus,
    pub current_agent: Option<String>,
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub workflow_type: String,
    pub subject_id: String,
    pub input_version_id: Option<String>,
    pub session_id: Option<String>,
}

/// Optional filters for listing runs; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub subject_id: Option<String>,
    pub status: Option<RunStatus>,
    pub workflow_type: Option<String>,
}

/// RunRepository trait - run metadata persistence.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Create a pending run. Fails if the subject already has an active run.
    async fn create_run(&self, run: NewRun) -> StoreResult<WorkflowRun>;

    async fn get_run(&self, id: &str) -> StoreResult<Option<WorkflowRun>>;

    /// Runs matching the filter, oldest first.
    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>>;

    /// Change status through the run state machine.
    async fn update_status(&self, id: &str, status: RunStatus) -> StoreResult<WorkflowRun>;

    async fn set_current_agent(&self, id: &str, agent: Option<&str>) -> StoreResult<()>;

    async fn link_output_version(&self, id: &str, version_id: &str) -> StoreResult<()>;

    async fn find_active_for_subject(&self, subject_id: &str)
        -> StoreResult<Option<WorkflowRun>>;
}

/// CheckpointStore trait - one JSON document per run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the whole checkpoint in a single write.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()>;

    async fn load_checkpoint(&self, run_id: &str) -> StoreResult<Option<Checkpoint>>;

    /// Runs whose checkpoint carries a retry marker, for recovery tooling.
    async fn runs_with_pending_retries(&self) -> StoreResult<Vec<(String, PendingRetry)>>;
}

// ============================================================================
// CONDITION DATABASE
// ============================================================================

/// A stored content version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContentVersion {
    pub id: String,
    pub subject_id: String,
}

/// Read-only lookups used by condition checks.
#[async_trait]
pub trait ConditionDatabase: Send + Sync {
    async fn strategic_plan_exists(&self, run_id: &str) -> StoreResult<bool>;

    async fn version_exists(&self, version_id: &str) -> StoreResult<bool>;

    /// Any artifact for the run, optionally restricted to one type.
    async fn artifacts_exist(
        &self,
        run_id: &str,
        artifact_type: Option<ArtifactType>,
    ) -> StoreResult<bool>;

    async fn workflow_status(&self, run_id: &str) -> StoreResult<Option<RunStatus>>;

    async fn get_version(&self, version_id: &str) -> StoreResult<Option<ContentVersion>>;
}

// ============================================================================
// EVENTS
// ============================================================================

/// Lifecycle event kinds recorded in the audit log.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Started,
    Completed,
    Rejected,
    Escalated,
    Paused,
    Resumed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Completed => "completed",
            EventType::Rejected => "rejected",
            EventType::Escalated => "escalated",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(EventType::Started),
            "completed" => Ok(EventType::Completed),
            "rejected" => Ok(EventType::Rejected),
            "escalated" => Ok(EventType::Escalated),
            "paused" => Ok(EventType::Paused),
            "resumed" => Ok(EventType::Resumed),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// An entry in a run's audit log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowEvent {
    pub id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub agent_name: Option<String>,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub run_id: String,
    pub event_type: EventType,
    pub agent_name: Option<String>,
    pub data: Option<Value>,
}

impl NewEvent {
    pub fn new(run_id: &str, event_type: EventType) -> Self {
        Self {
            run_id: run_id.to_string(),
            event_type,
            agent_name: None,
            data: None,
        }
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent_name = Some(agent.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// EventEmitter trait - append-only audit log.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: NewEvent) -> StoreResult<WorkflowEvent>;

    /// Events for a run in creation order.
    async fn events_for_run(&self, run_id: &str) -> StoreResult<Vec<WorkflowEvent>>;

    async fn latest_event(&self, run_id: &str) -> StoreResult<Option<WorkflowEvent>>;
}

// ============================================================================
// ARTIFACTS
// ============================================================================

/// Kinds of output a workflow step can register.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Chapter,
    ReleaseNotes,
    PrintHtml,
    WebHtml,
    PdfDraft,
    PdfDigital,
    PdfPrint,
    LayoutPlan,
    DesignPlan,
    Deployment,
    QaReport,
    MarketingCopy,
    Announcement,
    PlaytestSession,
    PlaytestAnalysis,
    PlaytestFeedback,
}

impl ArtifactType {
    pub const ALL: [ArtifactType; 16] = [
        ArtifactType::Chapter,
        ArtifactType::ReleaseNotes,
        ArtifactType::PrintHtml,
        ArtifactType::WebHtml,
        ArtifactType::PdfDraft,
        ArtifactType::PdfDigital,
        ArtifactType::PdfPrint,
        ArtifactType::LayoutPlan,
        ArtifactType::DesignPlan,
        ArtifactType::Deployment,
        ArtifactType::QaReport,
        ArtifactType::MarketingCopy,
        ArtifactType::Announcement,
        ArtifactType::PlaytestSession,
        ArtifactType::PlaytestAnalysis,
        ArtifactType::PlaytestFeedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Chapter => "chapter",
            ArtifactType::ReleaseNotes => "release_notes",
            ArtifactType::PrintHtml => "print_html",
            ArtifactType::WebHtml => "web_html",
            ArtifactType::PdfDraft => "pdf_draft",
            ArtifactType::PdfDigital => "pdf_digital",
            ArtifactType::PdfPrint => "pdf_print",
            ArtifactType::LayoutPlan => "layout_plan",
            ArtifactType::DesignPlan => "design_plan",
            ArtifactType::Deployment => "deployment",
            ArtifactType::QaReport => "qa_report",
            ArtifactType::MarketingCopy => "marketing_copy",
            ArtifactType::Announcement => "announcement",
            ArtifactType::PlaytestSession => "playtest_session",
            ArtifactType::PlaytestAnalysis => "playtest_analysis",
            ArtifactType::PlaytestFeedback => "playtest_feedback",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown artifact type: {}", s))
    }
}

/// A registered output of a workflow run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub artifact_type: ArtifactType,
    pub artifact_path: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: String,
    pub artifact_type: ArtifactType,
    pub artifact_path: String,
    pub metadata: Option<Value>,
}

/// ArtifactRegistry trait - produced outputs, queryable by run and type.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Register an artifact. Empty paths are rejected.
    async fn register_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact>;

    async fn get_artifact(&self, id: &str) -> StoreResult<Option<Artifact>>;

    async fn artifacts_by_run(&self, run_id: &str) -> StoreResult<Vec<Artifact>>;

    async fn artifacts_by_type(&self, artifact_type: ArtifactType) -> StoreResult<Vec<Artifact>>;

    async fn artifacts_by_run_and_type(
        &self,
        run_id: &str,
        artifact_type: ArtifactType,
    ) -> StoreResult<Vec<Artifact>>;
}

// ============================================================================
// ESCALATIONS
// ============================================================================

/// Why a run was handed to a human.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A conditional transition used up its loop budget.
    MaxIterations,
    /// Postconditions kept failing past the retry budget.
    RetriesExhausted,
}

impl EscalationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::MaxIterations => "max_iterations",
            EscalationKind::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_iterations" => Ok(EscalationKind::MaxIterations),
            "retries_exhausted" => Ok(EscalationKind::RetriesExhausted),
            other => Err(format!("unknown escalation kind: {}", other)),
        }
    }
}

/// Escalation lifecycle: pending -> acknowledged -> resolved.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Acknowledged => "acknowledged",
            EscalationStatus::Resolved => "resolved",
        }
    }

    /// Resolving may skip acknowledgement; nothing leaves `resolved`.
    pub fn can_become(&self, next: EscalationStatus) -> bool {
        matches!(
            (self, next),
            (EscalationStatus::Pending, EscalationStatus::Acknowledged)
                | (EscalationStatus::Pending, EscalationStatus::Resolved)
                | (EscalationStatus::Acknowledged, EscalationStatus::Resolved)
        )
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EscalationStatus::Pending),
            "acknowledged" => Ok(EscalationStatus::Acknowledged),
            "resolved" => Ok(EscalationStatus::Resolved),
            other => Err(format!("unknown escalation status: {}", other)),
        }
    }
}

/// A durable request for human attention on a run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Escalation {
    pub id: String,
    pub run_id: String,
    pub step: String,
    pub kind: EscalationKind,
    /// Loop count or failed attempts at the time of escalation.
    pub attempts: u32,
    pub escalated_to: String,
    pub reason: String,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub run_id: String,
    pub step: String,
    pub kind: EscalationKind,
    pub attempts: u32,
    pub escalated_to: String,
    pub reason: String,
}

/// EscalationStore trait - escalation records an operator works through.
#[async_trait]
pub trait EscalationStore: Send + Sync {
    /// Open an escalation. An unresolved one for the same run, step and kind
    /// is returned instead of creating a duplicate.
    async fn create_escalation(&self, escalation: NewEscalation) -> StoreResult<Escalation>;

    async fn get_escalation(&self, id: &str) -> StoreResult<Option<Escalation>>;

    async fn acknowledge_escalation(&self, id: &str) -> StoreResult<Escalation>;

    async fn resolve_escalation(&self, id: &str, resolution: &str) -> StoreResult<Escalation>;

    /// Escalations nobody has acknowledged yet, oldest first.
    async fn pending_escalations(&self) -> StoreResult<Vec<Escalation>>;

    async fn escalations_for_run(&self, run_id: &str) -> StoreResult<Vec<Escalation>>;
}

/// Everything the step runner needs from persistence.
pub trait WorkflowStore:
    RunRepository
    + CheckpointStore
    + EventEmitter
    + ArtifactRegistry
    + ConditionDatabase
    + EscalationStore
{
}

impl<T> WorkflowStore for T where
    T: RunRepository
        + CheckpointStore
        + EventEmitter
        + ArtifactRegistry
        + ConditionDatabase
        + EscalationStore
{
}

// ============================================================================
// ID GENERATION
// ============================================================================

/// Source of record identifiers, injected into stores.
pub trait IdGenerator: Send + Sync {
    /// A new id such as `wfrun_…`, `evt_…` or `art_…`.
    fn generate(&self, prefix: &str) -> String;
}

/// Random ids from uuid v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }
}

/// Deterministic `prefix_1`, `prefix_2`, ... ids.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{}", prefix, n)
    }
}
