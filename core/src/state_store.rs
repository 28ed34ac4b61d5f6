/// SQLite-backed implementation of the persistence traits
/// Stores runs with their checkpoints, the event log, artifacts and the
/// read-only content tables condition checks query.
use crate::checkpoint::{Checkpoint, PendingRetry};
use crate::errors::{StoreError, StoreResult};
use crate::run_state::RunStatus;
use crate::traits::{
    Artifact, ArtifactRegistry, ArtifactType, CheckpointStore, ConditionDatabase, ContentVersion,
    Escalation, EscalationStatus, EscalationStore, EventEmitter, IdGenerator, NewArtifact,
    NewEscalation, NewEvent, NewRun, RunFilter, RunRepository, UuidIdGenerator, WorkflowEvent,
    WorkflowRun,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const RUN_COLUMNS: &str = "id, workflow_type, subject_id, input_version_id, output_version_id, \
     session_id, plan_id, status, current_agent, current_step, created_at, updated_at";

const ESCALATION_COLUMNS: &str = "id, run_id, step, kind, attempts, escalated_to, reason, status, \
     resolution, created_at, acknowledged_at, resolved_at";

/// SQLite-backed workflow store
pub struct SqliteStore {
    /// Connection pool to SQLite database
    pool: SqlitePool,

    /// Path to the SQLite database file
    db_path: PathBuf,

    ids: Arc<dyn IdGenerator>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path` and apply migrations.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::DatabaseError(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Invalid database path: {}", e))
                })?
                .create_if_missing(true)
                .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to connect to database: {}", e))
            })?;

        let store = Self {
            pool,
            db_path,
            ids: Arc::new(UuidIdGenerator),
        };
        store.initialize().await?;
        info!("Opened workflow store at {}", store.db_path.display());
        Ok(store)
    }

    /// A private in-memory database, one connection wide.
    pub async fn in_memory() -> StoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::DatabaseError(format!("Invalid database path: {}", e)))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to open in-memory database: {}", e))
            })?;

        let store = Self {
            pool,
            db_path: PathBuf::from(":memory:"),
            ids: Arc::new(UuidIdGenerator),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Replace the id source, e.g. with a `SequentialIdGenerator` in tests.
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Get connection pool for advanced operations
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.apply_migrations().await
    }

    async fn apply_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::DatabaseError(format!("Failed to create migrations table: {}", e))
        })?;

        let max_version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to read schema version: {}", e))
                })?;

        let migrations: Vec<(i32, &str, &str, Vec<&str>)> = vec![
            (
                1,
                "create_workflow_tables",
                "Runs with their checkpoints, events and artifacts",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS workflow_runs (
                        id TEXT PRIMARY KEY NOT NULL,
                        workflow_type TEXT NOT NULL,
                        subject_id TEXT NOT NULL,
                        input_version_id TEXT,
                        output_version_id TEXT,
                        session_id TEXT,
                        plan_id TEXT,
                        status TEXT NOT NULL,
                        current_agent TEXT,
                        current_step TEXT,
                        iteration_counts TEXT,
                        checkpoint_json TEXT,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE TABLE IF NOT EXISTS workflow_events (
                        id TEXT PRIMARY KEY NOT NULL,
                        run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                        event_type TEXT NOT NULL,
                        agent_name TEXT,
                        data TEXT,
                        created_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE TABLE IF NOT EXISTS workflow_artifacts (
                        id TEXT PRIMARY KEY NOT NULL,
                        run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                        artifact_type TEXT NOT NULL,
                        artifact_path TEXT NOT NULL,
                        metadata TEXT,
                        created_at INTEGER NOT NULL
                    )"#,
                ],
            ),
            (
                2,
                "create_content_tables",
                "Content versions and strategic plans read by condition checks",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS content_versions (
                        id TEXT PRIMARY KEY NOT NULL,
                        subject_id TEXT NOT NULL,
                        created_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE TABLE IF NOT EXISTS strategic_plans (
                        id TEXT PRIMARY KEY NOT NULL,
                        run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                        plan_json TEXT NOT NULL,
                        created_at INTEGER NOT NULL
                    )"#,
                ],
            ),
            (
                3,
                "add_workflow_indexes",
                "Indexes for subject, event and artifact lookups",
                vec![
                    r#"CREATE INDEX IF NOT EXISTS idx_workflow_runs_subject_status ON workflow_runs(subject_id, status)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_workflow_events_run ON workflow_events(run_id, created_at)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_workflow_artifacts_run_type ON workflow_artifacts(run_id, artifact_type)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_strategic_plans_run ON strategic_plans(run_id)"#,
                ],
            ),
            (
                4,
                "create_escalations",
                "Escalation records awaiting acknowledgement or resolution",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS escalations (
                        id TEXT PRIMARY KEY NOT NULL,
                        run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                        step TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        attempts INTEGER NOT NULL,
                        escalated_to TEXT NOT NULL,
                        reason TEXT NOT NULL,
                        status TEXT NOT NULL,
                        resolution TEXT,
                        created_at INTEGER NOT NULL,
                        acknowledged_at INTEGER,
                        resolved_at INTEGER
                    )"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status, created_at)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_escalations_run ON escalations(run_id, step, kind)"#,
                ],
            ),
        ];

        for (version, name, desc, statements) in migrations {
            if version > max_version {
                for statement in statements {
                    sqlx::query(statement)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| {
                            StoreError::DatabaseError(format!(
                                "Failed to apply migration {}: {}",
                                name, e
                            ))
                        })?;
                }

                sqlx::query(
                    "INSERT INTO migrations (version, name, description, applied_at) VALUES (?, ?, ?, ?)",
                )
                .bind(version)
                .bind(name)
                .bind(desc)
                .bind(Utc::now().timestamp())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!(
                        "Failed to record migration {}: {}",
                        name, e
                    ))
                })?;
                debug!("Applied migration {} ({})", version, name);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Content tables
    // ------------------------------------------------------------------------

    /// Record a content version so `version_exists` conditions can see it.
    pub async fn insert_version(&self, version_id: &str, subject_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO content_versions (id, subject_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(version_id)
        .bind(subject_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to insert version: {}", e)))?;
        Ok(())
    }

    /// Store a strategic plan for a run and link it as the run's plan.
    pub async fn record_strategic_plan(&self, run_id: &str, plan: &Value) -> StoreResult<String> {
        let plan_id = self.ids.generate("plan");
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        let updated = sqlx::query("UPDATE workflow_runs SET plan_id = ?, updated_at = ? WHERE id = ?")
            .bind(&plan_id)
            .bind(now)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to link plan: {}", e)))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }

        sqlx::query(
            "INSERT INTO strategic_plans (id, run_id, plan_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&plan_id)
        .bind(run_id)
        .bind(serde_json::to_string(plan)?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save plan: {}", e)))?;

        tx.commit().await.map_err(|e| {
            StoreError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(plan_id)
    }

    async fn require_run(&self, id: &str) -> StoreResult<WorkflowRun> {
        self.get_run(id)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))
    }

    async fn require_escalation(&self, id: &str) -> StoreResult<Escalation> {
        self.get_escalation(id)
            .await?
            .ok_or_else(|| StoreError::EscalationNotFound(id.to_string()))
    }

    /// Load an escalation and check it may move to `next`.
    async fn escalation_moving_to(
        &self,
        id: &str,
        next: EscalationStatus,
    ) -> StoreResult<Escalation> {
        let escalation = self.require_escalation(id).await?;
        if !escalation.status.can_become(next) {
            return Err(StoreError::InvalidEscalationStatus {
                id: id.to_string(),
                from: escalation.status,
                to: next,
            });
        }
        Ok(escalation)
    }

    async fn fetch_escalations(
        &self,
        filter: &str,
        bind: Option<&str>,
    ) -> StoreResult<Vec<Escalation>> {
        let sql = format!(
            "SELECT {} FROM escalations WHERE {} ORDER BY created_at ASC, rowid ASC",
            ESCALATION_COLUMNS, filter
        );
        let mut query = sqlx::query(&sql);
        if let Some(bind) = bind {
            query = query.bind(bind);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch escalations: {}", e)))?;
        rows.iter().map(row_to_escalation).collect()
    }

    async fn fetch_artifacts(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> StoreResult<Vec<Artifact>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch artifacts: {}", e)))?;
        rows.iter().map(row_to_artifact).collect()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn millis_to_datetime(column: &str, millis: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::InvalidColumn {
            column: column.to_string(),
            value: millis.to_string(),
        })
}

fn parse_column<T: FromStr>(column: &str, value: String) -> StoreResult<T> {
    value.parse::<T>().map_err(|_| StoreError::InvalidColumn {
        column: column.to_string(),
        value,
    })
}

fn parse_json_column(column: &str, value: Option<String>) -> StoreResult<Option<Value>> {
    value
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                StoreError::SerializationError(format!("Corrupt JSON in {}: {}", column, e))
            })
        })
        .transpose()
}

fn row_to_run(row: &SqliteRow) -> StoreResult<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        subject_id: row.get("subject_id"),
        input_version_id: row.get("input_version_id"),
        output_version_id: row.get("output_version_id"),
        session_id: row.get("session_id"),
        plan_id: row.get("plan_id"),
        status: parse_column("status", row.get("status"))?,
        current_agent: row.get("current_agent"),
        current_step: row.get("current_step"),
        created_at: millis_to_datetime("created_at", row.get("created_at"))?,
        updated_at: millis_to_datetime("updated_at", row.get("updated_at"))?,
    })
}

fn row_to_event(row: &SqliteRow) -> StoreResult<WorkflowEvent> {
    Ok(WorkflowEvent {
        id: row.get("id"),
        run_id: row.get("run_id"),
        event_type: parse_column("event_type", row.get("event_type"))?,
        agent_name: row.get("agent_name"),
        data: parse_json_column("data", row.get("data"))?,
        created_at: millis_to_datetime("created_at", row.get("created_at"))?,
    })
}

fn row_to_artifact(row: &SqliteRow) -> StoreResult<Artifact> {
    Ok(Artifact {
        id: row.get("id"),
        run_id: row.get("run_id"),
        artifact_type: parse_column("artifact_type", row.get("artifact_type"))?,
        artifact_path: row.get("artifact_path"),
        metadata: parse_json_column("metadata", row.get("metadata"))?,
        created_at: millis_to_datetime("created_at", row.get("created_at"))?,
    })
}

fn row_to_escalation(row: &SqliteRow) -> StoreResult<Escalation> {
    let attempts: i64 = row.get("attempts");
    let optional_time = |column: &str| -> StoreResult<Option<DateTime<Utc>>> {
        row.get::<Option<i64>, _>(column)
            .map(|millis| millis_to_datetime(column, millis))
            .transpose()
    };

    Ok(Escalation {
        id: row.get("id"),
        run_id: row.get("run_id"),
        step: row.get("step"),
        kind: parse_column("kind", row.get("kind"))?,
        attempts: u32::try_from(attempts).map_err(|_| StoreError::InvalidColumn {
            column: "attempts".to_string(),
            value: attempts.to_string(),
        })?,
        escalated_to: row.get("escalated_to"),
        reason: row.get("reason"),
        status: parse_column("status", row.get("status"))?,
        resolution: row.get("resolution"),
        created_at: millis_to_datetime("created_at", row.get("created_at"))?,
        acknowledged_at: optional_time("acknowledged_at")?,
        resolved_at: optional_time("resolved_at")?,
    })
}

// ============================================================================
// RUN REPOSITORY
// ============================================================================

#[async_trait]
impl RunRepository for SqliteStore {
    async fn create_run(&self, run: NewRun) -> StoreResult<WorkflowRun> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM workflow_runs WHERE subject_id = ? AND status IN ('running', 'paused') LIMIT 1",
        )
        .bind(&run.subject_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to check active runs: {}", e)))?;

        if let Some(run_id) = existing {
            return Err(StoreError::ActiveRunExists {
                subject_id: run.subject_id,
                run_id,
            });
        }

        let id = self.ids.generate("wfrun");
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
            (id, workflow_type, subject_id, input_version_id, session_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&run.workflow_type)
        .bind(&run.subject_id)
        .bind(&run.input_version_id)
        .bind(&run.session_id)
        .bind(RunStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create run: {}", e)))?;

        tx.commit().await.map_err(|e| {
            StoreError::DatabaseError(format!("Failed to commit transaction: {}", e))
        })?;

        info!(run_id = %id, workflow = %run.workflow_type, subject = %run.subject_id, "Created workflow run");
        self.require_run(&id).await
    }

    async fn get_run(&self, id: &str) -> StoreResult<Option<WorkflowRun>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_runs WHERE id = ?", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch run: {}", e)))?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<WorkflowRun>> {
        let mut sql = format!("SELECT {} FROM workflow_runs WHERE 1 = 1", RUN_COLUMNS);
        let mut binds: Vec<String> = Vec::new();

        if let Some(subject_id) = &filter.subject_id {
            sql.push_str(" AND subject_id = ?");
            binds.push(subject_id.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(workflow_type) = &filter.workflow_type {
            sql.push_str(" AND workflow_type = ?");
            binds.push(workflow_type.clone());
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to list runs: {}", e)))?;

        rows.iter().map(row_to_run).collect()
    }

    async fn update_status(&self, id: &str, status: RunStatus) -> StoreResult<WorkflowRun> {
        let run = self.require_run(id).await?;
        let next = run.status.transition_to(status)?;

        sqlx::query("UPDATE workflow_runs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to update status: {}", e)))?;

        if run.status != next {
            info!(run_id = %id, from = %run.status, to = %next, "Run status changed");
        }
        self.require_run(id).await
    }

    async fn set_current_agent(&self, id: &str, agent: Option<&str>) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE workflow_runs SET current_agent = ?, updated_at = ? WHERE id = ?")
                .bind(agent)
                .bind(Utc::now().timestamp_millis())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to set current agent: {}", e))
                })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn link_output_version(&self, id: &str, version_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET output_version_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(version_id)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to link output version: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find_active_for_subject(
        &self,
        subject_id: &str,
    ) -> StoreResult<Option<WorkflowRun>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_runs WHERE subject_id = ? AND status IN ('running', 'paused') \
             ORDER BY created_at DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to find active run: {}", e)))?;

        row.as_ref().map(row_to_run).transpose()
    }
}

// ============================================================================
// CHECKPOINTS
// ============================================================================

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let json = serde_json::to_string(checkpoint)?;
        let counts = serde_json::to_string(&checkpoint.iteration_counts)?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET checkpoint_json = ?, current_step = ?, iteration_counts = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(json)
        .bind(&checkpoint.current_step)
        .bind(counts)
        .bind(Utc::now().timestamp_millis())
        .bind(&checkpoint.workflow_run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save checkpoint: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(checkpoint.workflow_run_id.clone()));
        }
        debug!(
            run_id = %checkpoint.workflow_run_id,
            step = %checkpoint.current_step,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        let json: Option<Option<String>> =
            sqlx::query_scalar("SELECT checkpoint_json FROM workflow_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to load checkpoint: {}", e))
                })?;

        match json.flatten() {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                StoreError::SerializationError(format!(
                    "Corrupt checkpoint for run {}: {}",
                    run_id, e
                ))
            }),
        }
    }

    async fn runs_with_pending_retries(&self) -> StoreResult<Vec<(String, PendingRetry)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, checkpoint_json FROM workflow_runs
            WHERE checkpoint_json IS NOT NULL
              AND json_extract(checkpoint_json, '$.pendingRetry') IS NOT NULL
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to scan checkpoints: {}", e)))?;

        let mut pending = Vec::new();
        for row in &rows {
            let id: String = row.get("id");
            let raw: String = row.get("checkpoint_json");
            let checkpoint: Checkpoint = serde_json::from_str(&raw)?;
            if let Some(retry) = checkpoint.pending_retry {
                pending.push((id, retry));
            }
        }
        Ok(pending)
    }
}

// ============================================================================
// CONDITION DATABASE
// ============================================================================

#[async_trait]
impl ConditionDatabase for SqliteStore {
    async fn strategic_plan_exists(&self, run_id: &str) -> StoreResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM strategic_plans WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to query strategic plans: {}", e))
                })?;
        Ok(count > 0)
    }

    async fn version_exists(&self, version_id: &str) -> StoreResult<bool> {
        Ok(self.get_version(version_id).await?.is_some())
    }

    async fn artifacts_exist(
        &self,
        run_id: &str,
        artifact_type: Option<ArtifactType>,
    ) -> StoreResult<bool> {
        let count: i64 = match artifact_type {
            Some(t) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM workflow_artifacts WHERE run_id = ? AND artifact_type = ?",
            )
            .bind(run_id)
            .bind(t.as_str())
            .fetch_one(&self.pool)
            .await,
            None => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM workflow_artifacts WHERE run_id = ?",
            )
                .bind(run_id)
                .fetch_one(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::DatabaseError(format!("Failed to count artifacts: {}", e)))?;
        Ok(count > 0)
    }

    async fn workflow_status(&self, run_id: &str) -> StoreResult<Option<RunStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::DatabaseError(format!("Failed to read run status: {}", e))
                })?;
        status.map(|s| parse_column("status", s)).transpose()
    }

    async fn get_version(&self, version_id: &str) -> StoreResult<Option<ContentVersion>> {
        let row = sqlx::query("SELECT id, subject_id FROM content_versions WHERE id = ?")
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch version: {}", e)))?;

        Ok(row.map(|row| ContentVersion {
            id: row.get("id"),
            subject_id: row.get("subject_id"),
        }))
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[async_trait]
impl EventEmitter for SqliteStore {
    async fn emit(&self, event: NewEvent) -> StoreResult<WorkflowEvent> {
        let id = self.ids.generate("evt");
        let created_at = Utc::now();
        let data = event.data.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflow_events (id, run_id, event_type, agent_name, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&event.run_id)
        .bind(event.event_type.as_str())
        .bind(&event.agent_name)
        .bind(data)
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to save event: {}", e)))?;

        debug!(run_id = %event.run_id, event = %event.event_type, "Emitted workflow event");

        Ok(WorkflowEvent {
            id,
            run_id: event.run_id,
            event_type: event.event_type,
            agent_name: event.agent_name,
            data: event.data,
            created_at: millis_to_datetime("created_at", created_at.timestamp_millis())?,
        })
    }

    async fn events_for_run(&self, run_id: &str) -> StoreResult<Vec<WorkflowEvent>> {
        let rows = sqlx::query(
            "SELECT id, run_id, event_type, agent_name, data, created_at
             FROM workflow_events WHERE run_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch events: {}", e)))?;

        rows.iter().map(row_to_event).collect()
    }

    async fn latest_event(&self, run_id: &str) -> StoreResult<Option<WorkflowEvent>> {
        let row = sqlx::query(
            "SELECT id, run_id, event_type, agent_name, data, created_at
             FROM workflow_events WHERE run_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch latest event: {}", e)))?;

        row.as_ref().map(row_to_event).transpose()
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[async_trait]
impl ArtifactRegistry for SqliteStore {
    async fn register_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact> {
        if artifact.artifact_path.trim().is_empty() {
            return Err(StoreError::InvalidArtifactPath);
        }

        let id = self.ids.generate("art");
        let created_at = Utc::now().timestamp_millis();
        let metadata = artifact
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflow_artifacts (id, run_id, artifact_type, artifact_path, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&artifact.run_id)
        .bind(artifact.artifact_type.as_str())
        .bind(&artifact.artifact_path)
        .bind(metadata)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to register artifact: {}", e)))?;

        info!(
            run_id = %artifact.run_id,
            artifact_type = %artifact.artifact_type,
            path = %artifact.artifact_path,
            "Registered artifact"
        );

        Ok(Artifact {
            id,
            run_id: artifact.run_id,
            artifact_type: artifact.artifact_type,
            artifact_path: artifact.artifact_path,
            metadata: artifact.metadata,
            created_at: millis_to_datetime("created_at", created_at)?,
        })
    }

    async fn get_artifact(&self, id: &str) -> StoreResult<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT id, run_id, artifact_type, artifact_path, metadata, created_at
             FROM workflow_artifacts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch artifact: {}", e)))?;

        row.as_ref().map(row_to_artifact).transpose()
    }

    async fn artifacts_by_run(&self, run_id: &str) -> StoreResult<Vec<Artifact>> {
        self.fetch_artifacts(
            "SELECT id, run_id, artifact_type, artifact_path, metadata, created_at
             FROM workflow_artifacts WHERE run_id = ? ORDER BY created_at ASC, rowid ASC",
            &[run_id],
        )
        .await
    }

    async fn artifacts_by_type(&self, artifact_type: ArtifactType) -> StoreResult<Vec<Artifact>> {
        self.fetch_artifacts(
            "SELECT id, run_id, artifact_type, artifact_path, metadata, created_at
             FROM workflow_artifacts WHERE artifact_type = ? ORDER BY created_at ASC, rowid ASC",
            &[artifact_type.as_str()],
        )
        .await
    }

    async fn artifacts_by_run_and_type(
        &self,
        run_id: &str,
        artifact_type: ArtifactType,
    ) -> StoreResult<Vec<Artifact>> {
        self.fetch_artifacts(
            "SELECT id, run_id, artifact_type, artifact_path, metadata, created_at
             FROM workflow_artifacts WHERE run_id = ? AND artifact_type = ?
             ORDER BY created_at ASC, rowid ASC",
            &[run_id, artifact_type.as_str()],
        )
        .await
    }
}

// ============================================================================
// ESCALATIONS
// ============================================================================

#[async_trait]
impl EscalationStore for SqliteStore {
    async fn create_escalation(&self, escalation: NewEscalation) -> StoreResult<Escalation> {
        let open: Option<String> = sqlx::query_scalar(
            "SELECT id FROM escalations WHERE run_id = ? AND step = ? AND kind = ? \
             AND status != 'resolved' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(&escalation.run_id)
        .bind(&escalation.step)
        .bind(escalation.kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to check escalations: {}", e)))?;

        if let Some(id) = open {
            debug!(run_id = %escalation.run_id, escalation_id = %id, "Escalation already open");
            return self.require_escalation(&id).await;
        }

        let id = self.ids.generate("esc");
        sqlx::query(
            r#"
            INSERT INTO escalations
            (id, run_id, step, kind, attempts, escalated_to, reason, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&escalation.run_id)
        .bind(&escalation.step)
        .bind(escalation.kind.as_str())
        .bind(i64::from(escalation.attempts))
        .bind(&escalation.escalated_to)
        .bind(&escalation.reason)
        .bind(EscalationStatus::Pending.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to create escalation: {}", e)))?;

        info!(
            run_id = %escalation.run_id,
            escalation_id = %id,
            step = %escalation.step,
            escalated_to = %escalation.escalated_to,
            "Opened escalation"
        );
        self.require_escalation(&id).await
    }

    async fn get_escalation(&self, id: &str) -> StoreResult<Option<Escalation>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escalations WHERE id = ?",
            ESCALATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to fetch escalation: {}", e)))?;

        row.as_ref().map(row_to_escalation).transpose()
    }

    async fn acknowledge_escalation(&self, id: &str) -> StoreResult<Escalation> {
        let next = EscalationStatus::Acknowledged;
        self.escalation_moving_to(id, next).await?;

        sqlx::query("UPDATE escalations SET status = ?, acknowledged_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::DatabaseError(format!("Failed to acknowledge escalation: {}", e))
            })?;

        info!(escalation_id = %id, "Escalation acknowledged");
        self.require_escalation(id).await
    }

    async fn resolve_escalation(&self, id: &str, resolution: &str) -> StoreResult<Escalation> {
        let next = EscalationStatus::Resolved;
        self.escalation_moving_to(id, next).await?;

        sqlx::query(
            "UPDATE escalations SET status = ?, resolution = ?, resolved_at = ? WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(resolution)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to resolve escalation: {}", e)))?;

        info!(escalation_id = %id, "Escalation resolved");
        self.require_escalation(id).await
    }

    async fn pending_escalations(&self) -> StoreResult<Vec<Escalation>> {
        self.fetch_escalations("status = 'pending'", None).await
    }

    async fn escalations_for_run(&self, run_id: &str) -> StoreResult<Vec<Escalation>> {
        self.fetch_escalations("run_id = ?", Some(run_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::create_checkpoint;
    use crate::traits::{EscalationKind, EventType, SequentialIdGenerator};
    use serde_json::json;

    async fn create_test_store() -> SqliteStore {
        SqliteStore::in_memory()
            .await
            .unwrap()
            .with_ids(Arc::new(SequentialIdGenerator::default()))
    }

    fn new_run(subject: &str) -> NewRun {
        NewRun {
            workflow_type: "w2_pdf".to_string(),
            subject_id: subject.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        assert_eq!(run.id, "wfrun_1");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(store.get_run("wfrun_1").await.unwrap(), Some(run));
        assert!(store.get_run("wfrun_404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_active_run_per_subject() {
        let store = create_test_store().await;
        let first = store.create_run(new_run("book-1")).await.unwrap();

        // Pending runs do not block a second run.
        store.create_run(new_run("book-1")).await.unwrap();

        store.update_status(&first.id, RunStatus::Running).await.unwrap();
        match store.create_run(new_run("book-1")).await {
            Err(StoreError::ActiveRunExists { subject_id, run_id }) => {
                assert_eq!(subject_id, "book-1");
                assert_eq!(run_id, first.id);
            }
            other => panic!("expected ActiveRunExists, got {:?}", other),
        }

        // Other subjects are unaffected.
        store.create_run(new_run("book-2")).await.unwrap();

        let active = store.find_active_for_subject("book-1").await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
    }

    #[tokio::test]
    async fn test_update_status_consults_state_machine() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        store.update_status(&run.id, RunStatus::Running).await.unwrap();
        let done = store.update_status(&run.id, RunStatus::Completed).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);

        match store.update_status(&run.id, RunStatus::Running).await {
            Err(StoreError::InvalidTransition(e)) => {
                assert_eq!(e.from, RunStatus::Completed);
                assert_eq!(e.to, RunStatus::Running);
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
        assert_eq!(
            store.workflow_status(&run.id).await.unwrap(),
            Some(RunStatus::Completed)
        );

        assert!(matches!(
            store.update_status("wfrun_404", RunStatus::Running).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_runs_with_filter() {
        let store = create_test_store().await;
        let a = store.create_run(new_run("book-1")).await.unwrap();
        store.create_run(new_run("book-2")).await.unwrap();
        store
            .create_run(NewRun {
                workflow_type: "w1_editing".to_string(),
                subject_id: "book-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store.update_status(&a.id, RunStatus::Running).await.unwrap();

        let all = store.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["wfrun_1", "wfrun_2", "wfrun_3"]
        );

        let filter = RunFilter {
            subject_id: Some("book-1".to_string()),
            workflow_type: Some("w2_pdf".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_runs(&filter).await.unwrap().len(), 1);

        let running = RunFilter {
            status: Some(RunStatus::Running),
            ..Default::default()
        };
        assert_eq!(store.list_runs(&running).await.unwrap()[0].id, a.id);
    }

    #[tokio::test]
    async fn test_agent_and_output_version() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        store.set_current_agent(&run.id, Some("layout")).await.unwrap();
        store.link_output_version(&run.id, "ver_9").await.unwrap();
        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.current_agent.as_deref(), Some("layout"));
        assert_eq!(run.output_version_id.as_deref(), Some("ver_9"));

        store.set_current_agent(&run.id, None).await.unwrap();
        assert!(store.get_run(&run.id).await.unwrap().unwrap().current_agent.is_none());

        assert!(matches!(
            store.set_current_agent("wfrun_404", Some("x")).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();
        assert!(store.load_checkpoint(&run.id).await.unwrap().is_none());

        let mut checkpoint = create_checkpoint(&run.id, "w2_pdf", "pm-review");
        checkpoint.record_step_completion("pm-review", json!({"ok": true}));
        checkpoint.set_current_step("layout");
        checkpoint.increment_iteration("editor-review");
        checkpoint.set_data("pdfPath", json!("out/draft.pdf"));
        store.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = store.load_checkpoint(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.current_step.as_deref(), Some("layout"));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();
        sqlx::query("UPDATE workflow_runs SET checkpoint_json = '{not json' WHERE id = ?")
            .bind(&run.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            store.load_checkpoint(&run.id).await,
            Err(StoreError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_with_pending_retries() {
        let store = create_test_store().await;
        let a = store.create_run(new_run("book-1")).await.unwrap();
        let b = store.create_run(new_run("book-2")).await.unwrap();

        let mut cp_a = create_checkpoint(&a.id, "w2_pdf", "layout");
        cp_a.record_pending_retry("layout", "Layout plan missing", 1);
        store.save_checkpoint(&cp_a).await.unwrap();
        store
            .save_checkpoint(&create_checkpoint(&b.id, "w2_pdf", "pm-review"))
            .await
            .unwrap();

        let pending = store.runs_with_pending_retries().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, a.id);
        assert_eq!(pending[0].1.step, "layout");
    }

    #[tokio::test]
    async fn test_events_in_creation_order() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        store
            .emit(NewEvent::new(&run.id, EventType::Started).with_agent("pm-review"))
            .await
            .unwrap();
        store
            .emit(NewEvent::new(&run.id, EventType::Completed).with_data(json!({"step": "pm-review"})))
            .await
            .unwrap();
        store
            .emit(NewEvent::new(&run.id, EventType::Paused))
            .await
            .unwrap();

        let events = store.events_for_run(&run.id).await.unwrap();
        let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![EventType::Started, EventType::Completed, EventType::Paused]
        );
        assert_eq!(events[0].agent_name.as_deref(), Some("pm-review"));
        assert_eq!(events[1].data, Some(json!({"step": "pm-review"})));

        let latest = store.latest_event(&run.id).await.unwrap().unwrap();
        assert_eq!(latest.event_type, EventType::Paused);
        assert!(store.latest_event("wfrun_404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_artifact_registry_queries() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();
        let other = store.create_run(new_run("book-2")).await.unwrap();

        let draft = store
            .register_artifact(NewArtifact {
                run_id: run.id.clone(),
                artifact_type: ArtifactType::PdfDraft,
                artifact_path: "out/draft.pdf".to_string(),
                metadata: Some(json!({"pages": 212})),
            })
            .await
            .unwrap();
        store
            .register_artifact(NewArtifact {
                run_id: run.id.clone(),
                artifact_type: ArtifactType::LayoutPlan,
                artifact_path: "out/layout.json".to_string(),
                metadata: None,
            })
            .await
            .unwrap();
        store
            .register_artifact(NewArtifact {
                run_id: other.id.clone(),
                artifact_type: ArtifactType::PdfDraft,
                artifact_path: "other/draft.pdf".to_string(),
                metadata: None,
            })
            .await
            .unwrap();

        assert_eq!(store.get_artifact(&draft.id).await.unwrap(), Some(draft.clone()));
        assert_eq!(store.artifacts_by_run(&run.id).await.unwrap().len(), 2);
        assert_eq!(
            store.artifacts_by_type(ArtifactType::PdfDraft).await.unwrap().len(),
            2
        );
        let both = store
            .artifacts_by_run_and_type(&run.id, ArtifactType::PdfDraft)
            .await
            .unwrap();
        assert_eq!(both, vec![draft]);

        assert!(store.artifacts_exist(&run.id, None).await.unwrap());
        assert!(store
            .artifacts_exist(&run.id, Some(ArtifactType::LayoutPlan))
            .await
            .unwrap());
        assert!(!store
            .artifacts_exist(&other.id, Some(ArtifactType::LayoutPlan))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_artifact_path_rejected() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();
        let result = store
            .register_artifact(NewArtifact {
                run_id: run.id,
                artifact_type: ArtifactType::Chapter,
                artifact_path: "  ".to_string(),
                metadata: None,
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArtifactPath)));
    }

    fn new_escalation(run_id: &str, kind: EscalationKind) -> NewEscalation {
        NewEscalation {
            run_id: run_id.to_string(),
            step: "editor-review".to_string(),
            kind,
            attempts: 3,
            escalated_to: "human-reviewer".to_string(),
            reason: "Exceeded 3 iterations of the editor-review loop".to_string(),
        }
    }

    #[tokio::test]
    async fn test_escalation_lifecycle() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        let esc = store
            .create_escalation(new_escalation(&run.id, EscalationKind::MaxIterations))
            .await
            .unwrap();
        assert_eq!(esc.status, EscalationStatus::Pending);
        assert_eq!(esc.attempts, 3);
        assert!(esc.acknowledged_at.is_none());

        // An open escalation for the same step and kind is reused.
        let again = store
            .create_escalation(new_escalation(&run.id, EscalationKind::MaxIterations))
            .await
            .unwrap();
        assert_eq!(again.id, esc.id);
        assert_eq!(store.pending_escalations().await.unwrap(), vec![esc.clone()]);

        let acked = store.acknowledge_escalation(&esc.id).await.unwrap();
        assert_eq!(acked.status, EscalationStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());
        assert!(store.pending_escalations().await.unwrap().is_empty());

        let resolved = store
            .resolve_escalation(&esc.id, "Approved by the senior editor")
            .await
            .unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(
            resolved.resolution.as_deref(),
            Some("Approved by the senior editor")
        );
        assert!(resolved.resolved_at.is_some());

        match store.acknowledge_escalation(&esc.id).await {
            Err(StoreError::InvalidEscalationStatus { from, to, .. }) => {
                assert_eq!(from, EscalationStatus::Resolved);
                assert_eq!(to, EscalationStatus::Acknowledged);
            }
            other => panic!("expected invalid escalation status, got {:?}", other),
        }

        // Once resolved, a new escalation opens a fresh record.
        let next = store
            .create_escalation(new_escalation(&run.id, EscalationKind::MaxIterations))
            .await
            .unwrap();
        assert_ne!(next.id, esc.id);
        assert_eq!(store.escalations_for_run(&run.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_escalation() {
        let store = create_test_store().await;
        assert!(store.get_escalation("esc_404").await.unwrap().is_none());
        assert!(matches!(
            store.resolve_escalation("esc_404", "n/a").await,
            Err(StoreError::EscalationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_versions_and_plans() {
        let store = create_test_store().await;
        let run = store.create_run(new_run("book-1")).await.unwrap();

        assert!(!store.version_exists("ver_1").await.unwrap());
        store.insert_version("ver_1", "book-1").await.unwrap();
        assert!(store.version_exists("ver_1").await.unwrap());
        assert_eq!(
            store.get_version("ver_1").await.unwrap(),
            Some(ContentVersion {
                id: "ver_1".to_string(),
                subject_id: "book-1".to_string()
            })
        );

        assert!(!store.strategic_plan_exists(&run.id).await.unwrap());
        let plan_id = store
            .record_strategic_plan(&run.id, &json!({"goals": ["tighten pacing"]}))
            .await
            .unwrap();
        assert!(store.strategic_plan_exists(&run.id).await.unwrap());
        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.plan_id, Some(plan_id));
    }

    #[tokio::test]
    async fn test_file_store_reopens_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quire.db");

        let run_id = {
            let store = SqliteStore::new(&path).await.unwrap();
            store.create_run(new_run("book-1")).await.unwrap().id
        };

        let store = SqliteStore::new(&path).await.unwrap();
        assert!(store.get_run(&run_id).await.unwrap().is_some());
        assert_eq!(store.db_path(), path.as_path());
    }
}
