/// Shared state handed to every subcommand
use anyhow::{Context, Result};
use quire_core::{QuireConfig, SqliteStore, StepRunner, WorkflowRegistry};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct CliContext {
    pub config: QuireConfig,
    pub json: bool,
}

impl CliContext {
    pub fn new(config: QuireConfig, json: bool) -> Self {
        Self { config, json }
    }

    /// Bundled workflows plus every definition in the configured directories.
    pub fn registry(&self) -> Result<WorkflowRegistry> {
        let mut registry = WorkflowRegistry::with_builtins()?;
        for dir in &self.config.engine.workflow_dirs {
            let loaded = registry
                .load_dir(Path::new(dir))
                .with_context(|| format!("Failed to load workflows from {}", dir))?;
            debug!("Loaded {} workflow(s) from {}", loaded, dir);
        }
        Ok(registry)
    }

    pub async fn store(&self) -> Result<SqliteStore> {
        let db_path = self.config.storage.resolved_database_path();
        Ok(SqliteStore::new(&db_path).await?)
    }

    pub async fn runner(&self) -> Result<StepRunner<SqliteStore>> {
        let registry = self.registry()?;
        let store = self.store().await?;
        Ok(StepRunner::new(Arc::new(store), Arc::new(registry))
            .with_base_dir(&self.config.engine.base_dir)
            .with_max_step_retries(self.config.engine.max_step_retries)
            .with_escalation_target(&self.config.engine.escalation_target))
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}
