//! Workflow definitions available to the runner, keyed by workflow type.

use crate::definition::WorkflowDefinition;
use crate::errors::{DefinitionError, DefinitionResult};
use crate::workflow_toml::{load_workflow_file, parse_workflow};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const W1_EDITING: &str = include_str!("../workflows/w1_editing.toml");
const W2_PDF: &str = include_str!("../workflows/w2_pdf.toml");

#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled `w1_editing` and `w2_pdf` workflows.
    pub fn with_builtins() -> DefinitionResult<Self> {
        let mut registry = Self::new();
        for source in [W1_EDITING, W2_PDF] {
            registry.register(parse_workflow(source)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> DefinitionResult<()> {
        let key = definition.workflow_type().to_string();
        if self.workflows.contains_key(&key) {
            return Err(DefinitionError::DuplicateWorkflow(key));
        }
        debug!(workflow = %key, steps = definition.steps().len(), "Registered workflow");
        self.workflows.insert(key, Arc::new(definition));
        Ok(())
    }

    /// Load every `*.toml` file in `dir`. A missing directory is skipped.
    pub fn load_dir(&mut self, dir: &Path) -> DefinitionResult<usize> {
        if !dir.is_dir() {
            debug!("Workflow directory {} not found, skipping", dir.display());
            return Ok(0);
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| DefinitionError::Io(format!("{}: {}", dir.display(), e)))?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "toml"))
            .collect();
        paths.sort();

        for path in &paths {
            self.register(load_workflow_file(path)?)?;
        }
        info!("Loaded {} workflow(s) from {}", paths.len(), dir.display());
        Ok(paths.len())
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<WorkflowDefinition>> {
        self.workflows.values()
    }
}
