use crate::context::CliContext;
use anyhow::Result;
use colored::Colorize;
use quire_core::ConfigManager;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = ".quire/config.toml";

pub async fn execute(ctx: &CliContext, config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if path.exists() && !force {
        anyhow::bail!(
            "Config file {} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = ctx.config.clone();
    let workflows_dir = Path::new(&config.storage.base_path).join("workflows");
    fs::create_dir_all(&workflows_dir)?;
    let workflows_dir = workflows_dir.display().to_string();
    if !config.engine.workflow_dirs.contains(&workflows_dir) {
        config.engine.workflow_dirs.push(workflows_dir.clone());
    }

    let manager = ConfigManager::from_config(config, path.clone());
    manager.validate()?;
    manager.save()?;

    // Opening the store creates the database and applies migrations.
    let store = CliContext::new(manager.config().clone(), ctx.json).store().await?;
    info!("Initialized database at {}", store.db_path().display());

    if ctx.json {
        return ctx.print_json(&serde_json::json!({
            "config": path.display().to_string(),
            "database": store.db_path().display().to_string(),
            "workflowsDir": workflows_dir,
        }));
    }

    println!("{}", "Quire initialized.".green().bold());
    println!("  Config:    {}", path.display().to_string().cyan());
    println!("  Database:  {}", store.db_path().display().to_string().cyan());
    println!("  Workflows: {}", workflows_dir.cyan());
    println!(
        "\nStart a run with: {}",
        "quire start <workflow> <subject>".yellow()
    );

    Ok(())
}
