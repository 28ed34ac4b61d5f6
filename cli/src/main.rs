/// Quire CLI - drive checkpointed content workflows from the shell
use clap::{Parser, Subcommand};
use colored::Colorize;
use quire_core::{ConfigManager, EngineError, QuireConfig, StoreError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod context;

use commands::{
    artifacts, cancel, escalations, events, gate, init, list, pause, record_plan,
    register_artifact, register_version, resume, start, status, step, validate, workflows,
};
use context::CliContext;

/// Exit code for a refused run status transition.
const EXIT_INVALID_TRANSITION: u8 = 2;

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Checkpointed workflow orchestration for content pipelines", long_about = None)]
#[command(version = "0.1.0")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to ./.quire/config.toml, then ~/.quire/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides storage.database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Override log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Start a workflow run for a subject
    Start {
        /// Workflow type (see `quire workflows`)
        workflow: String,

        /// Subject the run works on, e.g. a book id
        subject: String,

        /// Content version the run starts from
        #[arg(long)]
        input_version: Option<String>,

        /// Seed checkpoint data as KEY=VALUE (VALUE parsed as JSON when possible)
        #[arg(short, long = "data", value_name = "KEY=VALUE")]
        data: Vec<String>,
    },

    /// Show the current step of a run, or report it as finished with --complete
    Step {
        /// Run ID
        run_id: String,

        /// Name of the step being reported as finished
        #[arg(long, value_name = "STEP")]
        complete: Option<String>,

        /// Step result as JSON; transition predicates see it as `result`
        #[arg(long, requires = "complete")]
        result: Option<String>,

        /// Checkpoint data produced by the step as KEY=VALUE
        #[arg(short, long = "data", value_name = "KEY=VALUE", requires = "complete")]
        data: Vec<String>,

        /// Content version the step produced
        #[arg(long, requires = "complete")]
        output_version: Option<String>,
    },

    /// Answer the human gate a run is waiting on
    Gate {
        /// Run ID
        run_id: String,

        /// Option label, exactly as offered
        option: String,

        /// Free-text input for options that require it
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Pause a running workflow run
    Pause {
        /// Run ID
        run_id: String,
    },

    /// Resume a paused workflow run from its checkpoint
    Resume {
        /// Run ID
        run_id: String,
    },

    /// Cancel a run (marks it failed; completed steps are kept)
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Show the status and checkpoint of a run
    Status {
        /// Run ID
        run_id: String,
    },

    /// List workflow runs
    List {
        /// Only runs for this subject
        #[arg(long)]
        subject: Option<String>,

        /// Only runs in this status (pending, running, paused, completed, failed)
        #[arg(long)]
        status: Option<String>,

        /// Only runs of this workflow type
        #[arg(long)]
        workflow: Option<String>,

        /// Only runs whose checkpoint carries a pending retry
        #[arg(long)]
        pending_retries: bool,
    },

    /// Show the event log of a run
    Events {
        /// Run ID
        run_id: String,

        /// Show only the most recent event
        #[arg(long)]
        latest: bool,
    },

    /// Review escalated runs
    #[command(subcommand)]
    Escalations(escalations::EscalationCommands),

    /// List artifacts registered for a run, or across runs by type
    Artifacts {
        /// Run ID
        run_id: Option<String>,

        /// Filter by artifact type
        #[arg(short = 't', long = "type")]
        artifact_type: Option<String>,
    },

    /// Register an artifact produced by a run
    RegisterArtifact {
        /// Run ID
        run_id: String,

        /// Artifact type (chapter, pdf_digital, layout_plan, ...)
        artifact_type: String,

        /// Path of the artifact
        path: String,

        /// Metadata as JSON
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Record a content version so conditions can find it
    RegisterVersion {
        /// Version ID
        version_id: String,

        /// Subject the version belongs to
        subject: String,
    },

    /// Attach a strategic plan (JSON file) to a run
    RecordPlan {
        /// Run ID
        run_id: String,

        /// JSON file holding the plan
        file: PathBuf,
    },

    /// List known workflows, or show the steps of one
    Workflows {
        /// Workflow type to describe
        workflow: Option<String>,
    },

    /// Validate workflow definition files
    Validate {
        /// TOML files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Load configuration, then apply environment and command-line overrides.
fn load_config(config_path: Option<&Path>, db: Option<&Path>) -> anyhow::Result<QuireConfig> {
    let mut manager = ConfigManager::load(config_path)?;
    manager.load_from_env()?;
    if let Some(db) = db {
        manager.config_mut().storage.database_path = db.display().to_string();
    }
    manager.validate()?;
    Ok(manager.config().clone())
}

fn init_tracing(cli_level: Option<&str>, config_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Find an invalid status transition anywhere in the error chain.
fn invalid_transition(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        if let Some(EngineError::InvalidTransition(e)) = cause.downcast_ref::<EngineError>() {
            return Some(e.to_string());
        }
        match cause.downcast_ref::<StoreError>() {
            Some(StoreError::InvalidTransition(e)) => Some(e.to_string()),
            _ => None,
        }
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), args.db.as_deref())?;
    init_tracing(args.log_level.as_deref(), &config.logging.level);

    let ctx = CliContext::new(config, args.json);

    match args.command {
        Commands::Init { force } => {
            init::execute(&ctx, args.config.as_deref(), force).await?;
        }

        Commands::Start {
            workflow,
            subject,
            input_version,
            data,
        } => {
            start::execute(&ctx, &workflow, &subject, input_version.as_deref(), &data).await?;
        }

        Commands::Step {
            run_id,
            complete,
            result,
            data,
            output_version,
        } => match complete {
            Some(step_name) => {
                step::report(
                    &ctx,
                    &run_id,
                    &step_name,
                    result.as_deref(),
                    &data,
                    output_version,
                )
                .await?;
            }
            None => step::prepare(&ctx, &run_id).await?,
        },

        Commands::Gate {
            run_id,
            option,
            input,
        } => {
            gate::execute(&ctx, &run_id, &option, input).await?;
        }

        Commands::Pause { run_id } => {
            pause::execute(&ctx, &run_id).await?;
        }

        Commands::Resume { run_id } => {
            resume::execute(&ctx, &run_id).await?;
        }

        Commands::Cancel { run_id } => {
            cancel::execute(&ctx, &run_id).await?;
        }

        Commands::Status { run_id } => {
            status::execute(&ctx, &run_id).await?;
        }

        Commands::List {
            subject,
            status,
            workflow,
            pending_retries,
        } => {
            if pending_retries {
                list::pending_retries(&ctx).await?;
            } else {
                list::execute(
                    &ctx,
                    subject.as_deref(),
                    status.as_deref(),
                    workflow.as_deref(),
                )
                .await?;
            }
        }

        Commands::Events { run_id, latest } => {
            events::execute(&ctx, &run_id, latest).await?;
        }

        Commands::Escalations(cmd) => {
            escalations::execute(&ctx, &cmd).await?;
        }

        Commands::Artifacts {
            run_id,
            artifact_type,
        } => {
            artifacts::execute(&ctx, run_id.as_deref(), artifact_type.as_deref()).await?;
        }

        Commands::RegisterArtifact {
            run_id,
            artifact_type,
            path,
            metadata,
        } => {
            register_artifact::execute(&ctx, &run_id, &artifact_type, &path, metadata.as_deref())
                .await?;
        }

        Commands::RegisterVersion {
            version_id,
            subject,
        } => {
            register_version::execute(&ctx, &version_id, &subject).await?;
        }

        Commands::RecordPlan { run_id, file } => {
            record_plan::execute(&ctx, &run_id, &file).await?;
        }

        Commands::Workflows { workflow } => {
            workflows::execute(&ctx, workflow.as_deref())?;
        }

        Commands::Validate { files } => {
            validate::execute(&ctx, &files)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(message) = invalid_transition(&err) {
                eprintln!("{} {}", "Invalid status transition:".red().bold(), message);
                ExitCode::from(EXIT_INVALID_TRANSITION)
            } else {
                eprintln!("{} {:#}", "Error:".red().bold(), err);
                ExitCode::FAILURE
            }
        }
    }
}
