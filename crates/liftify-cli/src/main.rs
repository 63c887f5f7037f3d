//! Liftify CLI - self-correcting infrastructure code pipeline
//!
//! Usage:
//!   liftify init                                Write default config
//!   liftify trigger <object-key> [--spec-file]  Start or continue a run
//!   liftify complete --event <file>             Feed a sandbox completion event
//!   liftify status <tenant> <service> <date>    Show a run
//!   liftify cancel <tenant> <service> <date>    Fail an active run
//!   liftify expire                              Fail runs stuck on a sandbox job

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::Utc;
use clap::{Parser, Subcommand};
use liftify_core::{CompletionEvent, JobId, JobStatus, LiftifyConfig, PipelineRun, RunKey, Stage, TriggerEvent};
use liftify_pipeline::{
    ActivityNotifier, Collaborators, CommandSandboxRunner, CommandValidator, GitPushNotifier,
    HttpGenerator, LogNotifier, OrchestratorConfig, PipelineOrchestrator, ReportNotifier, ResumeOutcome,
};
use liftify_store::{ArtifactStore, FsStore, CONTENT_TYPE_TEXT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "liftify")]
#[command(author, version, about = "Self-correcting infrastructure code pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding `.liftify/`
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to `.liftify/config.toml`
    Init,

    /// Start the run for an uploaded specification, or continue an active one
    Trigger {
        /// Object key of the specification: {tenant}/{service}/{date}/{file}
        object_key: String,

        /// Upload this local file as the specification first
        #[arg(long, value_name = "FILE")]
        spec_file: Option<PathBuf>,
    },

    /// Deliver a sandbox completion event
    Complete {
        /// JSON event file (build-state-change or direct shape)
        #[arg(long, value_name = "FILE", conflicts_with_all = ["job_id", "status"])]
        event: Option<PathBuf>,

        /// Sandbox job id
        #[arg(long, requires = "status")]
        job_id: Option<String>,

        /// Job status (SUCCEEDED, FAILED, STOPPED, ...)
        #[arg(long, requires = "job_id")]
        status: Option<String>,
    },

    /// Show the persisted state of a run
    Status {
        tenant: String,
        service: String,
        run_date: String,
    },

    /// Force an active run into FAILED_FATAL
    Cancel {
        tenant: String,
        service: String,
        run_date: String,

        /// Reason recorded in the terminal report
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Fail every run whose sandbox job missed its deadline
    Expire,
}

/// Orchestrator wired to local adapters, plus the completion channel of the
/// command sandbox runner
struct Pipeline {
    orchestrator: PipelineOrchestrator,
    store: Arc<dyn ArtifactStore>,
    sandbox: Arc<CommandSandboxRunner>,
    completions: UnboundedReceiver<CompletionEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => cmd_init(&cli.root).await,
        Commands::Trigger {
            object_key,
            spec_file,
        } => cmd_trigger(&cli.root, object_key, spec_file).await,
        Commands::Complete {
            event,
            job_id,
            status,
        } => cmd_complete(&cli.root, event, job_id, status).await,
        Commands::Status {
            tenant,
            service,
            run_date,
        } => cmd_status(&cli.root, RunKey::new(tenant, service, run_date)?).await,
        Commands::Cancel {
            tenant,
            service,
            run_date,
            reason,
        } => cmd_cancel(&cli.root, RunKey::new(tenant, service, run_date)?, reason).await,
        Commands::Expire => cmd_expire(&cli.root).await,
    }
}

async fn cmd_init(root: &Path) -> Result<()> {
    let config_path = LiftifyConfig::write_default(root).context("Failed to write config")?;
    let config = LiftifyConfig::default();
    tokio::fs::create_dir_all(root.join(&config.store.root)).await?;

    println!("Initialized Liftify in {}", root.display());
    println!("  config: {}", config_path.display());
    println!("  store:  {}", root.join(&config.store.root).display());
    Ok(())
}

async fn cmd_trigger(root: &Path, object_key: String, spec_file: Option<PathBuf>) -> Result<()> {
    let trigger = TriggerEvent::from_object_key(&object_key)?;
    let mut pipeline = open_pipeline(root)?;

    if let Some(file) = spec_file {
        let spec = tokio::fs::read(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        pipeline
            .store
            .write(&trigger.spec_location, Bytes::from(spec), CONTENT_TYPE_TEXT)
            .await?;
        info!("Uploaded {} to {}", file.display(), trigger.spec_location);
    }

    let run = pipeline.orchestrator.trigger(&trigger).await?;
    let run = await_local_jobs(&mut pipeline, run).await?;
    print_run(&run)
}

async fn cmd_complete(
    root: &Path,
    event_file: Option<PathBuf>,
    job_id: Option<String>,
    status: Option<String>,
) -> Result<()> {
    let event = match (event_file, job_id, status) {
        (Some(file), _, _) => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("Event file is not JSON")?;
            CompletionEvent::from_json(&value)?
        }
        (None, Some(job_id), Some(status)) => {
            CompletionEvent::new(JobId(job_id), JobStatus::from(status))
        }
        _ => bail!("pass either --event or both --job-id and --status"),
    };
    let mut pipeline = open_pipeline(root)?;
    match pipeline.orchestrator.on_completion(&event).await? {
        ResumeOutcome::Resumed(run) => {
            let run = await_local_jobs(&mut pipeline, run).await?;
            print_run(&run)
        }
        ResumeOutcome::InProgress(status) => {
            println!("{} is still {}; nothing to do", event.job_id, status);
            Ok(())
        }
        ResumeOutcome::Orphaned => {
            println!("No run is waiting on {}", event.job_id);
            Ok(())
        }
        ResumeOutcome::Duplicate => {
            println!("{} was already handled", event.job_id);
            Ok(())
        }
    }
}

async fn cmd_status(root: &Path, key: RunKey) -> Result<()> {
    let pipeline = open_pipeline(root)?;
    match pipeline.orchestrator.status(&key).await? {
        Some(run) => print_run(&run),
        None => {
            println!("No run for {}", key);
            Ok(())
        }
    }
}

async fn cmd_cancel(root: &Path, key: RunKey, reason: String) -> Result<()> {
    let pipeline = open_pipeline(root)?;
    let run = pipeline.orchestrator.cancel(&key, &reason).await?;
    print_run(&run)
}

async fn cmd_expire(root: &Path) -> Result<()> {
    let pipeline = open_pipeline(root)?;
    let expired = pipeline.orchestrator.expire_stale(Utc::now()).await?;
    if expired.is_empty() {
        println!("No expired runs");
    }
    for run in expired {
        println!("{} -> {}", run.key, run.stage);
    }
    Ok(())
}

/// Build the orchestrator from `.liftify/config.toml` under `root`
fn open_pipeline(root: &Path) -> Result<Pipeline> {
    let config = LiftifyConfig::load_or_default(root).context("Failed to load config")?;
    let store: Arc<dyn ArtifactStore> = Arc::new(FsStore::new(root.join(&config.store.root)));

    let generator = Arc::new(HttpGenerator::from_config(&config.generator)?);
    let mut validator_config = config.validator.clone();
    validator_config.work_dir = root.join(&validator_config.work_dir);
    let validator = Arc::new(CommandValidator::from_config(&validator_config));

    let (tx, completions) = mpsc::unbounded_channel();
    let mut sandbox_config = config.sandbox.clone();
    sandbox_config.work_dir = root.join(&sandbox_config.work_dir);
    let sandbox = Arc::new(CommandSandboxRunner::from_config(
        &sandbox_config,
        store.clone(),
        tx,
    ));

    let mut collaborators =
        Collaborators::new(store.clone(), generator, validator, sandbox.clone())
            .with_notifier(Arc::new(LogNotifier))
            .with_notifier(Arc::new(ReportNotifier::new(store.clone())))
            .with_notifier(Arc::new(ActivityNotifier::new(root.join(".liftify"))));
    let mut vcs_config = config.vcs.clone();
    vcs_config.work_tree = vcs_config.work_tree.map(|tree| root.join(tree));
    if let Some(git) = GitPushNotifier::from_config(&vcs_config, store.clone()) {
        collaborators = collaborators.with_notifier(Arc::new(git));
    }
    let orchestrator =
        PipelineOrchestrator::new(collaborators, OrchestratorConfig::from_config(&config)?);

    Ok(Pipeline {
        orchestrator,
        store,
        sandbox,
        completions,
    })
}

/// Keep resuming the run while it waits on a job this process launched
async fn await_local_jobs(pipeline: &mut Pipeline, mut run: PipelineRun) -> Result<PipelineRun> {
    loop {
        let Some(pending) = run.pending_job.as_ref() else {
            return Ok(run);
        };
        if run.stage != Stage::DeployTestPending || !pipeline.sandbox.has_launched(&pending.job_id)
        {
            return Ok(run);
        }

        info!("Waiting for sandbox job {}", pending.job_id);
        let Some(event) = pipeline.completions.recv().await else {
            warn!("Sandbox runner stopped before reporting {}", pending.job_id);
            return Ok(run);
        };

        match pipeline.orchestrator.on_completion(&event).await? {
            ResumeOutcome::Resumed(next) => run = next,
            other => {
                info!("Completion for {} ignored: {:?}", event.job_id, other);
                let key = run.key.clone();
                return Ok(pipeline.orchestrator.status(&key).await?.unwrap_or(run));
            }
        }
    }
}

fn print_run(run: &PipelineRun) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(run)?);
    Ok(())
}
