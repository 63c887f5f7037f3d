//! Shell-command collaborators
//!
//! `CommandValidator` writes a bundle into a scratch directory and runs the
//! configured lint commands in order. `CommandSandboxRunner` does the same with
//! the acceptance test command, in the background, and reports back through a
//! completion channel.

use async_trait::async_trait;
use bytes::Bytes;
use liftify_core::config::{SandboxConfig, ValidatorConfig};
use liftify_core::{CodeBundle, CompletionEvent, JobId, JobStatus, LiftifyError, Result, RunKey};
use liftify_store::{ArtifactStore, CONTENT_TYPE_TEXT};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{LaunchRequest, SandboxRunner, StaticValidator};

/// Output of one shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Run `command` through `sh -c` in `dir`, capturing stdout and stderr
pub async fn run_command(dir: &Path, command: &str) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| LiftifyError::transient("command.spawn", format!("{}: {}", command, e)))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        output: text,
    })
}

/// Write every file of `bundle` under a freshly emptied `dir`
pub async fn materialize_bundle(dir: &Path, bundle: &CodeBundle) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;

    for (name, content) in &bundle.files {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(LiftifyError::Collaborator(format!(
                "generated file name '{}' escapes the work directory",
                name
            )));
        }
        let file = dir.join(relative);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
    }
    Ok(())
}

fn run_dir(work_root: &Path, key: &RunKey, stage: &str) -> PathBuf {
    work_root
        .join(&key.tenant)
        .join(&key.service)
        .join(&key.run_date)
        .join(stage)
}

/// Static validator that shells out to terraform and tflint
#[derive(Debug, Clone)]
pub struct CommandValidator {
    commands: Vec<String>,
    work_root: PathBuf,
}

impl CommandValidator {
    pub fn new(commands: Vec<String>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            commands,
            work_root: work_root.into(),
        }
    }

    pub fn from_config(config: &ValidatorConfig) -> Self {
        Self::new(config.commands.clone(), config.work_dir.clone())
    }
}

#[async_trait]
impl StaticValidator for CommandValidator {
    #[instrument(skip(self, bundle), fields(key = %key, files = bundle.files.len()))]
    async fn validate(&self, key: &RunKey, bundle: &CodeBundle) -> Result<String> {
        let dir = run_dir(&self.work_root, key, "validate");
        materialize_bundle(&dir, bundle).await?;

        let mut log = String::new();
        for command in &self.commands {
            debug!("{}: running {}", key, command);
            let result = run_command(&dir, command).await?;
            log.push_str(&format!("$ {}\n{}", command, result.output));
            if !log.ends_with('\n') {
                log.push('\n');
            }
            if !result.success {
                // Later commands depend on earlier ones (init before validate)
                log.push_str(&format!(
                    "error: `{}` exited with status {}\n",
                    command,
                    result
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                ));
                break;
            }
        }
        Ok(log)
    }
}

/// Sandbox runner executing the acceptance test command as a background task
///
/// The test log is written to `request.log_path` in the store before the
/// completion event is sent.
pub struct CommandSandboxRunner {
    command: String,
    work_root: PathBuf,
    store: Arc<dyn ArtifactStore>,
    events: UnboundedSender<CompletionEvent>,
    launched: Mutex<HashSet<JobId>>,
}

impl CommandSandboxRunner {
    pub fn new(
        command: impl Into<String>,
        work_root: impl Into<PathBuf>,
        store: Arc<dyn ArtifactStore>,
        events: UnboundedSender<CompletionEvent>,
    ) -> Self {
        Self {
            command: command.into(),
            work_root: work_root.into(),
            store,
            events,
            launched: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(
        config: &SandboxConfig,
        store: Arc<dyn ArtifactStore>,
        events: UnboundedSender<CompletionEvent>,
    ) -> Self {
        Self::new(config.command.clone(), config.work_dir.clone(), store, events)
    }

    /// Whether this runner started `job_id`
    pub fn has_launched(&self, job_id: &JobId) -> bool {
        self.launched
            .lock()
            .map(|launched| launched.contains(job_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SandboxRunner for CommandSandboxRunner {
    #[instrument(skip(self, request), fields(key = %request.key, job_id = %request.job_id))]
    async fn launch(&self, request: &LaunchRequest) -> Result<()> {
        {
            let mut launched = self
                .launched
                .lock()
                .map_err(|_| LiftifyError::Other("sandbox launch lock poisoned".to_string()))?;
            if !launched.insert(request.job_id.clone()) {
                debug!("{} already launched", request.job_id);
                return Ok(());
            }
        }

        let dir = run_dir(&self.work_root, &request.key, "sandbox").join(request.job_id.as_str());
        materialize_bundle(&dir, &request.bundle).await?;

        let command = self.command.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let job_id = request.job_id.clone();
        let log_path = request.log_path.clone();
        info!("Launching {} for {}", job_id, request.key);

        tokio::spawn(async move {
            let (status, log) = match run_command(&dir, &command).await {
                Ok(out) if out.success => (JobStatus::Succeeded, out.output),
                Ok(out) => (JobStatus::Failed, out.output),
                Err(e) => (JobStatus::Failed, format!("error: {}\n", e)),
            };
            if let Err(e) = store
                .write(&log_path, Bytes::from(log), CONTENT_TYPE_TEXT)
                .await
            {
                warn!("Failed to store test log for {}: {}", job_id, e);
            }

            if events.send(CompletionEvent::new(job_id.clone(), status)).is_err() {
                warn!("Completion receiver gone, dropping event for {}", job_id);
            }
        });

        Ok(())
    }
}
