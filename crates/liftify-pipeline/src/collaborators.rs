//! Collaborator seams used by the orchestrator
//!
//! Each trait wraps one external dependency. Implementations report retryable
//! failures as `LiftifyError::Transient`; anything else is treated as permanent
//! for the current step.

use async_trait::async_trait;
use liftify_core::{ArtifactRef, CodeBundle, JobId, Result, RunKey, TerminalReport};
use liftify_store::ArtifactStore;
use std::sync::Arc;

/// Input for one generation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub key: RunKey,
    /// Zero-based regeneration count
    pub attempt: u32,
    pub spec: String,
    /// Bundle that failed the previous check, if this is a repair
    pub prior_code: Option<CodeBundle>,
    /// Log of the failed check, if this is a repair
    pub failure_log: Option<String>,
}

impl GenerationRequest {
    pub fn is_repair(&self) -> bool {
        self.prior_code.is_some()
    }
}

/// Produces infrastructure code from a specification
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<CodeBundle>;
}

/// Runs linters and static checks over a bundle and returns their raw output
///
/// A failing check is reported through the output, not through `Err`. The
/// output is classified by the pipeline.
#[async_trait]
pub trait StaticValidator: Send + Sync {
    async fn validate(&self, key: &RunKey, bundle: &CodeBundle) -> Result<String>;
}

/// A sandbox job to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Id allocated by the pipeline; completion events must carry it back
    pub job_id: JobId,
    pub key: RunKey,
    pub bundle: CodeBundle,
    pub bundle_ref: ArtifactRef,
    /// Where the runner should write the test log
    pub log_path: String,
}

/// Deploys a bundle into a sandbox and runs acceptance tests asynchronously
///
/// `launch` returns once the job is accepted. The outcome arrives later as a
/// `CompletionEvent` for `request.job_id`. Launching the same job id twice
/// must not start a second job.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<()>;
}

/// Receives the terminal report of every finished run
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, report: &TerminalReport) -> Result<()>;
}

/// Everything the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ArtifactStore>,
    pub generator: Arc<dyn CodeGenerator>,
    pub validator: Arc<dyn StaticValidator>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn CodeGenerator>,
        validator: Arc<dyn StaticValidator>,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> Self {
        Self {
            store,
            generator,
            validator,
            sandbox,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }
}
