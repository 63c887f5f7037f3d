//! Pipeline orchestrator
//!
//! Each `step` loads the persisted run, performs the unit of work for its stage,
//! and commits the next state before any downstream side effect runs. Steps are
//! independent invocations: a crashed step is replayed from the last committed
//! state, and two workers racing on one run are serialised by the run store's
//! compare-and-swap.
//!
//! Suspension: a clean validation allocates the sandbox job id and stores the
//! continuation first, commits DEPLOY_TEST_PENDING second, and launches the job
//! last. A completion event can therefore never arrive before its continuation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use liftify_core::paths::{
    bundle_path, failure_note_path, lint_log_path, published_path, test_log_path, BUNDLE_FILE,
};
use liftify_core::{
    fail_open, retry_transient, ArtifactRef, CodeBundle, CompletionEvent, ContinuationToken, JobId,
    LiftifyConfig, LiftifyError, PendingJob, PipelineRun, Result, RetryPolicy, RunKey, Stage,
    TerminalReport, TriggerEvent,
};
use liftify_store::{ArtifactStore, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bridge::{CompletionBridge, ResumeOutcome, RunSnapshot};
use crate::classifier::{FailureClassifier, RuleTable};
use crate::collaborators::{
    CodeGenerator, Collaborators, GenerationRequest, LaunchRequest, Notifier, SandboxRunner,
    StaticValidator,
};
use crate::run_store::{RunStore, VersionedRun};
use crate::state_machine::{Action, Event, StateMachine};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Regeneration cycles allowed before a run fails
    pub retry_ceiling: u32,
    /// How long a run may wait on a sandbox job
    pub pending_expiry: chrono::Duration,
    /// Retry policy for transient collaborator and store failures
    pub retry: RetryPolicy,
    pub rules: RuleTable,
}

impl OrchestratorConfig {
    pub fn from_config(config: &LiftifyConfig) -> Result<Self> {
        let pending_expiry = chrono::Duration::from_std(config.pipeline.pending_expiry())
            .map_err(|e| LiftifyError::Config(format!("pending_expiry_secs out of range: {}", e)))?;
        Ok(Self {
            retry_ceiling: config.pipeline.retry_ceiling,
            pending_expiry,
            retry: RetryPolicy::from(&config.transient),
            rules: RuleTable::from_config(&config.classifier)?,
        })
    }
}

/// Result of one `step`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transition was committed; stepping again makes progress
    Advanced(PipelineRun),
    /// Waiting on a sandbox job; only a completion event moves the run
    Suspended(PipelineRun),
    /// SUCCEEDED or FAILED_FATAL
    Terminal(PipelineRun),
}

impl StepOutcome {
    pub fn run(&self) -> &PipelineRun {
        match self {
            Self::Advanced(run) | Self::Suspended(run) | Self::Terminal(run) => run,
        }
    }
}

/// Drives runs through GENERATING, VALIDATING, DEPLOY_TEST_PENDING and CLASSIFYING
pub struct PipelineOrchestrator {
    store: Arc<dyn ArtifactStore>,
    generator: Arc<dyn CodeGenerator>,
    validator: Arc<dyn StaticValidator>,
    sandbox: Arc<dyn SandboxRunner>,
    notifiers: Vec<Arc<dyn Notifier>>,
    runs: RunStore,
    bridge: CompletionBridge,
    classifier: Arc<FailureClassifier>,
    machine: StateMachine,
    config: OrchestratorConfig,
}

impl PipelineOrchestrator {
    pub fn new(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        let Collaborators {
            store,
            generator,
            validator,
            sandbox,
            notifiers,
        } = collaborators;
        let classifier = Arc::new(FailureClassifier::new(config.rules.clone()));
        let machine = StateMachine::new(config.retry_ceiling);

        Self {
            runs: RunStore::new(store.clone(), config.retry),
            bridge: CompletionBridge::new(store.clone(), classifier.clone(), machine, config.retry),
            store,
            generator,
            validator,
            sandbox,
            notifiers,
            classifier,
            machine,
            config,
        }
    }

    pub fn bridge(&self) -> &CompletionBridge {
        &self.bridge
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current run for `key`, if any
    pub async fn status(&self, key: &RunKey) -> Result<Option<PipelineRun>> {
        Ok(self.runs.load(key).await?.map(|v| v.run))
    }

    /// Start a run for an uploaded specification, or continue an active one
    ///
    /// A terminal run is never re-entered: triggering it again is `RunTerminal`.
    pub async fn trigger(&self, event: &TriggerEvent) -> Result<PipelineRun> {
        let spec_exists = retry_transient("trigger.head_spec", self.config.retry, || {
            self.store.head(&event.spec_location)
        })
        .await?
        .is_some();
        if !spec_exists {
            return Err(LiftifyError::InputShape(format!(
                "specification {} does not exist",
                event.spec_location
            )));
        }

        match self.runs.load(&event.key).await? {
            Some(existing) if existing.run.is_terminal() => {
                return Err(LiftifyError::RunTerminal(format!(
                    "{} already finished as {}",
                    event.key, existing.run.stage
                )));
            }
            Some(existing) => {
                if existing.run.spec.path != event.spec_location {
                    warn!(
                        "{} is already running from {}; ignoring new specification {}",
                        event.key, existing.run.spec.path, event.spec_location
                    );
                }
                info!(
                    "Resuming {} at {} (retry {})",
                    event.key, existing.run.stage, existing.run.retry_count
                );
            }
            None => {
                let run = PipelineRun::new(
                    event.key.clone(),
                    self.store.artifact_ref(&event.spec_location),
                );
                if self.runs.create(&run).await?.is_none() {
                    return Err(LiftifyError::ConcurrentModification {
                        key: event.key.to_string(),
                        expected: "absent".to_string(),
                        found: "existing run".to_string(),
                    });
                }
                info!("Started {} from {}", event.key, event.spec_location);
            }
        }

        self.drive(&event.key).await
    }

    /// Step until the run suspends or terminates
    pub async fn drive(&self, key: &RunKey) -> Result<PipelineRun> {
        loop {
            match self.step(key).await? {
                StepOutcome::Advanced(_) => continue,
                StepOutcome::Suspended(run) | StepOutcome::Terminal(run) => return Ok(run),
            }
        }
    }

    /// Perform the unit of work for the run's current stage
    pub async fn step(&self, key: &RunKey) -> Result<StepOutcome> {
        let current = self.runs.require(key).await?;
        match current.run.stage {
            Stage::Succeeded | Stage::FailedFatal => Ok(StepOutcome::Terminal(current.run)),
            Stage::DeployTestPending => Ok(StepOutcome::Suspended(current.run)),
            Stage::Generating => self.generate(current).await,
            Stage::Validating => self.validate(current).await,
            Stage::Classifying => self.classify(current).await,
        }
    }

    /// Feed a sandbox completion event back into its run
    ///
    /// A resumed run is driven on until it suspends again or terminates.
    pub async fn on_completion(&self, event: &CompletionEvent) -> Result<ResumeOutcome> {
        match self.bridge.resume(event).await? {
            ResumeOutcome::Resumed(run) => Ok(ResumeOutcome::Resumed(self.drive(&run.key).await?)),
            other => Ok(other),
        }
    }

    /// Force an active run into FAILED_FATAL
    pub async fn cancel(&self, key: &RunKey, reason: &str) -> Result<PipelineRun> {
        let current = self.runs.require(key).await?;
        let pending = current.run.pending_job.clone();
        let (committed, actions) = self
            .apply(
                &current,
                Event::Cancelled {
                    reason: reason.to_string(),
                },
            )
            .await?;

        if let Some(job) = pending {
            fail_open("cancel.discard", || self.bridge.discard(&job.job_id)).await;
        }
        self.signal(&committed.run, &actions, None).await?;
        Ok(committed.run)
    }

    /// Fail every run whose sandbox job is past its deadline at `now`
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<PipelineRun>> {
        let mut expired = Vec::new();

        for record in self.bridge.expired(now).await? {
            let key = &record.snapshot.key;
            let current = match self.runs.load(key).await? {
                Some(current)
                    if current.run.stage == Stage::DeployTestPending
                        && current
                            .run
                            .pending_job
                            .as_ref()
                            .is_some_and(|p| p.job_id == record.job_id) =>
                {
                    current
                }
                _ => {
                    debug!("Dropping stale continuation {}", record.job_id);
                    self.bridge.discard(&record.job_id).await?;
                    continue;
                }
            };

            match self.apply(&current, Event::PendingExpired).await {
                Ok((committed, actions)) => {
                    warn!("{} expired waiting on {}", key, record.job_id);
                    fail_open("expire.discard", || self.bridge.discard(&record.job_id)).await;
                    self.signal(&committed.run, &actions, None).await?;
                    expired.push(committed.run);
                }
                Err(LiftifyError::ConcurrentModification { .. }) => {
                    info!("{} moved while expiring {}, skipping", key, record.job_id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(expired)
    }

    async fn generate(&self, current: VersionedRun) -> Result<StepOutcome> {
        let run = &current.run;
        let spec = self.read_text(&run.spec.path).await?.ok_or_else(|| {
            LiftifyError::InputShape(format!("specification {} is missing", run.spec))
        })?;

        let (prior_code, failure_log) = match &run.repair {
            Some(repair) => {
                let prior = self.read_bundle(&repair.prior_bundle.path).await?;
                let log = self
                    .read_text(&repair.failure_log.path)
                    .await?
                    .unwrap_or_default();
                (Some(prior), Some(log))
            }
            None => (None, None),
        };

        let request = GenerationRequest {
            key: run.key.clone(),
            attempt: run.retry_count,
            spec,
            prior_code,
            failure_log,
        };
        info!(
            "{}: generating (attempt {}{})",
            run.key,
            run.retry_count + 1,
            if request.is_repair() { ", repair" } else { "" }
        );

        let bundle = retry_transient("generator.generate", self.config.retry, || {
            self.generator.generate(&request)
        })
        .await?;
        if bundle.is_empty() {
            return Err(LiftifyError::Collaborator(format!(
                "{}: generator returned an empty bundle",
                run.key
            )));
        }

        let bundle_ref = self
            .write(&bundle_path(&run.key), bundle.to_json_bytes()?, CONTENT_TYPE_JSON)
            .await?;
        let (committed, actions) = self
            .apply(&current, Event::CodeGenerated { bundle: bundle_ref })
            .await?;
        self.signal(&committed.run, &actions, None).await?;
        Ok(StepOutcome::Advanced(committed.run))
    }

    async fn validate(&self, current: VersionedRun) -> Result<StepOutcome> {
        let run = &current.run;
        let bundle_ref = run.last_artifact.clone().ok_or_else(|| {
            LiftifyError::InvalidTransition(format!("{} is validating without a bundle", run.key))
        })?;
        let bundle = self.read_bundle(&bundle_ref.path).await?;

        let raw = retry_transient("validator.validate", self.config.retry, || {
            self.validator.validate(&run.key, &bundle)
        })
        .await?;
        let lint_ref = self
            .write(&lint_log_path(&run.key), raw.clone().into_bytes(), CONTENT_TYPE_TEXT)
            .await?;

        let classified = self.classifier.classify(Some(&raw));
        if classified.outcome.is_failure() {
            for line in &classified.failing_lines {
                debug!("{}: {}", run.key, line);
            }
            let (committed, actions) = self
                .apply(&current, Event::ValidationFailed { log: lint_ref })
                .await?;
            self.signal(&committed.run, &actions, None).await?;
            return Ok(StepOutcome::Advanced(committed.run));
        }

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.config.pending_expiry)
            .ok_or_else(|| {
                LiftifyError::Config(format!(
                    "pending expiry of {}s is out of range",
                    self.config.pending_expiry.num_seconds()
                ))
            })?;
        let job = PendingJob {
            job_id: JobId::generate(),
            token: ContinuationToken::issue(),
            suspended_at: now,
            expires_at,
        };
        self.bridge
            .suspend(&job.job_id, &job.token, RunSnapshot::of(run), job.expires_at)
            .await?;

        let job_id = job.job_id.clone();
        let log_path = test_log_path(&run.key, &job_id);
        let (committed, actions) = match self.apply(&current, Event::ValidationClean { job }).await
        {
            Ok(committed) => committed,
            Err(e) => {
                fail_open("validate.discard", || self.bridge.discard(&job_id)).await;
                return Err(e);
            }
        };

        let launch = LaunchRequest {
            job_id,
            key: run.key.clone(),
            bundle,
            bundle_ref,
            log_path,
        };
        self.signal(&committed.run, &actions, Some(&launch)).await?;
        Ok(StepOutcome::Advanced(committed.run))
    }

    async fn classify(&self, current: VersionedRun) -> Result<StepOutcome> {
        let run = &current.run;
        let report = run.last_test.clone().ok_or_else(|| {
            LiftifyError::InvalidTransition(format!("{} is classifying without a test report", run.key))
        })?;

        let event = if report.outcome.is_failure() {
            let log = match report.log.clone() {
                Some(log) => log,
                None => {
                    let note = format!(
                        "error: sandbox job {} finished {} without a test log{}\n",
                        report.job_id,
                        report.job_status,
                        report
                            .logs_url
                            .as_ref()
                            .map(|url| format!(" (console: {})", url))
                            .unwrap_or_default()
                    );
                    self.write(&failure_note_path(&run.key), note.into_bytes(), CONTENT_TYPE_TEXT)
                        .await?
                }
            };
            Event::TestsFailed { log }
        } else {
            let bundle_ref = run.last_artifact.clone().ok_or_else(|| {
                LiftifyError::InvalidTransition(format!("{} passed tests without a bundle", run.key))
            })?;
            let bundle = self.read_bundle(&bundle_ref.path).await?;
            Event::TestsClean {
                published: self.publish(&run.key, &bundle).await?,
            }
        };

        let (committed, actions) = self.apply(&current, event).await?;
        self.signal(&committed.run, &actions, None).await?;
        Ok(StepOutcome::Advanced(committed.run))
    }

    /// Copy a passing bundle to the published location
    async fn publish(&self, key: &RunKey, bundle: &CodeBundle) -> Result<ArtifactRef> {
        for (name, content) in &bundle.files {
            self.write(
                &published_path(key, name),
                content.clone().into_bytes(),
                CONTENT_TYPE_TEXT,
            )
            .await?;
        }
        self.write(
            &published_path(key, BUNDLE_FILE),
            bundle.to_json_bytes()?,
            CONTENT_TYPE_JSON,
        )
        .await
    }

    /// Compute and commit the transition for `event`
    async fn apply(
        &self,
        current: &VersionedRun,
        event: Event,
    ) -> Result<(VersionedRun, Vec<Action>)> {
        let transition = self.machine.transition(&current.run, event, Utc::now())?;
        let committed = self.runs.commit(current, &transition.run).await?;
        info!(
            "{}: {} -> {} (retry {}/{})",
            committed.run.key,
            current.run.stage,
            committed.run.stage,
            committed.run.retry_count,
            self.machine.retry_ceiling()
        );
        Ok((committed, transition.actions))
    }

    /// Perform the side effects of a committed transition
    async fn signal(
        &self,
        run: &PipelineRun,
        actions: &[Action],
        launch: Option<&LaunchRequest>,
    ) -> Result<()> {
        for action in actions {
            match action {
                Action::LogActivity { message } => debug!("{}", message),
                Action::NotifyTerminal => self.notify(run).await,
                Action::LaunchSandbox { job_id } => {
                    let request = launch.filter(|r| &r.job_id == job_id).ok_or_else(|| {
                        LiftifyError::InvalidTransition(format!(
                            "{}: no launch request for {}",
                            run.key, job_id
                        ))
                    })?;
                    if let Err(e) = retry_transient("sandbox.launch", self.config.retry, || {
                        self.sandbox.launch(request)
                    })
                    .await
                    {
                        error!(
                            "{}: failed to launch {}, run stays pending until it expires: {}",
                            run.key, job_id, e
                        );
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn notify(&self, run: &PipelineRun) {
        let report = TerminalReport::from_run(run);
        info!("{}", report.summary());
        for notifier in &self.notifiers {
            let name = format!("notify::{}", notifier.name());
            fail_open(&name, || notifier.notify(&report)).await;
        }
    }

    async fn read_text(&self, path: &str) -> Result<Option<String>> {
        retry_transient("store.get_text", self.config.retry, || {
            self.store.get_text(path)
        })
        .await
    }

    async fn read_bundle(&self, path: &str) -> Result<CodeBundle> {
        let data = retry_transient("store.get", self.config.retry, || self.store.get(path)).await?;
        CodeBundle::from_json_bytes(&data)
    }

    async fn write(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<ArtifactRef> {
        let data = Bytes::from(data);
        retry_transient("store.write", self.config.retry, || {
            self.store.write(path, data.clone(), content_type)
        })
        .await
    }
}
