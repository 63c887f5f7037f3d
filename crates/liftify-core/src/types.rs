//! Core type definitions for Liftify pipeline runs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{LiftifyError, Result};

/// Identity of one pipeline execution: (tenant, service, run-date)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub tenant: String,
    pub service: String,
    pub run_date: String,
}

impl RunKey {
    /// Create a validated run key
    ///
    /// Every segment becomes part of a storage path, so slashes and relative
    /// components are rejected. The run date must start with `YYYYMMDD`.
    pub fn new(
        tenant: impl Into<String>,
        service: impl Into<String>,
        run_date: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            tenant: tenant.into(),
            service: service.into(),
            run_date: run_date.into(),
        };
        validate_segment("tenant", &key.tenant)?;
        validate_segment("service", &key.service)?;
        validate_segment("run date", &key.run_date)?;
        validate_run_date(&key.run_date)?;
        Ok(key)
    }

    /// Storage prefix shared by every artifact of this run
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.service, self.run_date)
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.service, self.run_date)
    }
}

fn validate_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LiftifyError::InputShape(format!("{} must not be empty", name)));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(LiftifyError::InputShape(format!(
            "{} '{}' is not a valid path segment",
            name, value
        )));
    }
    Ok(())
}

fn validate_run_date(value: &str) -> Result<()> {
    let day = value.get(..8).ok_or_else(|| {
        LiftifyError::InputShape(format!("run date '{}' must start with YYYYMMDD", value))
    })?;
    NaiveDate::parse_from_str(day, "%Y%m%d").map_err(|e| {
        LiftifyError::InputShape(format!("run date '{}' is not a calendar date: {}", value, e))
    })?;
    Ok(())
}

/// Pipeline state machine stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Generating,
    Validating,
    DeployTestPending,
    Classifying,
    Succeeded,
    FailedFatal,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedFatal)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generating => write!(f, "GENERATING"),
            Self::Validating => write!(f, "VALIDATING"),
            Self::DeployTestPending => write!(f, "DEPLOY_TEST_PENDING"),
            Self::Classifying => write!(f, "CLASSIFYING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::FailedFatal => write!(f, "FAILED_FATAL"),
        }
    }
}

/// Classified outcome of a validation or test log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Clean,
    Failed,
    /// The expected log artifact was missing
    Indeterminate,
}

impl Classification {
    /// Indeterminate outcomes count as failures, never as clean
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Clean)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "CLEAN"),
            Self::Failed => write!(f, "FAILED"),
            Self::Indeterminate => write!(f, "INDETERMINATE"),
        }
    }
}

/// A named object in a specific artifact store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Identity of the store holding the object
    pub store: String,
    pub path: String,
}

impl ArtifactRef {
    pub fn new(store: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.store, self.path)
    }
}

/// External sandbox job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Allocate a fresh job id before the job is launched
    pub fn generate() -> Self {
        Self(format!("job-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle that lets a completion event resume a suspended step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(pub String);

impl ContinuationToken {
    pub fn issue() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Status reported by the sandbox job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Stopped,
    /// Any non-terminal status, kept verbatim
    InProgress(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress(_))
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.to_uppercase().as_str() {
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "STOPPED" => Self::Stopped,
            _ => Self::InProgress(s),
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.to_string()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::InProgress(raw) => write!(f, "{}", raw),
        }
    }
}

/// A set of generated infrastructure files, keyed by file name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBundle {
    pub files: BTreeMap<String, String>,
}

impl CodeBundle {
    /// Bundle holding a single file
    pub fn single(name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(name.into(), content.into());
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.values().all(|c| c.trim().is_empty())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Which check produced the failing log fed back to the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    StaticValidation,
    AcceptanceTest,
}

/// Context handed to the generator on a regeneration cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairContext {
    pub prior_bundle: ArtifactRef,
    pub failure_log: ArtifactRef,
    pub source: FailureSource,
}

/// Sandbox job the run is suspended on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: JobId,
    pub token: ContinuationToken,
    pub suspended_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a finished sandbox job, merged into the run on resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub job_id: JobId,
    pub job_status: JobStatus,
    pub outcome: Classification,
    pub log: Option<ArtifactRef>,
    #[serde(default)]
    pub logs_url: Option<String>,
}

/// Why a run ended in FAILED_FATAL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    RetryBudgetExhausted { retries: u32 },
    Expired { job_id: JobId },
    Cancelled { reason: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryBudgetExhausted { retries } => {
                write!(f, "retry budget exhausted after {} regenerations", retries)
            }
            Self::Expired { job_id } => write!(f, "sandbox job {} never completed", job_id),
            Self::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

/// Persisted state of one pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub key: RunKey,
    pub stage: Stage,
    /// Regeneration cycles consumed so far
    pub retry_count: u32,
    /// Specification document the run was triggered with
    pub spec: ArtifactRef,
    #[serde(default)]
    pub last_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub repair: Option<RepairContext>,
    #[serde(default)]
    pub pending_job: Option<PendingJob>,
    #[serde(default)]
    pub last_test: Option<TestReport>,
    #[serde(default)]
    pub last_classification: Option<Classification>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    /// Incremented on every committed transition
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Fresh run entering GENERATING
    pub fn new(key: RunKey, spec: ArtifactRef) -> Self {
        let now = Utc::now();
        Self {
            key,
            stage: Stage::Generating,
            retry_count: 0,
            spec,
            last_artifact: None,
            repair: None,
            pending_job: None,
            last_test: None,
            last_classification: None,
            failure_reason: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Summary handed to notification sinks once a run is terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub key: RunKey,
    pub stage: Stage,
    pub retry_count: u32,
    pub last_classification: Option<Classification>,
    pub failure_reason: Option<FailureReason>,
    /// Published bundle on success, last generated bundle on failure
    pub final_artifact: Option<ArtifactRef>,
    pub finished_at: DateTime<Utc>,
}

impl TerminalReport {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            key: run.key.clone(),
            stage: run.stage,
            retry_count: run.retry_count,
            last_classification: run.last_classification,
            failure_reason: run.failure_reason.clone(),
            final_artifact: run.last_artifact.clone(),
            finished_at: run.updated_at,
        }
    }

    /// One-line summary for logs and chat sinks
    pub fn summary(&self) -> String {
        let artifact = self
            .final_artifact
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        match &self.failure_reason {
            Some(reason) => format!(
                "{} {} after {} retries ({}); last classification {}; artifact {}",
                self.key,
                self.stage,
                self.retry_count,
                reason,
                self.last_classification
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                artifact
            ),
            None => format!(
                "{} {} after {} retries; artifact {}",
                self.key, self.stage, self.retry_count, artifact
            ),
        }
    }
}
