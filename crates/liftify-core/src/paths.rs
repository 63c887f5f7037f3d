//! Deterministic artifact path naming
//!
//! Every artifact of a run lives under `{tenant}/{service}/{date}/{stage}/{artifact}`.
//! Re-running a stage writes to the same key, so retries overwrite instead of
//! accumulating objects.

use crate::{JobId, LiftifyError, Result, RunKey};

/// File name of a generated bundle
pub const BUNDLE_FILE: &str = "bundle.json";
/// Static validator output
pub const LINT_LOG_FILE: &str = "lint.log";
/// Acceptance test output written by the sandbox runner
pub const TEST_LOG_FILE: &str = "test-output.log";
/// Note written when a test failure has no log to feed back
pub const FAILURE_NOTE_FILE: &str = "failure.log";
/// Persisted run record
pub const RUN_STATE_FILE: &str = "state.json";
/// Terminal report written by the report sink
pub const TERMINAL_REPORT_FILE: &str = "terminal.json";

/// Prefix under which continuation records are stored, keyed by job id
pub const CONTINUATION_PREFIX: &str = "_continuations/";

/// Stage directory names used in artifact paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageDir {
    Run,
    Generate,
    Validate,
    Sandbox,
    Classify,
    Published,
    Report,
}

impl StageDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Generate => "generate",
            Self::Validate => "validate",
            Self::Sandbox => "sandbox",
            Self::Classify => "classify",
            Self::Published => "published",
            Self::Report => "report",
        }
    }
}

/// Path of an artifact produced by `stage` for `key`
pub fn artifact_path(key: &RunKey, stage: StageDir, artifact: &str) -> String {
    format!("{}/{}/{}", key.prefix(), stage.as_str(), artifact)
}

pub fn run_state_path(key: &RunKey) -> String {
    artifact_path(key, StageDir::Run, RUN_STATE_FILE)
}

pub fn bundle_path(key: &RunKey) -> String {
    artifact_path(key, StageDir::Generate, BUNDLE_FILE)
}

pub fn lint_log_path(key: &RunKey) -> String {
    artifact_path(key, StageDir::Validate, LINT_LOG_FILE)
}

/// Test log of one sandbox job; every job gets its own log
pub fn test_log_path(key: &RunKey, job_id: &JobId) -> String {
    artifact_path(
        key,
        StageDir::Sandbox,
        &format!("{}/{}", job_id.as_str(), TEST_LOG_FILE),
    )
}

pub fn failure_note_path(key: &RunKey) -> String {
    artifact_path(key, StageDir::Classify, FAILURE_NOTE_FILE)
}

pub fn published_path(key: &RunKey, artifact: &str) -> String {
    artifact_path(key, StageDir::Published, artifact)
}

pub fn terminal_report_path(key: &RunKey) -> String {
    artifact_path(key, StageDir::Report, TERMINAL_REPORT_FILE)
}

/// Path of the continuation record for a sandbox job
pub fn continuation_path(job_id: &JobId) -> Result<String> {
    let id = job_id.as_str();
    if id.is_empty() || id.contains('/') || id == "." || id == ".." {
        return Err(LiftifyError::InputShape(format!(
            "job id '{}' is not a valid path segment",
            id
        )));
    }
    Ok(format!("{}{}.json", CONTINUATION_PREFIX, id))
}
