//! Configuration management for Liftify
//!
//! This module provides the repository-level pipeline settings: retry ceiling,
//! pending-job expiry, transient retry policy, classifier rule table, and the
//! commands and endpoints used by the collaborator adapters.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{LiftifyError, Result};

/// Repository-level Liftify configuration
///
/// Loaded from `.liftify/config.toml` in the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiftifyConfig {
    /// Retry ceiling and expiry
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Call-site retry policy for transient dependency failures
    #[serde(default)]
    pub transient: TransientConfig,

    /// Failure classifier rule table
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Static validation commands
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Sandbox deploy-and-test command
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Code generation service
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Artifact store location
    #[serde(default)]
    pub store: StoreConfig,

    /// Git publication of succeeded runs
    #[serde(default)]
    pub vcs: VcsConfig,
}

/// Pipeline state machine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum regeneration cycles before a run fails fatally
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Seconds a run may stay in DEPLOY_TEST_PENDING before it is expired
    #[serde(default = "default_pending_expiry_secs")]
    pub pending_expiry_secs: u64,
}

/// Transient retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientConfig {
    /// Attempts per collaborator call (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base backoff; attempt `n` waits `backoff_ms * n`
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

/// Versioned marker table for the failure classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Bumped whenever the marker lists change
    #[serde(default = "default_rules_version")]
    pub version: u32,

    /// Case-insensitive patterns that mark a line as failing
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,

    /// Case-insensitive patterns that excuse a failing line
    #[serde(default = "default_benign_markers")]
    pub benign_markers: Vec<String>,
}

/// Static validation commands, run in order inside the bundle directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_validator_commands")]
    pub commands: Vec<String>,

    /// Directory under which per-run work directories are created
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

/// Sandbox deploy-and-test command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_command")]
    pub command: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

/// Code generation service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Endpoint accepting generation requests
    #[serde(default = "default_generator_endpoint")]
    pub endpoint: String,

    /// Environment variable containing the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
}

/// Artifact store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

/// Git publication of succeeded runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Work tree receiving published code; publication is off when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_tree: Option<PathBuf>,

    /// Remote pushed after each commit; commits stay local when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    #[serde(default = "default_vcs_branch")]
    pub branch: String,
}

/// Longest a run may wait on one sandbox job (30 days)
pub const MAX_PENDING_EXPIRY_SECS: u64 = 30 * 24 * 60 * 60;

// Default value providers
fn default_retry_ceiling() -> u32 {
    3
}

fn default_pending_expiry_secs() -> u64 {
    4 * 60 * 60
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_rules_version() -> u32 {
    1
}

fn default_failure_markers() -> Vec<String> {
    vec!["error".to_string()]
}

fn default_benign_markers() -> Vec<String> {
    vec!["go-multierror".to_string()]
}

fn default_validator_commands() -> Vec<String> {
    vec![
        "terraform init -backend=false -input=false -no-color".to_string(),
        "terraform validate -no-color".to_string(),
        "tflint --no-color".to_string(),
    ]
}

fn default_sandbox_command() -> String {
    "go test -timeout 200m -v ./test/...".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".liftify/work")
}

fn default_generator_endpoint() -> String {
    "http://127.0.0.1:8088/v1/generate".to_string()
}

fn default_api_key_env() -> String {
    "LIFTIFY_GENERATOR_TOKEN".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    120
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".liftify/store")
}

fn default_vcs_branch() -> String {
    "main".to_string()
}

impl LiftifyConfig {
    /// Load configuration from `.liftify/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".liftify/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| LiftifyError::Config(format!("Failed to parse config file: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.liftify/config.toml`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(".liftify");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| LiftifyError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.transient.max_attempts == 0 {
            return Err(LiftifyError::Config(
                "transient.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.pending_expiry_secs == 0 {
            return Err(LiftifyError::Config(
                "pipeline.pending_expiry_secs must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.pending_expiry_secs > MAX_PENDING_EXPIRY_SECS {
            return Err(LiftifyError::Config(format!(
                "pipeline.pending_expiry_secs must be at most {}",
                MAX_PENDING_EXPIRY_SECS
            )));
        }
        if self.classifier.failure_markers.is_empty() {
            return Err(LiftifyError::Config(
                "classifier.failure_markers must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn pending_expiry(&self) -> Duration {
        Duration::from_secs(self.pending_expiry_secs)
    }
}

impl TransientConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for LiftifyConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            transient: TransientConfig::default(),
            classifier: ClassifierConfig::default(),
            validator: ValidatorConfig::default(),
            sandbox: SandboxConfig::default(),
            generator: GeneratorConfig::default(),
            store: StoreConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            pending_expiry_secs: default_pending_expiry_secs(),
        }
    }
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            version: default_rules_version(),
            failure_markers: default_failure_markers(),
            benign_markers: default_benign_markers(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            commands: default_validator_commands(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_sandbox_command(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generator_endpoint(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_generator_timeout_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            work_tree: None,
            remote: None,
            branch: default_vcs_branch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = LiftifyConfig::default();
        assert_eq!(config.pipeline.retry_ceiling, 3);
        assert_eq!(config.pipeline.pending_expiry(), Duration::from_secs(14_400));
        assert_eq!(config.classifier.failure_markers, vec!["error"]);
        assert_eq!(config.classifier.benign_markers, vec!["go-multierror"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = LiftifyConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.transient.max_attempts, 3);
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = LiftifyConfig::write_default(dir.path()).unwrap();
        assert!(path.ends_with(".liftify/config.toml"));

        let config = LiftifyConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.pipeline.retry_ceiling, 3);
        assert_eq!(config.validator.commands.len(), 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".liftify")).unwrap();
        std::fs::write(
            dir.path().join(".liftify/config.toml"),
            "[pipeline]\nretry_ceiling = 5\n",
        )
        .unwrap();

        let config = LiftifyConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.pipeline.retry_ceiling, 5);
        assert_eq!(config.pipeline.pending_expiry_secs, 14_400);
        assert_eq!(config.classifier.version, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".liftify")).unwrap();
        std::fs::write(
            dir.path().join(".liftify/config.toml"),
            "[transient]\nmax_attempts = 0\n",
        )
        .unwrap();

        let err = LiftifyConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, LiftifyError::Config(_)));
    }

    #[test]
    fn test_oversized_expiry_rejected() {
        let mut config = LiftifyConfig::default();
        config.pipeline.pending_expiry_secs = 10_000_000_000_000;
        assert!(matches!(config.validate(), Err(LiftifyError::Config(_))));

        config.pipeline.pending_expiry_secs = MAX_PENDING_EXPIRY_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_vcs_section() {
        let config: LiftifyConfig = toml::from_str("[vcs]\nwork_tree = \"deploy-repo\"\n").unwrap();
        assert_eq!(config.vcs.work_tree, Some(PathBuf::from("deploy-repo")));
        assert_eq!(config.vcs.remote, None);
        assert_eq!(config.vcs.branch, "main");
        assert!(LiftifyConfig::default().vcs.work_tree.is_none());
    }
}
