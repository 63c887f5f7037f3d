//! Git publication sink
//!
//! On SUCCEEDED the published bundle is copied into `{tenant}/{service}/` of a
//! git work tree, committed, and pushed when a remote is configured. Failed
//! runs are ignored. Like every sink it runs fail-open after the terminal
//! commit, so a push failure never touches the run.

use async_trait::async_trait;
use liftify_core::config::VcsConfig;
use liftify_core::paths::{published_path, BUNDLE_FILE};
use liftify_core::{CodeBundle, LiftifyError, Result, Stage, TerminalReport};
use liftify_store::ArtifactStore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::collaborators::Notifier;
use crate::command::materialize_bundle;

/// Commits published code of succeeded runs to a git work tree
pub struct GitPushNotifier {
    store: Arc<dyn ArtifactStore>,
    work_tree: PathBuf,
    remote: Option<String>,
    branch: String,
}

impl GitPushNotifier {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        work_tree: impl Into<PathBuf>,
        remote: Option<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            store,
            work_tree: work_tree.into(),
            remote,
            branch: branch.into(),
        }
    }

    /// `None` when no work tree is configured
    pub fn from_config(config: &VcsConfig, store: Arc<dyn ArtifactStore>) -> Option<Self> {
        let work_tree = config.work_tree.clone()?;
        Some(Self::new(
            store,
            work_tree,
            config.remote.clone(),
            config.branch.clone(),
        ))
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("git {}", args.join(" "));
        Command::new("git")
            .arg("-C")
            .arg(&self.work_tree)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| LiftifyError::Collaborator(format!("failed to run git: {}", e)))
    }

    async fn git_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.git(args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(LiftifyError::Collaborator(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn relative_dir(tenant: &str, service: &str) -> String {
    Path::new(tenant).join(service).to_string_lossy().into_owned()
}

#[async_trait]
impl Notifier for GitPushNotifier {
    fn name(&self) -> &str {
        "git"
    }

    #[instrument(skip(self, report), fields(key = %report.key))]
    async fn notify(&self, report: &TerminalReport) -> Result<()> {
        if report.stage != Stage::Succeeded {
            debug!("{} did not succeed, nothing to publish", report.key);
            return Ok(());
        }

        let data = self
            .store
            .get(&published_path(&report.key, BUNDLE_FILE))
            .await?;
        let bundle = CodeBundle::from_json_bytes(&data)?;

        let relative = relative_dir(&report.key.tenant, &report.key.service);
        materialize_bundle(&self.work_tree.join(&relative), &bundle).await?;
        self.git_ok(&["add", "-A", "--", &relative]).await?;

        // exit 0: nothing staged
        let staged = self
            .git(&["diff", "--cached", "--quiet", "--", &relative])
            .await?;
        if staged.status.success() {
            info!("{}: published code unchanged, nothing to commit", report.key);
            return Ok(());
        }

        let message = format!(
            "Publish {} ({} after {} regenerations)",
            report.key, report.stage, report.retry_count
        );
        self.git_ok(&["commit", "-m", &message, "--", &relative])
            .await?;

        if let Some(remote) = &self.remote {
            let refspec = format!("HEAD:refs/heads/{}", self.branch);
            self.git_ok(&["push", remote, &refspec]).await?;
            info!("{}: pushed to {} {}", report.key, remote, self.branch);
        } else {
            info!("{}: committed to {}", report.key, self.work_tree.display());
        }
        Ok(())
    }
}
