//! Terminal notification sinks
//!
//! The orchestrator calls every sink fail-open after the terminal state is
//! committed. A sink error is logged and never changes the run.

use async_trait::async_trait;
use bytes::Bytes;
use liftify_core::paths::terminal_report_path;
use liftify_core::{Result, Stage, TerminalReport};
use liftify_store::{ArtifactStore, CONTENT_TYPE_JSON};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::collaborators::Notifier;

/// Emits the report summary through `tracing`
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, report: &TerminalReport) -> Result<()> {
        match report.stage {
            Stage::Succeeded => info!("Run finished: {}", report.summary()),
            _ => warn!("Run failed: {}", report.summary()),
        }
        Ok(())
    }
}

/// Writes the report as JSON next to the run's artifacts
pub struct ReportNotifier {
    store: Arc<dyn ArtifactStore>,
}

impl ReportNotifier {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Notifier for ReportNotifier {
    fn name(&self) -> &str {
        "report"
    }

    async fn notify(&self, report: &TerminalReport) -> Result<()> {
        let data = serde_json::to_vec_pretty(report)?;
        self.store
            .write(
                &terminal_report_path(&report.key),
                Bytes::from(data),
                CONTENT_TYPE_JSON,
            )
            .await?;
        Ok(())
    }
}

/// Appends a human-readable entry per finished run to a markdown file
pub struct ActivityNotifier {
    output_path: PathBuf,
}

impl ActivityNotifier {
    /// Log to `activity.md` inside `liftify_dir`
    pub fn new(liftify_dir: PathBuf) -> Self {
        Self {
            output_path: liftify_dir.join("activity.md"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.output_path
    }
}

#[async_trait]
impl Notifier for ActivityNotifier {
    fn name(&self) -> &str {
        "activity"
    }

    async fn notify(&self, report: &TerminalReport) -> Result<()> {
        let mut content = format!(
            "## {} {}\n**Finished**: {}\n**Retries**: {}\n",
            report.key,
            report.stage,
            report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            report.retry_count
        );
        if let Some(reason) = &report.failure_reason {
            content.push_str(&format!("**Reason**: {}\n", reason));
        }
        if let Some(artifact) = &report.final_artifact {
            content.push_str(&format!("**Artifact**: {}\n", artifact));
        }
        content.push_str("\n---\n\n");

        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftify_core::{ArtifactRef, FailureReason, PipelineRun, RunKey};
    use liftify_store::MemoryStore;
    use tempfile::TempDir;

    fn failed_report() -> TerminalReport {
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        let mut run = PipelineRun::new(key, ArtifactRef::new("memory", "acme/shop/20250101/spec.txt"));
        run.stage = Stage::FailedFatal;
        run.retry_count = 3;
        run.failure_reason = Some(FailureReason::RetryBudgetExhausted { retries: 3 });
        TerminalReport::from_run(&run)
    }

    #[tokio::test]
    async fn test_report_notifier_writes_json() {
        let store = Arc::new(MemoryStore::new());
        let notifier = ReportNotifier::new(store.clone());
        let report = failed_report();

        notifier.notify(&report).await.unwrap();
        let stored = store.get(&terminal_report_path(&report.key)).await.unwrap();
        let decoded: TerminalReport = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded, report);
    }

    #[tokio::test]
    async fn test_activity_notifier_appends() {
        let dir = TempDir::new().unwrap();
        let notifier = ActivityNotifier::new(dir.path().join(".liftify"));

        notifier.notify(&failed_report()).await.unwrap();
        notifier.notify(&failed_report()).await.unwrap();

        let content = tokio::fs::read_to_string(notifier.path()).await.unwrap();
        assert_eq!(content.matches("## acme/shop/20250101 FAILED_FATAL").count(), 2);
        assert!(content.contains("**Reason**: retry budget exhausted after 3 regenerations"));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.notify(&failed_report()).await.is_ok());
    }
}
