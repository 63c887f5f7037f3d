//! Persisted run records
//!
//! One JSON document per run at `{key}/run/state.json`. Every write is a
//! compare-and-swap against the version the caller read, so two workers racing
//! on the same run cannot both advance it.

use liftify_core::paths::run_state_path;
use liftify_core::{retry_transient, LiftifyError, PipelineRun, Result, RetryPolicy, RunKey};
use liftify_store::{get_json, put_json, ArtifactStore, WritePrecondition, WriteResult};
use std::sync::Arc;
use tracing::debug;

/// Run record together with the store version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRun {
    pub run: PipelineRun,
    pub version: String,
}

/// Load and commit run records with optimistic concurrency
#[derive(Clone)]
pub struct RunStore {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl RunStore {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Current record for `key`, `None` if the run was never created
    pub async fn load(&self, key: &RunKey) -> Result<Option<VersionedRun>> {
        let path = run_state_path(key);
        let loaded: Option<(PipelineRun, String)> =
            retry_transient("run_store.load", self.retry, || get_json(self.store.as_ref(), &path))
                .await?;
        Ok(loaded.map(|(run, version)| VersionedRun { run, version }))
    }

    /// Like `load`, but a missing run is `NotFound`
    pub async fn require(&self, key: &RunKey) -> Result<VersionedRun> {
        self.load(key)
            .await?
            .ok_or_else(|| LiftifyError::NotFound(format!("no run for {}", key)))
    }

    /// Persist a new run; `None` if a run with this key already exists
    pub async fn create(&self, run: &PipelineRun) -> Result<Option<VersionedRun>> {
        let path = run_state_path(&run.key);
        let result = retry_transient("run_store.create", self.retry, || {
            put_json(self.store.as_ref(), &path, run, WritePrecondition::DoesNotExist)
        })
        .await?;

        match result {
            WriteResult::Success { version } => {
                debug!("Created run {} at version {}", run.key, version);
                Ok(Some(VersionedRun {
                    run: run.clone(),
                    version,
                }))
            }
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Replace `current` with `next`
    ///
    /// Fails with `ConcurrentModification` if the record changed since
    /// `current` was read, and with `InvalidTransition` if `next` would move
    /// the retry counter backwards or rewrite a terminal run.
    pub async fn commit(&self, current: &VersionedRun, next: &PipelineRun) -> Result<VersionedRun> {
        if current.run.is_terminal() {
            return Err(LiftifyError::RunTerminal(format!(
                "{} is already {}",
                current.run.key, current.run.stage
            )));
        }
        if next.key != current.run.key || next.retry_count < current.run.retry_count {
            return Err(LiftifyError::InvalidTransition(format!(
                "refusing to commit {} over {}",
                next.key, current.run.key
            )));
        }

        let path = run_state_path(&next.key);
        let precondition = WritePrecondition::MatchesVersion(current.version.clone());
        let result = retry_transient("run_store.commit", self.retry, || {
            put_json(self.store.as_ref(), &path, next, precondition.clone())
        })
        .await?;

        match result {
            WriteResult::Success { version } => {
                debug!(
                    "Committed {} revision {} ({})",
                    next.key, next.revision, next.stage
                );
                Ok(VersionedRun {
                    run: next.clone(),
                    version,
                })
            }
            WriteResult::PreconditionFailed { current_version } => {
                Err(LiftifyError::ConcurrentModification {
                    key: next.key.to_string(),
                    expected: current.version.clone(),
                    found: current_version,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftify_core::{ArtifactRef, Stage};
    use liftify_store::MemoryStore;

    fn run_store() -> RunStore {
        RunStore::new(Arc::new(MemoryStore::new()), RetryPolicy::none())
    }

    fn new_run() -> PipelineRun {
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        PipelineRun::new(key, ArtifactRef::new("memory", "acme/shop/20250101/spec.txt"))
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let runs = run_store();
        let run = new_run();
        assert!(runs.load(&run.key).await.unwrap().is_none());

        let created = runs.create(&run).await.unwrap().unwrap();
        let loaded = runs.require(&run.key).await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_create_twice_returns_none() {
        let runs = run_store();
        let run = new_run();
        runs.create(&run).await.unwrap();
        assert!(runs.create(&run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_commit_is_rejected() {
        let runs = run_store();
        let run = new_run();
        let first = runs.create(&run).await.unwrap().unwrap();

        let mut next = run.clone();
        next.stage = Stage::Validating;
        next.revision = 1;
        runs.commit(&first, &next).await.unwrap();

        // Second writer still holds the original version
        let result = runs.commit(&first, &next).await;
        assert!(matches!(
            result,
            Err(LiftifyError::ConcurrentModification { .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_rejects_retry_regression() {
        let runs = run_store();
        let mut run = new_run();
        run.retry_count = 2;
        let current = runs.create(&run).await.unwrap().unwrap();

        let mut next = run.clone();
        next.retry_count = 1;
        assert!(matches!(
            runs.commit(&current, &next).await,
            Err(LiftifyError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_run_is_never_rewritten() {
        let runs = run_store();
        let mut run = new_run();
        run.stage = Stage::Succeeded;
        let current = runs.create(&run).await.unwrap().unwrap();

        let mut next = run.clone();
        next.stage = Stage::Generating;
        assert!(matches!(
            runs.commit(&current, &next).await,
            Err(LiftifyError::RunTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_require_missing_is_not_found() {
        let runs = run_store();
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        assert!(matches!(
            runs.require(&key).await,
            Err(LiftifyError::NotFound(_))
        ));
    }
}
