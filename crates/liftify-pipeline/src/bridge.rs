//! Suspend/resume across the asynchronous sandbox boundary
//!
//! Before a sandbox job is launched, the bridge stores a continuation record
//! keyed by the job id. When a completion event arrives it looks the record up,
//! reads and classifies the test log, and commits the outcome into the run at
//! CLASSIFYING. Records are deleted once consumed, so redelivered events find
//! nothing to resume.

use chrono::{DateTime, Utc};
use liftify_core::paths::{continuation_path, test_log_path, CONTINUATION_PREFIX};
use liftify_core::{
    fail_open, retry_transient, ArtifactRef, Classification, CompletionEvent, ContinuationToken,
    JobId, JobStatus, LiftifyError, PipelineRun, Result, RetryPolicy, RunKey, Stage, TestReport,
};
use liftify_store::{get_json, put_json, ArtifactStore, WritePrecondition, WriteResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::FailureClassifier;
use crate::run_store::RunStore;
use crate::state_machine::{Event, StateMachine};

/// Run context captured when the job was launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub key: RunKey,
    pub retry_count: u32,
    pub bundle: Option<ArtifactRef>,
}

impl RunSnapshot {
    pub fn of(run: &PipelineRun) -> Self {
        Self {
            key: run.key.clone(),
            retry_count: run.retry_count,
            bundle: run.last_artifact.clone(),
        }
    }
}

/// Stored association between a sandbox job and the suspended run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationRecord {
    pub job_id: JobId,
    pub token: ContinuationToken,
    pub snapshot: RunSnapshot,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContinuationRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What happened to a completion event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The run was committed at CLASSIFYING (or further, once driven)
    Resumed(PipelineRun),
    /// Non-terminal job status; nothing was consumed
    InProgress(JobStatus),
    /// No continuation exists for the job id
    Orphaned,
    /// The run already moved past this job
    Duplicate,
}

/// Correlates completion events with suspended runs
#[derive(Clone)]
pub struct CompletionBridge {
    store: Arc<dyn ArtifactStore>,
    runs: RunStore,
    classifier: Arc<FailureClassifier>,
    machine: StateMachine,
    retry: RetryPolicy,
}

impl CompletionBridge {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        classifier: Arc<FailureClassifier>,
        machine: StateMachine,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runs: RunStore::new(store.clone(), retry),
            store,
            classifier,
            machine,
            retry,
        }
    }

    /// Persist the continuation for `job_id`
    ///
    /// Calling again with the same token is a no-op; a different token for the
    /// same job id is rejected.
    pub async fn suspend(
        &self,
        job_id: &JobId,
        token: &ContinuationToken,
        snapshot: RunSnapshot,
        expires_at: DateTime<Utc>,
    ) -> Result<ContinuationRecord> {
        let path = continuation_path(job_id)?;
        let record = ContinuationRecord {
            job_id: job_id.clone(),
            token: token.clone(),
            snapshot,
            created_at: Utc::now(),
            expires_at,
        };

        let result = retry_transient("bridge.suspend", self.retry, || {
            put_json(self.store.as_ref(), &path, &record, WritePrecondition::DoesNotExist)
        })
        .await?;

        match result {
            WriteResult::Success { .. } => {
                debug!("Suspended {} on {}", record.snapshot.key, job_id);
                Ok(record)
            }
            WriteResult::PreconditionFailed { current_version } => {
                match self.record(job_id).await? {
                    Some(existing) if existing.token == *token => Ok(existing),
                    _ => Err(LiftifyError::ConcurrentModification {
                        key: path,
                        expected: "absent".to_string(),
                        found: current_version,
                    }),
                }
            }
        }
    }

    /// Stored continuation for `job_id`, if any
    pub async fn record(&self, job_id: &JobId) -> Result<Option<ContinuationRecord>> {
        let path = continuation_path(job_id)?;
        let loaded = retry_transient("bridge.record", self.retry, || {
            get_json::<ContinuationRecord>(self.store.as_ref(), &path)
        })
        .await?;
        Ok(loaded.map(|(record, _)| record))
    }

    /// Consume a completion event
    ///
    /// Idempotent: once a job's outcome has been committed, later deliveries
    /// of the same event are `Orphaned` or `Duplicate` and change nothing.
    pub async fn resume(&self, event: &CompletionEvent) -> Result<ResumeOutcome> {
        if !event.status.is_terminal() {
            debug!("Ignoring {} status {}", event.job_id, event.status);
            return Ok(ResumeOutcome::InProgress(event.status.clone()));
        }

        let Some(record) = self.record(&event.job_id).await? else {
            warn!(
                "Orphaned completion event: no continuation for {} ({})",
                event.job_id, event.status
            );
            return Ok(ResumeOutcome::Orphaned);
        };
        let key = &record.snapshot.key;

        let Some(current) = self.runs.load(key).await? else {
            warn!("Continuation {} points at missing run {}", event.job_id, key);
            self.discard(&event.job_id).await?;
            return Ok(ResumeOutcome::Orphaned);
        };

        let waiting = current.run.stage == Stage::DeployTestPending
            && current
                .run
                .pending_job
                .as_ref()
                .is_some_and(|p| p.job_id == record.job_id && p.token == record.token);
        if !waiting {
            info!(
                "{} no longer waits on {} (stage {}), dropping event",
                key, event.job_id, current.run.stage
            );
            self.discard(&event.job_id).await?;
            return Ok(ResumeOutcome::Duplicate);
        }

        let report = self.test_report(key, event).await?;
        let transition = self.machine.transition(
            &current.run,
            Event::TestResultReceived { report },
            Utc::now(),
        )?;

        let committed = match self.runs.commit(&current, &transition.run).await {
            Ok(committed) => committed,
            Err(LiftifyError::ConcurrentModification { .. }) => {
                info!("{} was resumed concurrently for {}", key, event.job_id);
                return Ok(ResumeOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        };
        info!(
            "Resumed {} from {} at {} ({})",
            key,
            event.job_id,
            committed.run.stage,
            committed
                .run
                .last_classification
                .map(|c| c.to_string())
                .unwrap_or_default()
        );

        fail_open("bridge.discard", || self.discard(&event.job_id)).await;
        Ok(ResumeOutcome::Resumed(committed.run))
    }

    /// Read and classify the job's own test log
    ///
    /// The log location is derived from the stored run key and the job id; an
    /// event never chooses which artifact decides the run.
    async fn test_report(&self, key: &RunKey, event: &CompletionEvent) -> Result<TestReport> {
        let log_path = test_log_path(key, &event.job_id);
        let log = retry_transient("bridge.read_log", self.retry, || {
            self.store.get_text(&log_path)
        })
        .await?;

        let classified = self.classifier.classify(log.as_deref());
        let outcome = match (&event.status, classified.outcome) {
            (JobStatus::Succeeded, outcome) => outcome,
            (_, Classification::Indeterminate) => Classification::Indeterminate,
            _ => Classification::Failed,
        };
        if log.is_none() {
            warn!("{}: test log {} missing for {}", key, log_path, event.job_id);
        }

        Ok(TestReport {
            job_id: event.job_id.clone(),
            job_status: event.status.clone(),
            outcome,
            log: log.map(|_| self.store.artifact_ref(&log_path)),
            logs_url: event.logs_url.clone(),
        })
    }

    /// Delete the continuation for `job_id`; missing records are fine
    pub async fn discard(&self, job_id: &JobId) -> Result<()> {
        let path = continuation_path(job_id)?;
        retry_transient("bridge.discard", self.retry, || self.store.delete(&path)).await
    }

    /// Every stored continuation
    pub async fn pending(&self) -> Result<Vec<ContinuationRecord>> {
        let paths = retry_transient("bridge.list", self.retry, || {
            self.store.list(CONTINUATION_PREFIX)
        })
        .await?;

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match get_json::<ContinuationRecord>(self.store.as_ref(), &path).await {
                Ok(Some((record, _))) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable continuation {}: {}", path, e),
            }
        }
        Ok(records)
    }

    /// Continuations whose deadline has passed at `now`
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ContinuationRecord>> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RuleTable;
    use chrono::Duration;
    use liftify_core::config::ClassifierConfig;
    use liftify_core::PendingJob;
    use liftify_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        bridge: CompletionBridge,
        runs: RunStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bridge = CompletionBridge::new(
            store.clone(),
            Arc::new(FailureClassifier::new(
                RuleTable::from_config(&ClassifierConfig::default()).unwrap(),
            )),
            StateMachine::new(3),
            RetryPolicy::none(),
        );
        let runs = RunStore::new(store.clone(), RetryPolicy::none());
        Fixture { store, bridge, runs }
    }

    /// Persist a run suspended on `job` and its continuation
    async fn suspended_run(f: &Fixture, job: &str) -> PipelineRun {
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        let mut run = PipelineRun::new(key, ArtifactRef::new("memory", "acme/shop/20250101/spec.txt"));
        let now = Utc::now();
        let job_id = JobId(job.to_string());
        let token = ContinuationToken::issue();
        run.stage = Stage::DeployTestPending;
        run.last_artifact = Some(ArtifactRef::new("memory", "acme/shop/20250101/generate/bundle.json"));
        run.pending_job = Some(PendingJob {
            job_id: job_id.clone(),
            token: token.clone(),
            suspended_at: now,
            expires_at: now + Duration::hours(4),
        });
        f.runs.create(&run).await.unwrap();
        f.bridge
            .suspend(&job_id, &token, RunSnapshot::of(&run), now + Duration::hours(4))
            .await
            .unwrap();
        run
    }

    async fn write_log(f: &Fixture, run: &PipelineRun, text: &str) {
        let job_id = &run.pending_job.as_ref().unwrap().job_id;
        f.store
            .write(
                &test_log_path(&run.key, job_id),
                bytes::Bytes::from(text.to_string()),
                "text/plain",
            )
            .await
            .unwrap();
    }

    fn completion(job: &str, status: JobStatus) -> CompletionEvent {
        CompletionEvent::new(JobId(job.to_string()), status)
    }

    #[tokio::test]
    async fn test_resume_clean_run() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;
        write_log(&f, &run, "--- PASS: TestInfraDeployment (120.3s)\nok\n").await;

        let outcome = f.bridge.resume(&completion("job-1", JobStatus::Succeeded)).await.unwrap();
        let ResumeOutcome::Resumed(resumed) = outcome else {
            panic!("expected resume, got {:?}", outcome);
        };
        assert_eq!(resumed.stage, Stage::Classifying);
        assert_eq!(resumed.last_test.unwrap().outcome, Classification::Clean);
        assert!(f.bridge.record(&JobId("job-1".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;
        write_log(&f, &run, "ok\n").await;
        let event = completion("job-1", JobStatus::Succeeded);

        assert!(matches!(
            f.bridge.resume(&event).await.unwrap(),
            ResumeOutcome::Resumed(_)
        ));
        let after_first = f.runs.require(&run.key).await.unwrap();

        assert_eq!(f.bridge.resume(&event).await.unwrap(), ResumeOutcome::Orphaned);
        assert_eq!(f.runs.require(&run.key).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_unknown_job_is_orphaned() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;
        let before = f.runs.require(&run.key).await.unwrap();

        let outcome = f.bridge.resume(&completion("job-404", JobStatus::Failed)).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Orphaned);
        assert_eq!(f.runs.require(&run.key).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_in_progress_status_keeps_continuation() {
        let f = fixture();
        suspended_run(&f, "job-1").await;

        let outcome = f
            .bridge
            .resume(&completion("job-1", JobStatus::InProgress("IN_PROGRESS".into())))
            .await
            .unwrap();
        assert!(matches!(outcome, ResumeOutcome::InProgress(_)));
        assert!(f.bridge.record(&JobId("job-1".into())).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_log_is_indeterminate() {
        let f = fixture();
        suspended_run(&f, "job-1").await;

        let outcome = f.bridge.resume(&completion("job-1", JobStatus::Succeeded)).await.unwrap();
        let ResumeOutcome::Resumed(resumed) = outcome else {
            panic!("expected resume");
        };
        let report = resumed.last_test.unwrap();
        assert_eq!(report.outcome, Classification::Indeterminate);
        assert!(report.log.is_none());
    }

    #[tokio::test]
    async fn test_only_the_job_log_is_classified() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;
        write_log(&f, &run, "--- FAIL: TestInfraDeployment\nError: AccessDenied\n").await;
        f.store
            .write(
                "acme/shop/20250101/spec.txt",
                bytes::Bytes::from_static(b"an s3 bucket\n"),
                "text/plain",
            )
            .await
            .unwrap();

        let value = serde_json::json!({
            "build_id": "job-1",
            "build_status": "SUCCEEDED",
            "log_path": "acme/shop/20250101/spec.txt"
        });
        let event = CompletionEvent::from_json(&value).unwrap();
        let outcome = f.bridge.resume(&event).await.unwrap();
        let ResumeOutcome::Resumed(resumed) = outcome else {
            panic!("expected resume, got {:?}", outcome);
        };
        assert_eq!(resumed.last_classification, Some(Classification::Failed));
        let report = resumed.last_test.unwrap();
        assert_eq!(
            report.log.map(|l| l.path),
            Some(test_log_path(&run.key, &JobId("job-1".into())))
        );
    }

    #[tokio::test]
    async fn test_failed_job_with_clean_log_is_failure() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;
        write_log(&f, &run, "deploy timed out\n").await;

        let outcome = f.bridge.resume(&completion("job-1", JobStatus::Stopped)).await.unwrap();
        let ResumeOutcome::Resumed(resumed) = outcome else {
            panic!("expected resume");
        };
        assert_eq!(resumed.last_classification, Some(Classification::Failed));
    }

    #[tokio::test]
    async fn test_stale_continuation_is_dropped() {
        let f = fixture();
        let run = suspended_run(&f, "job-1").await;

        // Run moved on without consuming the continuation
        let current = f.runs.require(&run.key).await.unwrap();
        let mut next = current.run.clone();
        next.stage = Stage::Classifying;
        next.pending_job = None;
        f.runs.commit(&current, &next).await.unwrap();

        let outcome = f.bridge.resume(&completion("job-1", JobStatus::Succeeded)).await.unwrap();
        assert_eq!(outcome, ResumeOutcome::Duplicate);
        assert!(f.bridge.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspend_same_token_is_noop() {
        let f = fixture();
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        let snapshot = RunSnapshot {
            key,
            retry_count: 0,
            bundle: None,
        };
        let job = JobId("job-7".into());
        let token = ContinuationToken::issue();
        let expires = Utc::now() + Duration::hours(1);

        f.bridge.suspend(&job, &token, snapshot.clone(), expires).await.unwrap();
        f.bridge.suspend(&job, &token, snapshot.clone(), expires).await.unwrap();
        let other = f
            .bridge
            .suspend(&job, &ContinuationToken::issue(), snapshot, expires)
            .await;
        assert!(matches!(other, Err(LiftifyError::ConcurrentModification { .. })));
    }

    #[tokio::test]
    async fn test_expired_filters_by_deadline() {
        let f = fixture();
        suspended_run(&f, "job-1").await;

        assert!(f.bridge.expired(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + Duration::hours(5);
        let expired = f.bridge.expired(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].job_id, JobId("job-1".into()));
    }
}
