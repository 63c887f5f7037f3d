//! Pure state machine for pipeline control flow
//!
//! No I/O and no async. `transition(run, event)` returns the next run record and
//! the side effects the caller must perform after committing it.
//!
//! Rules:
//! - Terminal runs reject every event with `RunTerminal`
//! - Events that make no sense for the current stage return `InvalidTransition`
//! - `retry_count` only ever increases, and only on a failed check
//! - A failed check with `retry_count >= retry_ceiling` ends the run

use chrono::{DateTime, Utc};
use liftify_core::{
    ArtifactRef, Classification, FailureReason, FailureSource, JobId, LiftifyError, PendingJob,
    PipelineRun, RepairContext, Result, Stage, TestReport,
};

/// Events that drive a run forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Generator produced a bundle and it was stored
    CodeGenerated { bundle: ArtifactRef },
    /// Static validation found no failure; the run suspends on `job`
    ValidationClean { job: PendingJob },
    /// Static validation failed with the given log
    ValidationFailed { log: ArtifactRef },
    /// The sandbox job finished and its log was classified
    TestResultReceived { report: TestReport },
    /// Acceptance tests were clean and the bundle was published
    TestsClean { published: ArtifactRef },
    /// Acceptance tests failed (or left no log); `log` is fed back to the generator
    TestsFailed { log: ArtifactRef },
    /// The pending sandbox job never reported back
    PendingExpired,
    /// Operator cancelled the run
    Cancelled { reason: String },
}

/// Side effects to perform once the transition is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start the acceptance test job with this id
    LaunchSandbox { job_id: JobId },
    /// Send the terminal report to every notifier
    NotifyTerminal,
    /// Log activity
    LogActivity { message: String },
}

/// Next run record plus the actions it implies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub run: PipelineRun,
    pub actions: Vec<Action>,
}

/// Transition rules parameterised by the retry ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    retry_ceiling: u32,
}

impl StateMachine {
    pub fn new(retry_ceiling: u32) -> Self {
        Self { retry_ceiling }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Compute the next run record for `event`
    ///
    /// The returned run carries `revision + 1` and `updated_at = now`.
    /// This function never panics.
    pub fn transition(
        &self,
        run: &PipelineRun,
        event: Event,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if run.is_terminal() {
            return Err(LiftifyError::RunTerminal(format!(
                "{} is already {}",
                run.key, run.stage
            )));
        }

        let mut next = run.clone();
        next.revision = run.revision + 1;
        next.updated_at = now;

        let actions = match (run.stage, event) {
            (Stage::Generating, Event::CodeGenerated { bundle }) => {
                let message = format!(
                    "{}: generated {} (attempt {})",
                    run.key,
                    bundle,
                    run.retry_count + 1
                );
                next.stage = Stage::Validating;
                next.last_artifact = Some(bundle);
                vec![Action::LogActivity { message }]
            }

            (Stage::Validating, Event::ValidationClean { job }) => {
                let job_id = job.job_id.clone();
                next.stage = Stage::DeployTestPending;
                next.last_classification = Some(Classification::Clean);
                next.repair = None;
                next.pending_job = Some(job);
                vec![
                    Action::LogActivity {
                        message: format!("{}: validation clean, launching {}", run.key, job_id),
                    },
                    Action::LaunchSandbox { job_id },
                ]
            }

            (Stage::Validating, Event::ValidationFailed { log }) => self.fail(
                run,
                &mut next,
                log,
                FailureSource::StaticValidation,
                Classification::Failed,
            )?,

            (Stage::DeployTestPending, Event::TestResultReceived { report }) => {
                let pending = run.pending_job.as_ref().ok_or_else(|| {
                    LiftifyError::InvalidTransition(format!(
                        "{} is pending without a job",
                        run.key
                    ))
                })?;
                if pending.job_id != report.job_id {
                    return Err(LiftifyError::InvalidTransition(format!(
                        "{} waits on {}, not {}",
                        run.key, pending.job_id, report.job_id
                    )));
                }
                let message = format!(
                    "{}: {} finished {} ({})",
                    run.key, report.job_id, report.job_status, report.outcome
                );
                next.stage = Stage::Classifying;
                next.pending_job = None;
                next.last_classification = Some(report.outcome);
                next.last_test = Some(report);
                vec![Action::LogActivity { message }]
            }

            (Stage::Classifying, Event::TestsClean { published }) => {
                let message = format!("{}: tests clean, published {}", run.key, published);
                next.stage = Stage::Succeeded;
                next.last_classification = Some(Classification::Clean);
                next.last_artifact = Some(published);
                vec![Action::LogActivity { message }, Action::NotifyTerminal]
            }

            (Stage::Classifying, Event::TestsFailed { log }) => {
                let outcome = run
                    .last_test
                    .as_ref()
                    .map(|t| t.outcome)
                    .filter(|o| o.is_failure())
                    .unwrap_or(Classification::Failed);
                self.fail(run, &mut next, log, FailureSource::AcceptanceTest, outcome)?
            }

            (Stage::DeployTestPending, Event::PendingExpired) => {
                let job_id = run
                    .pending_job
                    .as_ref()
                    .map(|p| p.job_id.clone())
                    .ok_or_else(|| {
                        LiftifyError::InvalidTransition(format!(
                            "{} is pending without a job",
                            run.key
                        ))
                    })?;
                next.stage = Stage::FailedFatal;
                next.pending_job = None;
                next.last_classification = Some(Classification::Indeterminate);
                next.failure_reason = Some(FailureReason::Expired { job_id });
                vec![
                    Action::LogActivity {
                        message: format!("{}: sandbox job expired", run.key),
                    },
                    Action::NotifyTerminal,
                ]
            }

            (_, Event::Cancelled { reason }) => {
                next.stage = Stage::FailedFatal;
                next.pending_job = None;
                next.failure_reason = Some(FailureReason::Cancelled {
                    reason: reason.clone(),
                });
                vec![
                    Action::LogActivity {
                        message: format!("{}: cancelled ({})", run.key, reason),
                    },
                    Action::NotifyTerminal,
                ]
            }

            (stage, event) => {
                return Err(LiftifyError::InvalidTransition(format!(
                    "{}: {:?} is not valid in {}",
                    run.key,
                    EventKind::from(&event),
                    stage
                )));
            }
        };

        Ok(Transition { run: next, actions })
    }

    /// Route a failed check to regeneration or to FAILED_FATAL
    fn fail(
        &self,
        run: &PipelineRun,
        next: &mut PipelineRun,
        log: ArtifactRef,
        source: FailureSource,
        outcome: Classification,
    ) -> Result<Vec<Action>> {
        next.last_classification = Some(outcome);
        next.pending_job = None;

        if run.retry_count >= self.retry_ceiling {
            next.stage = Stage::FailedFatal;
            next.repair = None;
            next.failure_reason = Some(FailureReason::RetryBudgetExhausted {
                retries: run.retry_count,
            });
            return Ok(vec![
                Action::LogActivity {
                    message: format!(
                        "{}: {} after {} retries, giving up",
                        run.key, outcome, run.retry_count
                    ),
                },
                Action::NotifyTerminal,
            ]);
        }

        let prior_bundle = run.last_artifact.clone().ok_or_else(|| {
            LiftifyError::InvalidTransition(format!(
                "{} failed a check without a generated bundle",
                run.key
            ))
        })?;
        next.stage = Stage::Generating;
        next.retry_count = run.retry_count + 1;
        next.repair = Some(RepairContext {
            prior_bundle,
            failure_log: log,
            source,
        });
        Ok(vec![Action::LogActivity {
            message: format!(
                "{}: {} ({:?}), regenerating (retry {}/{})",
                run.key, outcome, source, next.retry_count, self.retry_ceiling
            ),
        }])
    }
}

/// Payload-free event name for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    CodeGenerated,
    ValidationClean,
    ValidationFailed,
    TestResultReceived,
    TestsClean,
    TestsFailed,
    PendingExpired,
    Cancelled,
}

impl From<&Event> for EventKind {
    fn from(event: &Event) -> Self {
        match event {
            Event::CodeGenerated { .. } => Self::CodeGenerated,
            Event::ValidationClean { .. } => Self::ValidationClean,
            Event::ValidationFailed { .. } => Self::ValidationFailed,
            Event::TestResultReceived { .. } => Self::TestResultReceived,
            Event::TestsClean { .. } => Self::TestsClean,
            Event::TestsFailed { .. } => Self::TestsFailed,
            Event::PendingExpired => Self::PendingExpired,
            Event::Cancelled { .. } => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use liftify_core::{ContinuationToken, JobStatus, RunKey};

    fn artifact(path: &str) -> ArtifactRef {
        ArtifactRef::new("memory", path)
    }

    fn new_run() -> PipelineRun {
        let key = RunKey::new("acme", "shop", "20250101").unwrap();
        PipelineRun::new(key, artifact("acme/shop/20250101/spec.txt"))
    }

    fn pending(job: &str) -> PendingJob {
        let now = Utc::now();
        PendingJob {
            job_id: JobId(job.to_string()),
            token: ContinuationToken::issue(),
            suspended_at: now,
            expires_at: now + Duration::hours(4),
        }
    }

    fn report(job: &str, outcome: Classification) -> TestReport {
        TestReport {
            job_id: JobId(job.to_string()),
            job_status: if outcome == Classification::Clean {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            },
            outcome,
            log: Some(artifact("acme/shop/20250101/sandbox/test-output.log")),
            logs_url: None,
        }
    }

    fn step(machine: &StateMachine, run: &PipelineRun, event: Event) -> Transition {
        machine.transition(run, event, Utc::now()).unwrap()
    }

    #[test]
    fn test_happy_path_full_flow() {
        let machine = StateMachine::new(3);
        let run = new_run();

        let t = step(&machine, &run, Event::CodeGenerated { bundle: artifact("b1") });
        assert_eq!(t.run.stage, Stage::Validating);
        assert_eq!(t.run.revision, 1);

        let t = step(&machine, &t.run, Event::ValidationClean { job: pending("job-1") });
        assert_eq!(t.run.stage, Stage::DeployTestPending);
        assert!(t.actions.contains(&Action::LaunchSandbox {
            job_id: JobId("job-1".to_string())
        }));

        let t = step(
            &machine,
            &t.run,
            Event::TestResultReceived { report: report("job-1", Classification::Clean) },
        );
        assert_eq!(t.run.stage, Stage::Classifying);
        assert!(t.run.pending_job.is_none());

        let t = step(&machine, &t.run, Event::TestsClean { published: artifact("pub") });
        assert_eq!(t.run.stage, Stage::Succeeded);
        assert_eq!(t.run.retry_count, 0);
        assert_eq!(t.run.last_artifact, Some(artifact("pub")));
        assert!(t.actions.contains(&Action::NotifyTerminal));
    }

    #[test]
    fn test_validation_failure_regenerates_with_repair_context() {
        let machine = StateMachine::new(3);
        let t = step(&machine, &new_run(), Event::CodeGenerated { bundle: artifact("b1") });
        let t = step(&machine, &t.run, Event::ValidationFailed { log: artifact("lint") });

        assert_eq!(t.run.stage, Stage::Generating);
        assert_eq!(t.run.retry_count, 1);
        let repair = t.run.repair.unwrap();
        assert_eq!(repair.prior_bundle, artifact("b1"));
        assert_eq!(repair.failure_log, artifact("lint"));
        assert_eq!(repair.source, FailureSource::StaticValidation);
    }

    #[test]
    fn test_ceiling_reached_is_fatal() {
        let machine = StateMachine::new(3);
        let mut run = new_run();
        run.stage = Stage::Validating;
        run.retry_count = 3;
        run.last_artifact = Some(artifact("b4"));

        let t = step(&machine, &run, Event::ValidationFailed { log: artifact("lint") });
        assert_eq!(t.run.stage, Stage::FailedFatal);
        assert_eq!(t.run.retry_count, 3);
        assert_eq!(
            t.run.failure_reason,
            Some(FailureReason::RetryBudgetExhausted { retries: 3 })
        );
        assert!(t.actions.contains(&Action::NotifyTerminal));
    }

    #[test]
    fn test_zero_ceiling_fails_on_first_error() {
        let machine = StateMachine::new(0);
        let mut run = new_run();
        run.stage = Stage::Validating;
        run.last_artifact = Some(artifact("b1"));

        let t = step(&machine, &run, Event::ValidationFailed { log: artifact("lint") });
        assert_eq!(t.run.stage, Stage::FailedFatal);
    }

    #[test]
    fn test_failed_tests_regenerate_from_test_log() {
        let machine = StateMachine::new(3);
        let mut run = new_run();
        run.stage = Stage::DeployTestPending;
        run.last_artifact = Some(artifact("b1"));
        run.pending_job = Some(pending("job-1"));

        let t = step(
            &machine,
            &run,
            Event::TestResultReceived { report: report("job-1", Classification::Indeterminate) },
        );
        let t = step(&machine, &t.run, Event::TestsFailed { log: artifact("note") });

        assert_eq!(t.run.stage, Stage::Generating);
        assert_eq!(t.run.retry_count, 1);
        assert_eq!(t.run.last_classification, Some(Classification::Indeterminate));
        assert_eq!(t.run.repair.unwrap().source, FailureSource::AcceptanceTest);
    }

    #[test]
    fn test_result_for_other_job_is_rejected() {
        let machine = StateMachine::new(3);
        let mut run = new_run();
        run.stage = Stage::DeployTestPending;
        run.pending_job = Some(pending("job-1"));

        let result = machine.transition(
            &run,
            Event::TestResultReceived { report: report("job-2", Classification::Clean) },
            Utc::now(),
        );
        assert!(matches!(result, Err(LiftifyError::InvalidTransition(_))));
    }

    #[test]
    fn test_expiry_only_while_pending() {
        let machine = StateMachine::new(3);
        let mut run = new_run();
        assert!(machine
            .transition(&run, Event::PendingExpired, Utc::now())
            .is_err());

        run.stage = Stage::DeployTestPending;
        run.pending_job = Some(pending("job-9"));
        let t = step(&machine, &run, Event::PendingExpired);
        assert_eq!(t.run.stage, Stage::FailedFatal);
        assert_eq!(
            t.run.failure_reason,
            Some(FailureReason::Expired { job_id: JobId("job-9".to_string()) })
        );
    }

    #[test]
    fn test_cancel_from_any_active_stage() {
        let machine = StateMachine::new(3);
        for stage in [
            Stage::Generating,
            Stage::Validating,
            Stage::DeployTestPending,
            Stage::Classifying,
        ] {
            let mut run = new_run();
            run.stage = stage;
            let t = step(&machine, &run, Event::Cancelled { reason: "operator".to_string() });
            assert_eq!(t.run.stage, Stage::FailedFatal);
            assert!(t.actions.contains(&Action::NotifyTerminal));
        }
    }

    #[test]
    fn test_terminal_states_reject_all_events() {
        let machine = StateMachine::new(3);
        for stage in [Stage::Succeeded, Stage::FailedFatal] {
            let mut run = new_run();
            run.stage = stage;
            let result = machine.transition(
                &run,
                Event::Cancelled { reason: "late".to_string() },
                Utc::now(),
            );
            assert!(matches!(result, Err(LiftifyError::RunTerminal(_))));
        }
    }

    #[test]
    fn test_invalid_transition_never_panics() {
        let machine = StateMachine::new(3);
        let run = new_run();
        let result = machine.transition(
            &run,
            Event::TestsClean { published: artifact("pub") },
            Utc::now(),
        );
        assert!(matches!(result, Err(LiftifyError::InvalidTransition(_))));
    }

    #[test]
    fn test_retry_count_never_decreases() {
        let machine = StateMachine::new(5);
        let mut run = new_run();
        let mut last = run.retry_count;
        for _ in 0..5 {
            run = step(&machine, &run, Event::CodeGenerated { bundle: artifact("b") }).run;
            run = step(&machine, &run, Event::ValidationFailed { log: artifact("lint") }).run;
            assert!(run.retry_count > last);
            last = run.retry_count;
        }
        assert_eq!(run.retry_count, 5);
    }
}
