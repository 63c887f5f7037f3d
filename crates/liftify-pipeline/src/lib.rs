//! # liftify-pipeline
//!
//! The self-correcting generate/validate/deploy loop.
//!
//! A run moves GENERATING -> VALIDATING -> DEPLOY_TEST_PENDING -> CLASSIFYING and
//! ends in SUCCEEDED or FAILED_FATAL. Any failed check sends the run back to
//! GENERATING with the failing log attached, until the retry ceiling is hit.
//!
//! This crate provides:
//! - `PipelineOrchestrator`: drives runs one committed step at a time
//! - `CompletionBridge`: suspends runs on sandbox jobs and resumes them
//! - `FailureClassifier`: rule-table classification of tool output
//! - Collaborator traits plus HTTP, shell-command, git and notification adapters

mod bridge;
mod classifier;
mod collaborators;
mod command;
mod generator;
mod notify;
mod orchestrator;
mod run_store;
mod state_machine;
mod vcs;

pub use bridge::{CompletionBridge, ContinuationRecord, ResumeOutcome, RunSnapshot};
pub use classifier::{ClassifiedLog, FailureClassifier, RuleTable};
pub use collaborators::{
    CodeGenerator, Collaborators, GenerationRequest, LaunchRequest, Notifier, SandboxRunner,
    StaticValidator,
};
pub use command::{
    materialize_bundle, run_command, CommandOutput, CommandSandboxRunner, CommandValidator,
};
pub use generator::{strip_code_fences, HttpGenerator};
pub use notify::{ActivityNotifier, LogNotifier, ReportNotifier};
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator, StepOutcome};
pub use run_store::{RunStore, VersionedRun};
pub use state_machine::{Action, Event, StateMachine, Transition};
pub use vcs::GitPushNotifier;
