//! # liftify-core
//!
//! Core types for the Liftify self-correcting infrastructure pipeline.
//!
//! A run is identified by its (tenant, service, run-date) key. Every stage of the
//! pipeline reads the persisted run, does one unit of work, and writes the next
//! state back before anything downstream is signalled.
//!
//! ## Contents
//!
//! - Run, stage and artifact types
//! - Deterministic artifact path naming
//! - Trigger and completion event parsing
//! - Repository configuration
//! - Fail-open and transient-retry helpers

mod error;
mod events;
mod types;

pub mod config;
pub mod paths;
pub mod retry;

pub use config::LiftifyConfig;
pub use error::{LiftifyError, Result};
pub use events::{CompletionEvent, TriggerEvent};
pub use retry::{fail_open, retry_transient, RetryPolicy};
pub use types::*;
