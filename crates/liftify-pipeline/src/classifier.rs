//! Failure classification for validator and test logs
//!
//! Two-tier check over free-form tool output:
//! 1. A line matching any failure marker is a candidate failure.
//! 2. The candidate is excused if it also matches a benign marker.
//!
//! The log is FAILED if any candidate survives. A missing log is INDETERMINATE.
//! Markers live in a versioned rule table, never inline.

use liftify_core::config::ClassifierConfig;
use liftify_core::{Classification, LiftifyError, Result};
use regex::{RegexSet, RegexSetBuilder};

/// Cap on failing lines carried in a classification
const MAX_REPORTED_LINES: usize = 20;

/// Versioned failure and benign marker patterns
#[derive(Debug, Clone)]
pub struct RuleTable {
    version: u32,
    failure: RegexSet,
    benign: RegexSet,
}

impl RuleTable {
    /// Compile a rule table; patterns are case-insensitive regular expressions
    pub fn new(version: u32, failure_markers: &[String], benign_markers: &[String]) -> Result<Self> {
        if failure_markers.is_empty() {
            return Err(LiftifyError::Config(
                "classifier needs at least one failure marker".to_string(),
            ));
        }
        Ok(Self {
            version,
            failure: compile(failure_markers)?,
            benign: compile(benign_markers)?,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Self::new(config.version, &config.failure_markers, &config.benign_markers)
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

fn compile(patterns: &[String]) -> Result<RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| LiftifyError::Config(format!("invalid classifier pattern: {}", e)))
}

/// Result of classifying one log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLog {
    pub outcome: Classification,
    /// Lines that matched a failure marker and no benign marker
    pub failing_lines: Vec<String>,
    /// Lines excused by a benign marker
    pub benign_lines: usize,
    pub rules_version: u32,
}

/// Classifies raw logs against a rule table
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: RuleTable,
}

impl FailureClassifier {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }

    /// Classify a log; `None` means the expected log artifact was missing
    pub fn classify(&self, log: Option<&str>) -> ClassifiedLog {
        let Some(text) = log else {
            return ClassifiedLog {
                outcome: Classification::Indeterminate,
                failing_lines: Vec::new(),
                benign_lines: 0,
                rules_version: self.rules.version,
            };
        };

        let mut failing_lines = Vec::new();
        let mut failing = 0usize;
        let mut benign_lines = 0usize;

        for line in text.lines() {
            if !self.rules.failure.is_match(line) {
                continue;
            }
            if self.rules.benign.is_match(line) {
                benign_lines += 1;
                continue;
            }
            failing += 1;
            if failing_lines.len() < MAX_REPORTED_LINES {
                failing_lines.push(line.trim().to_string());
            }
        }

        ClassifiedLog {
            outcome: if failing > 0 {
                Classification::Failed
            } else {
                Classification::Clean
            },
            failing_lines,
            benign_lines,
            rules_version: self.rules.version,
        }
    }
}
