//! Collaborator seams
//!
//! The engine talks to the outside world through three traits:
//! - `MetricsSource` supplies samples on every tick
//! - `DiagnosisProvider` turns an issue into ranked suggestions
//! - `CommandRunner` performs one remediation action
//!
//! Production adapters live in `collectors`, `diagnosis` and `runner`.
//! Tests plug in fakes.

use async_trait::async_trait;
use remedy_common::{ActionKind, ActionRecord, Issue, Result, Rule, Sample, Suggestion, Target};
use std::time::Duration;

// ============================================================================
// Metrics Source
// ============================================================================

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Collect the current samples. Targets with no data are simply absent.
    async fn poll(&self) -> Result<Vec<Sample>>;

    fn name(&self) -> &str;
}

// ============================================================================
// Diagnosis Provider
// ============================================================================

/// Everything the provider gets to look at
#[derive(Debug, Clone)]
pub struct IssueContext {
    pub issue: Issue,
    pub rule: Rule,
    /// Oldest first
    pub recent_samples: Vec<Sample>,
    /// Newest first
    pub recent_actions: Vec<ActionRecord>,
}

impl IssueContext {
    pub fn target(&self) -> Target {
        self.issue.target()
    }

    /// Latest value recorded for a metric
    pub fn latest(&self, metric_name: &str) -> Option<f64> {
        self.recent_samples
            .iter()
            .rev()
            .find(|s| s.metric_name == metric_name)
            .map(|s| s.value)
    }
}

#[async_trait]
pub trait DiagnosisProvider: Send + Sync {
    /// Ordered suggestions, best first
    async fn diagnose(&self, context: &IssueContext) -> Result<Vec<Suggestion>>;
}

// ============================================================================
// Command Runner
// ============================================================================

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one action against a target. Returns captured output on success.
    ///
    /// Dropping the returned future must stop waiting on any child process.
    async fn run(&self, action: &ActionKind, target: &Target, timeout: Duration)
        -> Result<String>;
}
