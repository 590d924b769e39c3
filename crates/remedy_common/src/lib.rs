//! Shared types for the remedy issue detection and remediation engine.
//!
//! This crate holds the data model (targets, samples, rules, issues,
//! actions, wizard sessions), the error taxonomy and the daemon
//! configuration. The engine itself lives in `remedyd`.

pub mod action;
pub mod config;
pub mod error;
pub mod issue;
pub mod rule;
pub mod target;
pub mod wizard;

pub use action::{ActionKind, ActionOutcome, ActionQuery, ActionRecord, Parameters, Suggestion};
pub use config::Config;
pub use error::{ErrorKind, RemedyError, Result};
pub use issue::{CheckStatus, HealthCheckResult, Issue, IssueFilter, IssueId, IssueState};
pub use rule::{Comparator, Rule, RuleCondition, Severity};
pub use target::{Sample, Target, TargetType};
pub use wizard::{
    Choice, FailureReason, InspectionView, SelectedAction, SelectionOutcome, SessionId,
    SessionView, Transition, WizardOption, WizardState,
};

/// Metric names produced by the bundled collectors
pub mod metrics {
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const SWAP_PERCENT: &str = "swap_percent";
    pub const DISK_PERCENT: &str = "disk_percent";
    pub const LOAD_1M: &str = "load_1m";
    /// One sample per observed restart-count increase; value is the delta
    pub const RESTARTS: &str = "restarts";
    pub const HEALTH_FAILING: &str = "health_failing";
    pub const RUNNING: &str = "running";
    pub const ACTIVE: &str = "active";
}
