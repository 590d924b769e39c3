//! Remediation wizard session types.
//!
//! The state machine itself lives in the daemon; this module carries the
//! states, the legal transition table and the views handed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{ActionRecord, Parameters, Suggestion};
use crate::issue::{HealthCheckResult, IssueId};
use crate::target::Sample;

pub type SessionId = Uuid;

/// Label of the standing "review logs" option
pub const REVIEW_LOGS: &str = "review logs";
/// Label of the standing "view metrics" option
pub const VIEW_METRICS: &str = "view metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardState {
    Idle,
    Analyzing,
    Diagnosed,
    AwaitingSelection,
    Executing,
    Validating,
    Resolved,
    Failed,
    Abandoned,
}

impl WizardState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed | Self::Abandoned)
    }

    /// Legal transitions. Anything not listed is a stale or skipping move.
    pub fn can_advance_to(&self, next: WizardState) -> bool {
        use WizardState::*;
        matches!(
            (self, next),
            (Idle, Analyzing)
                | (Analyzing, Diagnosed)
                | (Analyzing, Failed)
                | (Diagnosed, AwaitingSelection)
                | (AwaitingSelection, Executing)
                | (AwaitingSelection, Abandoned)
                | (Executing, Validating)
                | (Executing, Failed)
                | (Validating, Resolved)
                | (Validating, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Analyzing => "analyzing",
            Self::Diagnosed => "diagnosed",
            Self::AwaitingSelection => "awaiting_selection",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for WizardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in `Failed` or `Abandoned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DiagnosisUnavailable,
    ConditionPersists,
    ValidationInconclusive,
    Cancelled,
    InactivityTimeout,
    IssueResolvedElsewhere,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DiagnosisUnavailable => "diagnosis_unavailable",
            Self::ConditionPersists => "condition_persists",
            Self::ValidationInconclusive => "validation_inconclusive",
            Self::Cancelled => "cancelled",
            Self::InactivityTimeout => "inactivity_timeout",
            Self::IssueResolvedElsewhere => "issue_resolved_elsewhere",
        };
        f.write_str(s)
    }
}

/// What the user picked in `AwaitingSelection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Choice {
    /// Index into the provider suggestions
    Suggestion { index: usize },
    /// Suggestion label, or one of the standing option labels
    Label { label: String },
    /// Free-form action not proposed by the provider
    Custom {
        action_type: String,
        #[serde(default)]
        parameters: Parameters,
    },
    ReviewLogs,
    ViewMetrics,
}

/// One entry in the option list shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardOption {
    pub label: String,
    pub action_type: Option<String>,
    pub confidence: Option<f64>,
    /// Standing options never run a command
    pub executes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedAction {
    pub label: String,
    pub action_type: String,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: WizardState,
    pub at: DateTime<Utc>,
}

/// Client-facing snapshot of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub issue_id: IssueId,
    pub state: WizardState,
    pub failure: Option<FailureReason>,
    pub suggestions: Vec<Suggestion>,
    pub options: Vec<WizardOption>,
    pub selected_action: Option<SelectedAction>,
    pub action_record_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub transitions: Vec<Transition>,
    /// Set when the monitor has not completed a poll recently
    #[serde(default)]
    pub stale: bool,
}

impl SessionView {
    pub fn visited(&self, state: WizardState) -> bool {
        self.transitions.iter().any(|t| t.state == state)
    }
}

/// Read-only material returned by the standing options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectionView {
    pub samples: Vec<Sample>,
    pub actions: Vec<ActionRecord>,
    pub health_checks: Vec<HealthCheckResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SelectionOutcome {
    /// An action was accepted and handed to the executor
    Executing { session: SessionView },
    /// A standing option was chosen; the session keeps waiting
    Inspection {
        session: SessionView,
        view: InspectionView,
    },
}

impl SelectionOutcome {
    pub fn session(&self) -> &SessionView {
        match self {
            Self::Executing { session } | Self::Inspection { session, .. } => session,
        }
    }
}
