//! One remediation session and its guarded state transitions.

use chrono::{DateTime, Utc};
use remedy_common::{
    wizard::{REVIEW_LOGS, VIEW_METRICS},
    FailureReason, Issue, IssueId, RemedyError, Result, SelectedAction, SessionId, SessionView,
    Suggestion, Target, Transition, WizardOption, WizardState,
};
use std::time::Duration;
use uuid::Uuid;

use crate::evaluator::to_chrono;
use crate::executor::CancelHandle;

pub(crate) struct Session {
    pub id: SessionId,
    pub issue_id: IssueId,
    pub target: Target,
    state: WizardState,
    failure: Option<FailureReason>,
    suggestions: Vec<Suggestion>,
    pub selected_action: Option<SelectedAction>,
    pub action_record_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    transitions: Vec<Transition>,
    /// Present while an action is in flight
    pub cancel: Option<CancelHandle>,
}

impl Session {
    pub fn new(issue: &Issue, inactivity: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            issue_id: issue.id,
            target: issue.target(),
            state: WizardState::Idle,
            failure: None,
            suggestions: Vec::new(),
            selected_action: None,
            action_record_id: None,
            started_at: now,
            deadline: now + to_chrono(inactivity),
            transitions: vec![Transition {
                state: WizardState::Idle,
                at: now,
            }],
            cancel: None,
        }
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    pub fn suggestions(&self) -> &[Suggestion] {
        &self.suggestions
    }

    /// Move to `next`, rejecting anything the transition table does not allow
    pub fn advance(&mut self, next: WizardState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(RemedyError::Conflict(format!(
                "session {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.transitions.push(Transition {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Terminate in `Failed`, or `Abandoned` for abandonment reasons
    pub fn finish_unsuccessfully(&mut self, reason: FailureReason) -> Result<()> {
        let next = match reason {
            FailureReason::InactivityTimeout | FailureReason::IssueResolvedElsewhere
                if self.state == WizardState::AwaitingSelection =>
            {
                WizardState::Abandoned
            }
            FailureReason::Cancelled if self.state == WizardState::AwaitingSelection => {
                WizardState::Abandoned
            }
            _ => WizardState::Failed,
        };
        self.advance(next)?;
        self.failure = Some(reason);
        self.cancel = None;
        Ok(())
    }

    pub fn set_suggestions(&mut self, suggestions: Vec<Suggestion>) {
        self.suggestions = suggestions;
    }

    /// Push the inactivity deadline out from now
    pub fn touch(&mut self, inactivity: Duration) {
        self.deadline = Utc::now() + to_chrono(inactivity);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == WizardState::AwaitingSelection && now > self.deadline
    }

    fn options(&self) -> Vec<WizardOption> {
        if !self.transitions.iter().any(|t| t.state == WizardState::Diagnosed) {
            return Vec::new();
        }
        let mut options: Vec<WizardOption> = self
            .suggestions
            .iter()
            .map(|s| WizardOption {
                label: s.label.clone(),
                action_type: Some(s.action_type.clone()),
                confidence: Some(s.confidence),
                executes: true,
            })
            .collect();
        for label in [REVIEW_LOGS, VIEW_METRICS] {
            options.push(WizardOption {
                label: label.to_string(),
                action_type: None,
                confidence: None,
                executes: false,
            });
        }
        options
    }

    pub fn view(&self, stale: bool) -> SessionView {
        SessionView {
            id: self.id,
            issue_id: self.issue_id,
            state: self.state,
            failure: self.failure,
            suggestions: self.suggestions.clone(),
            options: self.options(),
            selected_action: self.selected_action.clone(),
            action_record_id: self.action_record_id,
            started_at: self.started_at,
            deadline: self.deadline,
            transitions: self.transitions.clone(),
            stale,
        }
    }
}
