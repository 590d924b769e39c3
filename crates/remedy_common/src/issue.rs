//! Issues: tracked, deduplicated rule violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rule::Severity;
use crate::target::{Target, TargetType};

pub type IssueId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Acknowledged,
    Resolving,
    Resolved,
}

impl IssueState {
    /// Open, acknowledged and resolving issues all occupy the dedup slot
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for IssueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueState {
    type Err = crate::error::RemedyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolving" => Ok(Self::Resolving),
            "resolved" => Ok(Self::Resolved),
            other => Err(crate::error::RemedyError::InvalidRequest(format!(
                "unknown issue state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub target_type: TargetType,
    pub target_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
    pub state: IssueState,
}

impl Issue {
    pub fn new(
        target: &Target,
        rule_id: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_type: target.target_type,
            target_id: target.target_id.clone(),
            rule_id: rule_id.into(),
            severity,
            description: description.into(),
            detected_at,
            last_seen_at: detected_at,
            resolved_at: None,
            auto_resolved: false,
            state: IssueState::Open,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.target_type, self.target_id.clone())
    }
}

/// Selection criteria for issue listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilter {
    /// Also list acknowledged and resolving issues
    #[serde(default)]
    pub include_acknowledged: bool,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub target_id: Option<String>,
}

impl IssueFilter {
    pub fn with_acknowledged() -> Self {
        Self {
            include_acknowledged: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        let state_ok = match issue.state {
            IssueState::Open => true,
            IssueState::Acknowledged | IssueState::Resolving => self.include_acknowledged,
            IssueState::Resolved => false,
        };
        state_ok
            && self.min_severity.map_or(true, |min| issue.severity >= min)
            && self.target_type.map_or(true, |t| issue.target_type == t)
            && self
                .target_id
                .as_deref()
                .map_or(true, |id| issue.target_id == id)
    }
}

/// Outcome of one rule evaluation, as stored in the health check log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Holds,
    Clear,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holds => "holds",
            Self::Clear => "clear",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for CheckStatus {
    type Err = crate::error::RemedyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holds" => Ok(Self::Holds),
            "clear" => Ok(Self::Clear),
            "unknown" => Ok(Self::Unknown),
            other => Err(crate::error::RemedyError::InvalidRequest(format!(
                "unknown check status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub target_type: TargetType,
    pub target_id: String,
    pub rule_id: String,
    pub status: CheckStatus,
    /// Latest value the rule looked at, if any
    pub observed: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(state: IssueState, severity: Severity) -> Issue {
        let mut issue = Issue::new(
            &Target::container("c1"),
            "cpu_sustained_80",
            severity,
            "cpu",
            Utc::now(),
        );
        issue.state = state;
        issue
    }

    #[test]
    fn test_default_filter_only_open() {
        let filter = IssueFilter::default();
        assert!(filter.matches(&issue(IssueState::Open, Severity::Low)));
        assert!(!filter.matches(&issue(IssueState::Acknowledged, Severity::Low)));
        assert!(!filter.matches(&issue(IssueState::Resolved, Severity::Low)));
    }

    #[test]
    fn test_filter_with_acknowledged_and_severity() {
        let filter = IssueFilter {
            include_acknowledged: true,
            min_severity: Some(Severity::High),
            ..IssueFilter::default()
        };
        assert!(filter.matches(&issue(IssueState::Resolving, Severity::Critical)));
        assert!(!filter.matches(&issue(IssueState::Acknowledged, Severity::Medium)));
    }
}
