//! Rule definitions: static conditions checked against a target's samples.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::RemedyError;
use crate::target::TargetType;

/// Issue severity. Declared low-to-high so `Ord` ranks critical highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = RemedyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(RemedyError::InvalidRequest(format!(
                "unknown severity '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    /// Metric compared against a threshold. A zero `sustained_for` only
    /// looks at the latest tick.
    Threshold {
        comparator: Comparator,
        threshold: f64,
        sustained_for: Duration,
    },
    /// Restart events inside the trailing window strictly exceed `max_restarts`
    RestartLoop { max_restarts: u32, window: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    /// `None` applies the rule to every target type
    pub target_type_filter: Option<TargetType>,
    pub metric_name: String,
    pub condition: RuleCondition,
    pub severity: Severity,
    pub description: String,
}

impl Rule {
    pub fn threshold(
        id: impl Into<String>,
        target_type_filter: Option<TargetType>,
        metric_name: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
        sustained_for: Duration,
        severity: Severity,
    ) -> Self {
        let id = id.into();
        let metric_name = metric_name.into();
        let description = format!(
            "{} {} {} sustained for {}s",
            metric_name,
            comparator,
            threshold,
            sustained_for.as_secs()
        );
        Self {
            id,
            target_type_filter,
            metric_name,
            condition: RuleCondition::Threshold {
                comparator,
                threshold,
                sustained_for,
            },
            severity,
            description,
        }
    }

    pub fn restart_loop(
        id: impl Into<String>,
        target_type_filter: Option<TargetType>,
        max_restarts: u32,
        window: Duration,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            target_type_filter,
            metric_name: crate::metrics::RESTARTS.to_string(),
            condition: RuleCondition::RestartLoop {
                max_restarts,
                window,
            },
            severity,
            description: format!(
                "more than {} restarts within {}s",
                max_restarts,
                window.as_secs()
            ),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn applies_to(&self, target_type: TargetType) -> bool {
        self.target_type_filter
            .map(|filter| filter == target_type)
            .unwrap_or(true)
    }

    /// Longest stretch of history the rule looks back over
    pub fn lookback(&self) -> Duration {
        match &self.condition {
            RuleCondition::Threshold { sustained_for, .. } => *sustained_for,
            RuleCondition::RestartLoop { window, .. } => *window,
        }
    }

    pub fn is_restart_loop(&self) -> bool {
        matches!(self.condition, RuleCondition::RestartLoop { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        let mut severities = vec![Severity::Medium, Severity::Critical, Severity::Low, Severity::High];
        severities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
        );
    }

    #[test]
    fn test_comparator_holds() {
        assert!(Comparator::Gt.holds(81.0, 80.0));
        assert!(!Comparator::Gt.holds(80.0, 80.0));
        assert!(Comparator::Ge.holds(80.0, 80.0));
        assert!(Comparator::Lt.holds(0.0, 1.0));
        assert!(Comparator::Eq.holds(1.0, 1.0));
        assert!(Comparator::Ne.holds(0.0, 1.0));
    }

    #[test]
    fn test_rule_applies_to() {
        let rule = Rule::restart_loop(
            "restart_loop",
            Some(TargetType::Container),
            5,
            Duration::from_secs(600),
            Severity::Critical,
        );
        assert!(rule.applies_to(TargetType::Container));
        assert!(!rule.applies_to(TargetType::Host));
        assert_eq!(rule.lookback(), Duration::from_secs(600));
        assert_eq!(rule.metric_name, "restarts");
    }
}
