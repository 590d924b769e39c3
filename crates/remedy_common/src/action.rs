//! Remediation actions, suggestions and the action audit record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{RemedyError, Result};
use crate::target::{Target, TargetType};

/// Free-form action parameters, as carried by suggestions and records
pub type Parameters = BTreeMap<String, String>;

/// Known remediation actions.
///
/// `action_type` strings coming from the diagnosis provider or an API
/// caller are parsed into this enum before anything runs; an unknown type
/// never reaches the command runner.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Restart,
    Start,
    Stop,
    UpdateMemoryLimit { memory_mb: u64 },
    UpdateCpuLimit { cpus: f64 },
    ClearLogs,
    Custom { command: String },
}

impl ActionKind {
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "restart",
        "start",
        "stop",
        "update_memory_limit",
        "update_cpu_limit",
        "clear_logs",
        "custom",
    ];

    pub fn parse(action_type: &str, parameters: &Parameters) -> Result<Self> {
        match action_type {
            "restart" => Ok(Self::Restart),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "update_memory_limit" => {
                let memory_mb = required(parameters, action_type, "memory_mb")?
                    .parse::<u64>()
                    .ok()
                    .filter(|mb| *mb > 0)
                    .ok_or_else(|| {
                        RemedyError::InvalidRequest(
                            "memory_mb must be a positive integer".to_string(),
                        )
                    })?;
                Ok(Self::UpdateMemoryLimit { memory_mb })
            }
            "update_cpu_limit" => {
                let cpus = required(parameters, action_type, "cpus")?
                    .parse::<f64>()
                    .ok()
                    .filter(|c| c.is_finite() && *c > 0.0)
                    .ok_or_else(|| {
                        RemedyError::InvalidRequest("cpus must be a positive number".to_string())
                    })?;
                Ok(Self::UpdateCpuLimit { cpus })
            }
            "clear_logs" => Ok(Self::ClearLogs),
            "custom" => {
                let command = required(parameters, action_type, "command")?.trim();
                if command.is_empty() {
                    return Err(RemedyError::InvalidRequest(
                        "custom action needs a non-empty command".to_string(),
                    ));
                }
                Ok(Self::Custom {
                    command: command.to_string(),
                })
            }
            other => Err(RemedyError::InvalidRequest(format!(
                "unknown action type '{}'",
                other
            ))),
        }
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::UpdateMemoryLimit { .. } => "update_memory_limit",
            Self::UpdateCpuLimit { .. } => "update_cpu_limit",
            Self::ClearLogs => "clear_logs",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn parameters(&self) -> Parameters {
        let mut params = Parameters::new();
        match self {
            Self::UpdateMemoryLimit { memory_mb } => {
                params.insert("memory_mb".to_string(), memory_mb.to_string());
            }
            Self::UpdateCpuLimit { cpus } => {
                params.insert("cpus".to_string(), cpus.to_string());
            }
            Self::Custom { command } => {
                params.insert("command".to_string(), command.clone());
            }
            _ => {}
        }
        params
    }

    /// Whether repeating the action is harmless, so the executor may retry it
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Custom { .. })
    }

    /// Whether the action makes sense for the given target type
    pub fn supports(&self, target_type: TargetType) -> bool {
        match self {
            Self::Custom { .. } => true,
            Self::Restart | Self::Start | Self::Stop => target_type != TargetType::Host,
            Self::UpdateMemoryLimit { .. } | Self::UpdateCpuLimit { .. } | Self::ClearLogs => {
                target_type == TargetType::Container
            }
        }
    }
}

fn required<'a>(parameters: &'a Parameters, action_type: &str, key: &str) -> Result<&'a str> {
    parameters.get(key).map(String::as_str).ok_or_else(|| {
        RemedyError::InvalidRequest(format!("{} requires parameter '{}'", action_type, key))
    })
}

/// One candidate remediation proposed by the diagnosis provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub label: String,
    pub action_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub confidence: f64,
}

impl Suggestion {
    pub fn new(label: impl Into<String>, action_type: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            action_type: action_type.into(),
            parameters: Parameters::new(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn action_kind(&self) -> Result<ActionKind> {
        ActionKind::parse(&self.action_type, &self.parameters)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    Timeout,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for ActionOutcome {
    type Err = RemedyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            other => Err(RemedyError::InvalidRequest(format!(
                "unknown action result '{}'",
                other
            ))),
        }
    }
}

/// Append-only audit entry for one remediation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    pub target_type: TargetType,
    pub target_id: String,
    pub parameters: Parameters,
    pub result: ActionOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Runner invocations made, retries included
    pub attempts: u32,
}

impl ActionRecord {
    pub fn target(&self) -> Target {
        Target::new(self.target_type, self.target_id.clone())
    }

    pub fn succeeded(&self) -> bool {
        self.result == ActionOutcome::Success
    }

    /// Converts a failed or timed-out record into the matching error
    pub fn into_result(self) -> Result<ActionRecord> {
        match self.result {
            ActionOutcome::Success => Ok(self),
            ActionOutcome::Failure => Err(RemedyError::ExecutionFailure(format!(
                "{} on {}: {}",
                self.action_type,
                self.target(),
                self.error.as_deref().unwrap_or("runner reported failure")
            ))),
            ActionOutcome::Timeout => Err(RemedyError::Timeout(format!(
                "{} on {} after {}ms",
                self.action_type,
                self.target(),
                self.duration_ms
            ))),
        }
    }
}

/// Selection criteria for action history reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionQuery {
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default = "default_action_limit")]
    pub limit: usize,
}

fn default_action_limit() -> usize {
    50
}

impl Default for ActionQuery {
    fn default() -> Self {
        Self {
            target_type: None,
            target_id: None,
            limit: default_action_limit(),
        }
    }
}

impl ActionQuery {
    pub fn for_target(target: &Target, limit: usize) -> Self {
        Self {
            target_type: Some(target.target_type),
            target_id: Some(target.target_id.clone()),
            limit,
        }
    }

    pub fn matches(&self, record: &ActionRecord) -> bool {
        self.target_type.map_or(true, |t| record.target_type == t)
            && self
                .target_id
                .as_deref()
                .map_or(true, |id| record.target_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_unknown() {
        let empty = Parameters::new();
        assert_eq!(ActionKind::parse("restart", &empty).unwrap(), ActionKind::Restart);

        let err = ActionKind::parse("reboot_datacenter", &empty).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_parse_memory_limit_requires_parameter() {
        let mut params = Parameters::new();
        assert!(ActionKind::parse("update_memory_limit", &params).is_err());

        params.insert("memory_mb".to_string(), "1024".to_string());
        let kind = ActionKind::parse("update_memory_limit", &params).unwrap();
        assert_eq!(kind, ActionKind::UpdateMemoryLimit { memory_mb: 1024 });
        assert_eq!(kind.parameters(), params);
    }

    #[test]
    fn test_custom_is_not_idempotent() {
        let mut params = Parameters::new();
        params.insert("command".to_string(), "docker system prune -f".to_string());
        let kind = ActionKind::parse("custom", &params).unwrap();
        assert!(!kind.is_idempotent());
        assert!(ActionKind::Restart.is_idempotent());
    }

    #[test]
    fn test_suggestion_confidence_clamped() {
        assert_eq!(Suggestion::new("x", "restart", 1.7).confidence, 1.0);
        assert_eq!(Suggestion::new("x", "restart", -0.2).confidence, 0.0);
    }

    #[test]
    fn test_supports_target_types() {
        assert!(!ActionKind::Restart.supports(TargetType::Host));
        assert!(ActionKind::Restart.supports(TargetType::Service));
        assert!(!ActionKind::ClearLogs.supports(TargetType::Service));
    }
}
