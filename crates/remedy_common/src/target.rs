//! Monitored targets and the samples collected for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RemedyError;

/// Kind of monitored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Container,
    Service,
    Host,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Service => "service",
            Self::Host => "host",
        }
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = RemedyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "service" => Ok(Self::Service),
            "host" => Ok(Self::Host),
            other => Err(RemedyError::InvalidRequest(format!(
                "unknown target type '{}'",
                other
            ))),
        }
    }
}

/// A monitored entity, identified by `(target_type, target_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub target_type: TargetType,
    pub target_id: String,
}

impl Target {
    pub fn new(target_type: TargetType, target_id: impl Into<String>) -> Self {
        Self {
            target_type,
            target_id: target_id.into(),
        }
    }

    pub fn container(id: impl Into<String>) -> Self {
        Self::new(TargetType::Container, id)
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self::new(TargetType::Service, id)
    }

    pub fn host(id: impl Into<String>) -> Self {
        Self::new(TargetType::Host, id)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target_type, self.target_id)
    }
}

/// One metric observation. Immutable once collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub target_type: TargetType,
    pub target_id: String,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        target: &Target,
        metric_name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            target_type: target.target_type,
            target_id: target.target_id.clone(),
            metric_name: metric_name.into(),
            value,
            timestamp,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.target_type, self.target_id.clone())
    }
}
