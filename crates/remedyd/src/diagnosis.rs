//! Playbook diagnosis
//!
//! Deterministic suggestions keyed on the triggering metric and the target
//! type. Recent actions adjust the playbook: a memory limit that was already
//! raised is raised again from where it was left, and a restart that already
//! failed to help drops in confidence.

use async_trait::async_trait;
use remedy_common::{metrics, Result, Suggestion, TargetType};
use tracing::debug;

use crate::ports::{DiagnosisProvider, IssueContext};

/// Memory limit proposed when no earlier limit is known
const DEFAULT_MEMORY_MB: u64 = 1024;

/// Largest memory limit the playbook will propose
const MAX_MEMORY_MB: u64 = 16 * 1024;

/// Confidence lost by a suggestion that was already tried on this target
const REPEAT_PENALTY: f64 = 0.25;

#[derive(Debug, Default)]
pub struct PlaybookDiagnosis;

impl PlaybookDiagnosis {
    pub fn new() -> Self {
        Self
    }

    fn playbook(&self, context: &IssueContext) -> Vec<Suggestion> {
        let target_type = context.issue.target_type;
        let metric = context.rule.metric_name.as_str();

        match (target_type, metric) {
            (TargetType::Container, metrics::RESTARTS) => vec![
                Suggestion::new("Restart the container cleanly", "restart", 0.85),
                memory_suggestion(context, 0.70),
            ],
            (TargetType::Container, metrics::MEMORY_PERCENT) => vec![
                memory_suggestion(context, 0.75),
                Suggestion::new("Restart the container to release memory", "restart", 0.60),
            ],
            (TargetType::Container, metrics::CPU_PERCENT) => vec![
                Suggestion::new("Restart the container", "restart", 0.60),
                Suggestion::new("Cap the container at one CPU", "update_cpu_limit", 0.50)
                    .with_parameter("cpus", "1"),
            ],
            (TargetType::Container, metrics::HEALTH_FAILING) => vec![
                Suggestion::new("Restart the unhealthy container", "restart", 0.80),
                Suggestion::new("Clear the container's log file", "clear_logs", 0.30),
            ],
            (TargetType::Container, metrics::RUNNING) => vec![
                Suggestion::new("Start the container", "start", 0.85),
                Suggestion::new("Restart the container", "restart", 0.60),
            ],
            (TargetType::Service, metrics::ACTIVE) => vec![
                Suggestion::new("Start the service", "start", 0.85),
                Suggestion::new("Restart the service", "restart", 0.70),
            ],
            (TargetType::Host, metrics::DISK_PERCENT) => vec![
                Suggestion::new("Remove unused docker data", "custom", 0.55)
                    .with_parameter("command", "docker system prune -f"),
                Suggestion::new("Vacuum the systemd journal", "custom", 0.45)
                    .with_parameter("command", "journalctl --vacuum-size=200M"),
            ],
            // Host cpu, memory, swap and load have no safe generic fix
            _ => Vec::new(),
        }
    }
}

/// Raise the memory limit: double the last one set on this target, or start from the default
fn memory_suggestion(context: &IssueContext, confidence: f64) -> Suggestion {
    let previous = context
        .recent_actions
        .iter()
        .filter(|a| a.succeeded() && a.action_type == "update_memory_limit")
        .find_map(|a| a.parameters.get("memory_mb")?.parse::<u64>().ok());

    let memory_mb = previous
        .map(|mb| (mb * 2).min(MAX_MEMORY_MB))
        .unwrap_or(DEFAULT_MEMORY_MB);

    Suggestion::new(
        format!("Raise the memory limit to {} MB", memory_mb),
        "update_memory_limit",
        confidence,
    )
    .with_parameter("memory_mb", memory_mb.to_string())
}

#[async_trait]
impl DiagnosisProvider for PlaybookDiagnosis {
    async fn diagnose(&self, context: &IssueContext) -> Result<Vec<Suggestion>> {
        let mut suggestions = self.playbook(context);

        for suggestion in &mut suggestions {
            let tried = context
                .recent_actions
                .iter()
                .any(|a| a.action_type == suggestion.action_type && a.parameters == suggestion.parameters);
            if tried {
                suggestion.confidence = (suggestion.confidence - REPEAT_PENALTY).max(0.0);
            }
        }
        suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        debug!(
            issue_id = %context.issue.id,
            rule = %context.rule.id,
            count = suggestions.len(),
            "Playbook diagnosis"
        );
        Ok(suggestions)
    }
}
