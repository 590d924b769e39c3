//! Configuration management for remedyd.
//!
//! Loads settings from /etc/remedy/config.toml or uses defaults. Every field
//! has a serde default so partial files are valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::RemedyError;
use crate::rule::{Comparator, Rule, RuleCondition, Severity};
use crate::target::TargetType;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/remedy/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/remedy/config.toml";

// ============================================================================
// Monitor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between metric polls / evaluation ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum sample retention per target in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Budget for one target's evaluations within a tick
    #[serde(default = "default_tick_timeout")]
    pub tick_timeout_secs: u64,

    /// Budget for one metrics poll
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Data older than this is flagged stale to clients
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_retention() -> u64 {
    600 // 10 minutes
}

fn default_tick_timeout() -> u64 {
    10
}

fn default_poll_timeout() -> u64 {
    20
}

fn default_stale_after() -> u64 {
    90 // three poll intervals
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retention_secs: default_retention(),
            tick_timeout_secs: default_tick_timeout(),
            poll_timeout_secs: default_poll_timeout(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// A cleared condition must persist this long before auto-resolution
    #[serde(default = "default_clear_grace")]
    pub clear_grace_secs: u64,

    /// Resolved issues are dropped from memory after this long
    #[serde(default = "default_resolved_retention")]
    pub resolved_retention_secs: u64,
}

fn default_clear_grace() -> u64 {
    120
}

fn default_resolved_retention() -> u64 {
    86_400
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            clear_grace_secs: default_clear_grace(),
            resolved_retention_secs: default_resolved_retention(),
        }
    }
}

impl RegistryConfig {
    pub fn clear_grace(&self) -> Duration {
        Duration::from_secs(self.clear_grace_secs)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_secs)
    }
}

// ============================================================================
// Wizard
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WizardConfig {
    #[serde(default = "default_diagnosis_timeout")]
    pub diagnosis_timeout_secs: u64,

    /// Inactivity allowed in AwaitingSelection before abandonment
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Delay before the deferred validation re-check
    #[serde(default = "default_monitor_window")]
    pub monitor_window_secs: u64,

    /// Terminal sessions kept for get-session-state
    #[serde(default = "default_archive_limit")]
    pub archive_limit: usize,

    /// Samples handed to the diagnosis provider and the metrics view
    #[serde(default = "default_context_samples")]
    pub context_samples: usize,

    /// Action records handed to the diagnosis provider and the logs view
    #[serde(default = "default_context_actions")]
    pub context_actions: usize,
}

fn default_diagnosis_timeout() -> u64 {
    5
}

fn default_inactivity_timeout() -> u64 {
    900 // 15 minutes
}

fn default_monitor_window() -> u64 {
    300 // 5 minutes
}

fn default_archive_limit() -> usize {
    256
}

fn default_context_samples() -> usize {
    120
}

fn default_context_actions() -> usize {
    20
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            diagnosis_timeout_secs: default_diagnosis_timeout(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            monitor_window_secs: default_monitor_window(),
            archive_limit: default_archive_limit(),
            context_samples: default_context_samples(),
            context_actions: default_context_actions(),
        }
    }
}

impl WizardConfig {
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnosis_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn monitor_window(&self) -> Duration {
        Duration::from_secs(self.monitor_window_secs)
    }
}

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Actions running at once across all targets
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Extra attempts for idempotent actions after a runner failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_action_timeout() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_backoff() -> u64 {
    500
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl ExecutorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ============================================================================
// Storage, server, sources, auto-remediation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    #[serde(default = "default_db_path")]
    pub path: String,

    /// Entries kept per log by the in-memory backend
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_db_path() -> String {
    "/var/lib/remedy/remedy.db".to_string()
}

fn default_memory_capacity() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bound to localhost by default
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:7870".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub docker: bool,

    #[serde(default = "default_true")]
    pub host: bool,

    /// systemd units watched as service targets
    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
}

fn default_true() -> bool {
    true
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            docker: true,
            host: true,
            services: Vec::new(),
            docker_bin: default_docker_bin(),
        }
    }
}

/// Unattended remediation of fresh issues. Off unless configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRemediationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_auto_severity")]
    pub min_severity: Severity,

    #[serde(default = "default_auto_confidence")]
    pub min_confidence: f64,
}

fn default_auto_severity() -> Severity {
    Severity::Critical
}

fn default_auto_confidence() -> f64 {
    0.8
}

impl Default for AutoRemediationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_severity: default_auto_severity(),
            min_confidence: default_auto_confidence(),
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    Threshold,
    RestartLoop,
}

/// Rule as written in `[[rules]]` tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,

    #[serde(default)]
    pub kind: RuleKind,

    #[serde(default)]
    pub target_type: Option<TargetType>,

    #[serde(default)]
    pub metric: Option<String>,

    #[serde(default)]
    pub comparator: Option<Comparator>,

    #[serde(default)]
    pub threshold: Option<f64>,

    #[serde(default)]
    pub sustained_secs: u64,

    #[serde(default)]
    pub max_restarts: Option<u32>,

    #[serde(default)]
    pub window_secs: Option<u64>,

    pub severity: Severity,

    #[serde(default)]
    pub description: Option<String>,
}

/// Longest sustained or lookback window a rule may ask for
pub const MAX_RULE_WINDOW_SECS: u64 = 86_400;

impl RuleConfig {
    pub fn to_rule(&self) -> std::result::Result<Rule, RemedyError> {
        if self.id.trim().is_empty() {
            return Err(RemedyError::InvalidRequest("rule id must not be empty".to_string()));
        }
        let longest = self.sustained_secs.max(self.window_secs.unwrap_or(0));
        if longest > MAX_RULE_WINDOW_SECS {
            return Err(RemedyError::InvalidRequest(format!(
                "rule '{}' window of {}s exceeds the {}s limit",
                self.id, longest, MAX_RULE_WINDOW_SECS
            )));
        }

        let rule = match self.kind {
            RuleKind::Threshold => {
                let metric = self.metric.as_deref().ok_or_else(|| {
                    RemedyError::InvalidRequest(format!("rule '{}' needs a metric", self.id))
                })?;
                let comparator = self.comparator.ok_or_else(|| {
                    RemedyError::InvalidRequest(format!("rule '{}' needs a comparator", self.id))
                })?;
                let threshold = self.threshold.filter(|t| t.is_finite()).ok_or_else(|| {
                    RemedyError::InvalidRequest(format!(
                        "rule '{}' needs a finite threshold",
                        self.id
                    ))
                })?;
                Rule::threshold(
                    self.id.clone(),
                    self.target_type,
                    metric,
                    comparator,
                    threshold,
                    Duration::from_secs(self.sustained_secs),
                    self.severity,
                )
            }
            RuleKind::RestartLoop => {
                let window = self.window_secs.filter(|w| *w > 0).ok_or_else(|| {
                    RemedyError::InvalidRequest(format!(
                        "restart loop rule '{}' needs window_secs",
                        self.id
                    ))
                })?;
                Rule::restart_loop(
                    self.id.clone(),
                    self.target_type,
                    self.max_restarts.unwrap_or(5),
                    Duration::from_secs(window),
                    self.severity,
                )
            }
        };

        Ok(match &self.description {
            Some(description) => rule.with_description(description.clone()),
            None => rule,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn threshold_rule(
    id: &str,
    target_type: TargetType,
    metric: &str,
    comparator: Comparator,
    threshold: f64,
    sustained_secs: u64,
    severity: Severity,
    description: &str,
) -> RuleConfig {
    RuleConfig {
        id: id.to_string(),
        kind: RuleKind::Threshold,
        target_type: Some(target_type),
        metric: Some(metric.to_string()),
        comparator: Some(comparator),
        threshold: Some(threshold),
        sustained_secs,
        max_restarts: None,
        window_secs: None,
        severity,
        description: Some(description.to_string()),
    }
}

/// Rule set shipped when the config file has no `[[rules]]`
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        threshold_rule(
            "cpu_sustained_80",
            TargetType::Container,
            crate::metrics::CPU_PERCENT,
            Comparator::Gt,
            80.0,
            120,
            Severity::High,
            "Container CPU above 80% for 2 minutes",
        ),
        threshold_rule(
            "memory_sustained_90",
            TargetType::Container,
            crate::metrics::MEMORY_PERCENT,
            Comparator::Gt,
            90.0,
            120,
            Severity::High,
            "Container memory above 90% of its limit for 2 minutes",
        ),
        RuleConfig {
            id: "restart_loop".to_string(),
            kind: RuleKind::RestartLoop,
            target_type: Some(TargetType::Container),
            metric: None,
            comparator: None,
            threshold: None,
            sustained_secs: 0,
            max_restarts: Some(5),
            window_secs: Some(600),
            severity: Severity::Critical,
            description: Some("Container restarted more than 5 times in 10 minutes".to_string()),
        },
        threshold_rule(
            "container_unhealthy",
            TargetType::Container,
            crate::metrics::HEALTH_FAILING,
            Comparator::Ge,
            1.0,
            60,
            Severity::High,
            "Container health check failing for 1 minute",
        ),
        threshold_rule(
            "service_down",
            TargetType::Service,
            crate::metrics::ACTIVE,
            Comparator::Lt,
            1.0,
            60,
            Severity::Critical,
            "Service inactive for 1 minute",
        ),
        threshold_rule(
            "host_cpu_sustained_90",
            TargetType::Host,
            crate::metrics::CPU_PERCENT,
            Comparator::Gt,
            90.0,
            300,
            Severity::Medium,
            "Host CPU above 90% for 5 minutes",
        ),
        threshold_rule(
            "host_memory_90",
            TargetType::Host,
            crate::metrics::MEMORY_PERCENT,
            Comparator::Gt,
            90.0,
            120,
            Severity::High,
            "Host memory above 90% for 2 minutes",
        ),
        threshold_rule(
            "host_disk_90",
            TargetType::Host,
            crate::metrics::DISK_PERCENT,
            Comparator::Gt,
            90.0,
            0,
            Severity::Medium,
            "Root filesystem above 90% full",
        ),
    ]
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub wizard: WizardConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub auto_remediation: AutoRemediationConfig,

    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            registry: RegistryConfig::default(),
            wizard: WizardConfig::default(),
            executor: ExecutorConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            sources: SourcesConfig::default(),
            auto_remediation: AutoRemediationConfig::default(),
            rules: default_rules(),
        }
    }
}

impl Config {
    /// Load config from the standard locations, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Typed, validated rule set. Duplicate ids are rejected.
    pub fn rules(&self) -> std::result::Result<Vec<Rule>, RemedyError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for rule_config in &self.rules {
            if !seen.insert(rule_config.id.clone()) {
                return Err(RemedyError::InvalidRequest(format!(
                    "duplicate rule id '{}'",
                    rule_config.id
                )));
            }
            let rule = rule_config.to_rule()?;
            if let RuleCondition::Threshold { sustained_for, .. } = &rule.condition {
                if !sustained_for.is_zero() && *sustained_for < self.monitor.poll_interval() {
                    warn!(
                        rule = %rule.id,
                        "sustained window shorter than the poll interval, only the latest tick counts"
                    );
                }
            }
            rules.push(rule);
        }
        Ok(rules)
    }
}
