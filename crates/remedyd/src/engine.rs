//! Engine - the operation surface exposed to the API layer
//!
//! Wires the registry, monitor, wizard and executor together and owns the
//! background loops. Listing and session queries only read local state, so
//! they keep answering during a collector outage and flag staleness
//! instead.

use chrono::{DateTime, Utc};
use remedy_common::{
    config::AutoRemediationConfig, ActionQuery, ActionRecord, Choice, Config, Issue,
    IssueFilter, IssueId, RemedyError, Result, SelectionOutcome, SessionId, SessionView,
    WizardState,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::executor::ActionExecutor;
use crate::monitor::{Monitor, PollStatus, TickReport};
use crate::ports::{CommandRunner, DiagnosisProvider, MetricsSource};
use crate::registry::IssueRegistry;
use crate::store::HistoryStore;
use crate::wizard::WizardOrchestrator;

/// External collaborators the engine drives
pub struct Collaborators {
    pub source: Arc<dyn MetricsSource>,
    pub diagnosis: Arc<dyn DiagnosisProvider>,
    pub runner: Arc<dyn CommandRunner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueListing {
    pub issues: Vec<Issue>,
    pub as_of: DateTime<Utc>,
    /// No successful poll within the staleness window
    pub stale: bool,
    pub last_poll: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub active_issues: usize,
    pub active_sessions: usize,
    pub stale: bool,
    pub poll: PollStatus,
}

pub struct Engine {
    registry: Arc<IssueRegistry>,
    monitor: Arc<Monitor>,
    wizard: Arc<WizardOrchestrator>,
    store: Arc<dyn HistoryStore>,
    auto: AutoRemediationConfig,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Arc<dyn HistoryStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let rules = config.rules()?;
        let registry = Arc::new(IssueRegistry::new(
            Arc::clone(&store),
            config.registry.clear_grace(),
        ));
        let monitor = Arc::new(Monitor::new(
            collaborators.source,
            Arc::clone(&registry),
            Arc::clone(&store),
            rules,
            &config.monitor,
            config.registry.resolved_retention(),
        ));
        let executor = Arc::new(ActionExecutor::new(
            collaborators.runner,
            Arc::clone(&store),
            &config.executor,
        ));
        let wizard = Arc::new(WizardOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&store),
            collaborators.diagnosis,
            executor,
            config.wizard.clone(),
        ));

        Ok(Self {
            registry,
            monitor,
            wizard,
            store,
            auto: config.auto_remediation.clone(),
            poll_interval: config.monitor.poll_interval(),
        })
    }

    pub fn registry(&self) -> &Arc<IssueRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn wizard(&self) -> &Arc<WizardOrchestrator> {
        &self.wizard
    }

    /// Rebuild the active issue index from the store
    pub fn restore(&self) -> Result<usize> {
        let issues = self.store.load_issues()?;
        Ok(self.registry.restore(issues))
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Run one evaluation tick now. Serialized with the scheduled loop.
    pub async fn detect_now(&self) -> TickReport {
        let report = self.monitor.tick_now().await;
        if self.auto.enabled {
            self.auto_remediate(&report.opened);
        }
        report
    }

    pub fn list_open_issues(&self, filter: &IssueFilter) -> IssueListing {
        let now = Utc::now();
        IssueListing {
            issues: self.registry.list_open(filter),
            as_of: now,
            stale: self.monitor.is_stale(now),
            last_poll: self.monitor.poll_status().last_success,
        }
    }

    pub async fn acknowledge_issue(&self, issue_id: IssueId) -> Result<Issue> {
        self.registry.acknowledge(issue_id).await
    }

    pub async fn start_wizard(&self, issue_id: IssueId) -> Result<SessionView> {
        self.wizard.start(issue_id).await
    }

    pub async fn select_suggestion(
        &self,
        session_id: SessionId,
        choice: Choice,
    ) -> Result<SelectionOutcome> {
        self.wizard.select(session_id, choice).await
    }

    pub async fn cancel_session(&self, session_id: SessionId) -> Result<SessionView> {
        self.wizard.cancel(session_id).await
    }

    pub fn get_action_history(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>> {
        if query.limit == 0 {
            return Err(RemedyError::InvalidRequest(
                "limit must be at least 1".to_string(),
            ));
        }
        self.store.recent_actions(query)
    }

    pub async fn get_session_state(&self, session_id: SessionId) -> Result<SessionView> {
        self.wizard.session(session_id).await
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            active_issues: self.registry.active_count(),
            active_sessions: self.wizard.active_count(),
            stale: self.monitor.is_stale(Utc::now()),
            poll: self.monitor.poll_status(),
        }
    }

    // ========================================================================
    // Auto-remediation
    // ========================================================================

    /// Start a session for each new issue at or above the configured
    /// severity and pick the first confident, idempotent suggestion.
    fn auto_remediate(&self, opened: &[Issue]) {
        for issue in opened
            .iter()
            .filter(|issue| issue.severity >= self.auto.min_severity)
        {
            let wizard = Arc::clone(&self.wizard);
            let min_confidence = self.auto.min_confidence;
            let issue_id = issue.id;
            tokio::spawn(async move {
                if let Err(e) = auto_select(wizard, issue_id, min_confidence).await {
                    warn!(issue_id = %issue_id, "Auto-remediation skipped: {}", e);
                }
            });
        }
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Tick on the poll interval until shutdown
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Monitor loop starting"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.detect_now().await;
                    if !report.opened.is_empty() || !report.resolved.is_empty() {
                        info!(
                            opened = report.opened.len(),
                            resolved = report.resolved.len(),
                            "Issue set changed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("Monitor loop stopping");
                    return;
                }
            }
        }
    }

    /// Sweep idle sessions until shutdown
    pub async fn run_reaper(self: Arc<Self>, every: Duration, shutdown: watch::Receiver<bool>) {
        Arc::clone(&self.wizard).run_reaper(every, shutdown).await;
    }
}

async fn auto_select(
    wizard: Arc<WizardOrchestrator>,
    issue_id: IssueId,
    min_confidence: f64,
) -> Result<()> {
    let session = wizard.start(issue_id).await?;
    if session.state != WizardState::AwaitingSelection {
        debug!(issue_id = %issue_id, state = %session.state, "Auto-remediation found nothing to run");
        return Ok(());
    }

    let choice = session.suggestions.iter().position(|s| {
        s.confidence >= min_confidence
            && s
                .action_kind()
                .map(|kind| kind.is_idempotent())
                .unwrap_or(false)
    });

    match choice {
        Some(index) => {
            info!(
                issue_id = %issue_id,
                suggestion = %session.suggestions[index].label,
                "Auto-remediation selecting suggestion"
            );
            wizard
                .select(session.id, Choice::Suggestion { index })
                .await
                .map(|_| ())
        }
        None => {
            debug!(issue_id = %issue_id, "No suggestion confident enough for auto-remediation");
            Ok(())
        }
    }
}
