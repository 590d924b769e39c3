//! Wizard Orchestrator - guided remediation per issue
//!
//! Analyzing -> Diagnosed -> AwaitingSelection -> Executing -> Validating,
//! ending in Resolved, Failed or Abandoned. Each session is bound to one
//! issue; at most one active session exists per issue.
//!
//! Diagnosis runs inline in `start` under a timeout. The selected action
//! runs in a spawned task, followed by an immediate validation and, when
//! that is not conclusive, one deferred validation after the monitoring
//! window. Operations on one session are serialized by a per-session lock.

mod session;

use chrono::{DateTime, Utc};
use remedy_common::{
    config::WizardConfig,
    wizard::{REVIEW_LOGS, VIEW_METRICS},
    ActionQuery, Choice, FailureReason, InspectionView, IssueId, IssueState, RemedyError, Result,
    SelectedAction, SelectionOutcome, SessionId, SessionView, Target, WizardState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::evaluator::{Validation, ValidationPhase};
use crate::executor::{cancel_pair, ActionExecutor, ActionRequest, CancelToken};
use crate::keyed::KeyedLocks;
use crate::monitor::Monitor;
use crate::ports::{DiagnosisProvider, IssueContext};
use crate::registry::IssueRegistry;
use crate::store::HistoryStore;

use session::Session;

#[derive(Default)]
struct SessionTable {
    active: HashMap<SessionId, Session>,
    by_issue: HashMap<IssueId, SessionId>,
    archive: VecDeque<Session>,
}

/// What a selection resolved to, decided under the table lock
enum Resolved {
    Action {
        label: String,
        request: ActionRequest,
    },
    ReviewLogs,
    ViewMetrics,
}

pub struct WizardOrchestrator {
    registry: Arc<IssueRegistry>,
    monitor: Arc<Monitor>,
    store: Arc<dyn HistoryStore>,
    diagnosis: Arc<dyn DiagnosisProvider>,
    executor: Arc<ActionExecutor>,
    table: Mutex<SessionTable>,
    session_locks: KeyedLocks<SessionId>,
    config: WizardConfig,
}

impl WizardOrchestrator {
    pub fn new(
        registry: Arc<IssueRegistry>,
        monitor: Arc<Monitor>,
        store: Arc<dyn HistoryStore>,
        diagnosis: Arc<dyn DiagnosisProvider>,
        executor: Arc<ActionExecutor>,
        config: WizardConfig,
    ) -> Self {
        Self {
            registry,
            monitor,
            store,
            diagnosis,
            executor,
            table: Mutex::new(SessionTable::default()),
            session_locks: KeyedLocks::new(),
            config,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stale(&self) -> bool {
        self.monitor.is_stale(Utc::now())
    }

    /// Move a terminal session from the active set into the bounded archive
    fn archive(&self, table: &mut SessionTable, id: SessionId) {
        if let Some(session) = table.active.remove(&id) {
            table.by_issue.remove(&session.issue_id);
            info!(
                session_id = %id,
                issue_id = %session.issue_id,
                state = %session.state(),
                "Wizard session finished"
            );
            table.archive.push_back(session);
            while table.archive.len() > self.config.archive_limit.max(1) {
                table.archive.pop_front();
            }
        }
    }

    /// Apply `f` to the active session, returning its view
    fn with_active<F>(&self, id: SessionId, f: F) -> Result<SessionView>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let stale = self.stale();
        let mut table = self.table();
        let session = table
            .active
            .get_mut(&id)
            .ok_or_else(|| RemedyError::NotFound(format!("session {}", id)))?;
        f(session)?;
        let view = session.view(stale);
        if view.state.is_terminal() {
            self.archive(&mut table, id);
        }
        Ok(view)
    }

    // ========================================================================
    // start
    // ========================================================================

    /// Open a session for an issue and run diagnosis.
    ///
    /// Returns the session in `AwaitingSelection`, or `Failed` when the
    /// provider could not answer in time.
    pub async fn start(&self, issue_id: IssueId) -> Result<SessionView> {
        let issue = self.registry.get(issue_id)?;
        match issue.state {
            IssueState::Resolved => {
                return Err(RemedyError::NotFound(format!(
                    "issue {} is already resolved",
                    issue_id
                )))
            }
            IssueState::Resolving => {
                return Err(RemedyError::Conflict(format!(
                    "issue {} is being remediated",
                    issue_id
                )))
            }
            IssueState::Open | IssueState::Acknowledged => {}
        }
        let rule = self.monitor.rule(&issue.rule_id).cloned().ok_or_else(|| {
            RemedyError::NotFound(format!("rule {} is no longer configured", issue.rule_id))
        })?;

        let session_id = {
            let mut table = self.table();
            if let Some(existing) = table.by_issue.get(&issue_id) {
                return Err(RemedyError::Conflict(format!(
                    "issue {} already has active session {}",
                    issue_id, existing
                )));
            }
            let mut session = Session::new(&issue, self.config.inactivity_timeout());
            session.advance(WizardState::Analyzing)?;
            let id = session.id;
            table.by_issue.insert(issue_id, id);
            table.active.insert(id, session);
            id
        };
        let _session_guard = self.session_locks.lock(&session_id).await;

        let issue = match self.registry.acknowledge(issue_id).await {
            Ok(issue) => issue,
            Err(e) => {
                let mut table = self.table();
                table.active.remove(&session_id);
                table.by_issue.remove(&issue_id);
                return Err(e);
            }
        };
        info!(session_id = %session_id, issue_id = %issue_id, "Wizard session started");

        let target = issue.target();
        let recent_samples = self
            .monitor
            .windows()
            .recent(&target, self.config.context_samples)
            .await;
        let recent_actions = self
            .store
            .recent_actions(&ActionQuery::for_target(&target, self.config.context_actions))
            .unwrap_or_else(|e| {
                warn!(target = %target, "Could not load action history for diagnosis: {}", e);
                Vec::new()
            });
        let context = IssueContext {
            issue,
            rule,
            recent_samples,
            recent_actions,
        };

        let diagnosis = tokio::time::timeout(
            self.config.diagnosis_timeout(),
            self.diagnosis.diagnose(&context),
        )
        .await;

        match diagnosis {
            Ok(Ok(suggestions)) => {
                debug!(session_id = %session_id, count = suggestions.len(), "Diagnosis received");
                self.with_active(session_id, |session| {
                    session.set_suggestions(suggestions);
                    session.advance(WizardState::Diagnosed)?;
                    session.advance(WizardState::AwaitingSelection)?;
                    session.touch(self.config.inactivity_timeout());
                    Ok(())
                })
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, "Diagnosis provider failed: {}", e);
                self.with_active(session_id, |session| {
                    session.finish_unsuccessfully(FailureReason::DiagnosisUnavailable)
                })
            }
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    timeout_secs = self.config.diagnosis_timeout().as_secs(),
                    "Diagnosis provider timed out"
                );
                self.with_active(session_id, |session| {
                    session.finish_unsuccessfully(FailureReason::DiagnosisUnavailable)
                })
            }
        }
    }

    // ========================================================================
    // select
    // ========================================================================

    /// Act on the user's choice. Actions run in the background; the
    /// returned session is in `Executing`.
    pub async fn select(
        self: &Arc<Self>,
        session_id: SessionId,
        choice: Choice,
    ) -> Result<SelectionOutcome> {
        let _session_guard = self.session_locks.lock(&session_id).await;
        self.expire_locked(session_id, Utc::now()).await;

        let (resolved, issue_id, target) = {
            let table = self.table();
            let session = self.require_active(&table, session_id)?;
            if session.state() != WizardState::AwaitingSelection {
                return Err(RemedyError::Conflict(format!(
                    "session {} is {}, not awaiting a selection",
                    session_id,
                    session.state()
                )));
            }
            (
                resolve_choice(session, &choice)?,
                session.issue_id,
                session.target.clone(),
            )
        };

        let (label, request) = match resolved {
            Resolved::ReviewLogs => {
                let view = InspectionView {
                    samples: Vec::new(),
                    actions: self
                        .store
                        .recent_actions(&ActionQuery::for_target(
                            &target,
                            self.config.context_actions,
                        ))
                        .unwrap_or_default(),
                    health_checks: self
                        .store
                        .recent_health_checks(&target, self.config.context_samples)
                        .unwrap_or_default(),
                };
                let session = self.with_active(session_id, |s| {
                    s.touch(self.config.inactivity_timeout());
                    Ok(())
                })?;
                return Ok(SelectionOutcome::Inspection { session, view });
            }
            Resolved::ViewMetrics => {
                let view = InspectionView {
                    samples: self
                        .monitor
                        .windows()
                        .recent(&target, self.config.context_samples)
                        .await,
                    actions: Vec::new(),
                    health_checks: Vec::new(),
                };
                let session = self.with_active(session_id, |s| {
                    s.touch(self.config.inactivity_timeout());
                    Ok(())
                })?;
                return Ok(SelectionOutcome::Inspection { session, view });
            }
            Resolved::Action { label, request } => (label, request),
        };

        if let Err(e) = self.registry.mark_resolving(issue_id).await {
            let resolved_elsewhere = self
                .registry
                .get(issue_id)
                .map_or(true, |issue| issue.state == IssueState::Resolved);
            if resolved_elsewhere {
                self.with_active(session_id, |s| {
                    s.finish_unsuccessfully(FailureReason::IssueResolvedElsewhere)
                })?;
                return Err(RemedyError::Conflict(format!(
                    "issue {} was resolved while the session waited",
                    issue_id
                )));
            }
            return Err(e);
        }

        let (handle, token) = cancel_pair();
        let selected = SelectedAction {
            label,
            action_type: request.kind.action_type().to_string(),
            parameters: request.kind.parameters(),
        };
        let session = self.with_active(session_id, |s| {
            s.advance(WizardState::Executing)?;
            s.selected_action = Some(selected);
            s.cancel = Some(handle);
            Ok(())
        })?;
        info!(
            session_id = %session_id,
            target = %target,
            action = request.kind.action_type(),
            "Remediation selected"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.remediate(session_id, issue_id, request, token).await;
        });

        Ok(SelectionOutcome::Executing { session })
    }

    fn require_active<'a>(
        &self,
        table: &'a SessionTable,
        session_id: SessionId,
    ) -> Result<&'a Session> {
        match table.active.get(&session_id) {
            Some(session) => Ok(session),
            None if table.archive.iter().any(|s| s.id == session_id) => Err(
                RemedyError::Conflict(format!("session {} has already ended", session_id)),
            ),
            None => Err(RemedyError::NotFound(format!("session {}", session_id))),
        }
    }

    // ========================================================================
    // Execution and validation
    // ========================================================================

    async fn remediate(
        self: Arc<Self>,
        session_id: SessionId,
        issue_id: IssueId,
        request: ActionRequest,
        token: CancelToken,
    ) {
        let target = request.target.clone();
        let record = self.executor.execute(request, Some(token)).await;

        let _session_guard = self.session_locks.lock(&session_id).await;
        let still_executing = {
            let mut table = self.table();
            match table.active.get_mut(&session_id) {
                Some(session) if session.state() == WizardState::Executing => {
                    session.action_record_id = Some(record.id);
                    session.cancel = None;
                    true
                }
                _ => {
                    // Cancelled meanwhile; attach the record to the archived session
                    if let Some(session) = table.archive.iter_mut().find(|s| s.id == session_id) {
                        session.action_record_id = Some(record.id);
                    }
                    false
                }
            }
        };
        if !still_executing {
            return;
        }

        if let Err(e) = self.with_active(session_id, |s| s.advance(WizardState::Validating)) {
            warn!(session_id = %session_id, "Could not enter validation: {}", e);
            return;
        }

        // Samples collected while the action ran already reflect its effect
        let since = record.timestamp;
        match self.validate(issue_id, &target, since, ValidationPhase::Immediate).await {
            Validation::Cleared => {
                self.conclude(session_id, issue_id, Validation::Cleared).await;
            }
            verdict => {
                debug!(
                    session_id = %session_id,
                    ?verdict,
                    window_secs = self.config.monitor_window().as_secs(),
                    "Immediate validation not conclusive, scheduling re-check"
                );
                drop(_session_guard);
                let this = Arc::clone(&self);
                let window = self.config.monitor_window();
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let _session_guard = this.session_locks.lock(&session_id).await;
                    let verdict = this
                        .validate(issue_id, &target, since, ValidationPhase::Deferred)
                        .await;
                    this.conclude(session_id, issue_id, verdict).await;
                });
            }
        }
    }

    async fn validate(
        &self,
        issue_id: IssueId,
        target: &Target,
        since: DateTime<Utc>,
        phase: ValidationPhase,
    ) -> Validation {
        let rule = match self
            .registry
            .get(issue_id)
            .ok()
            .and_then(|issue| self.monitor.rule(&issue.rule_id).cloned())
        {
            Some(rule) => rule,
            None => return Validation::Ambiguous,
        };
        let window = self.monitor.windows().window(target).await;
        self.monitor
            .evaluator()
            .validate(&rule, &window, since, Utc::now(), phase)
    }

    async fn conclude(&self, session_id: SessionId, issue_id: IssueId, verdict: Validation) {
        let outcome = match verdict {
            Validation::Cleared => match self.registry.mark_resolved(issue_id, false).await {
                Ok(_) => self.with_active(session_id, |s| s.advance(WizardState::Resolved)),
                Err(e) => {
                    warn!(issue_id = %issue_id, "Could not mark issue resolved: {}", e);
                    self.with_active(session_id, |s| {
                        s.finish_unsuccessfully(FailureReason::IssueResolvedElsewhere)
                    })
                }
            },
            Validation::StillHolds | Validation::Ambiguous => {
                let reason = if verdict == Validation::StillHolds {
                    FailureReason::ConditionPersists
                } else {
                    FailureReason::ValidationInconclusive
                };
                if let Err(e) = self.registry.reopen(issue_id).await {
                    warn!(issue_id = %issue_id, "Could not reopen issue: {}", e);
                }
                self.with_active(session_id, |s| s.finish_unsuccessfully(reason))
            }
        };
        if let Err(e) = outcome {
            warn!(session_id = %session_id, "Session could not conclude: {}", e);
        }
    }

    // ========================================================================
    // cancel, session, expiry
    // ========================================================================

    /// AwaitingSelection -> Abandoned, Executing -> Failed(cancelled)
    pub async fn cancel(&self, session_id: SessionId) -> Result<SessionView> {
        let _session_guard = self.session_locks.lock(&session_id).await;
        let (state, issue_id) = {
            let table = self.table();
            let session = self.require_active(&table, session_id)?;
            (session.state(), session.issue_id)
        };

        match state {
            WizardState::AwaitingSelection => {
                let view = self.with_active(session_id, |s| {
                    s.finish_unsuccessfully(FailureReason::Cancelled)
                })?;
                if let Err(e) = self.registry.revert_to_acknowledged(issue_id).await {
                    warn!(issue_id = %issue_id, "Could not revert issue: {}", e);
                }
                Ok(view)
            }
            WizardState::Executing => {
                let view = self.with_active(session_id, |s| {
                    if let Some(handle) = s.cancel.take() {
                        handle.cancel();
                    }
                    s.finish_unsuccessfully(FailureReason::Cancelled)
                })?;
                if let Err(e) = self.registry.reopen(issue_id).await {
                    warn!(issue_id = %issue_id, "Could not reopen issue: {}", e);
                }
                Ok(view)
            }
            other => Err(RemedyError::Conflict(format!(
                "session {} is {} and cannot be cancelled",
                session_id, other
            ))),
        }
    }

    /// Current view of an active or archived session
    pub async fn session(&self, session_id: SessionId) -> Result<SessionView> {
        {
            let _session_guard = self.session_locks.lock(&session_id).await;
            self.expire_locked(session_id, Utc::now()).await;
        }
        let stale = self.stale();
        let table = self.table();
        table
            .active
            .get(&session_id)
            .or_else(|| table.archive.iter().rev().find(|s| s.id == session_id))
            .map(|s| s.view(stale))
            .ok_or_else(|| RemedyError::NotFound(format!("session {}", session_id)))
    }

    /// Active session for an issue, if any
    pub fn session_for_issue(&self, issue_id: IssueId) -> Option<SessionView> {
        let stale = self.stale();
        let table = self.table();
        let id = table.by_issue.get(&issue_id)?;
        table.active.get(id).map(|s| s.view(stale))
    }

    pub fn active_count(&self) -> usize {
        self.table().active.len()
    }

    /// Abandon the session if its deadline passed. Caller holds the session lock.
    async fn expire_locked(&self, session_id: SessionId, now: DateTime<Utc>) -> bool {
        let issue_id = {
            let table = self.table();
            match table.active.get(&session_id) {
                Some(session) if session.is_expired(now) => session.issue_id,
                _ => return false,
            }
        };

        let abandoned = self.with_active(session_id, |s| {
            s.finish_unsuccessfully(FailureReason::InactivityTimeout)
        });
        if abandoned.is_err() {
            return false;
        }
        if let Err(e) = self.registry.revert_to_acknowledged(issue_id).await {
            warn!(issue_id = %issue_id, "Could not revert issue after abandonment: {}", e);
        }
        info!(session_id = %session_id, "Session abandoned after inactivity");
        true
    }

    /// Abandon every session idle past its deadline
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<SessionId> = self
            .table()
            .active
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id)
            .collect();

        let mut count = 0;
        for id in expired {
            let _session_guard = self.session_locks.lock(&id).await;
            if self.expire_locked(id, now).await {
                count += 1;
            }
        }
        self.session_locks.prune();
        count
    }

    /// Periodic expiry sweep until shutdown
    pub async fn run_reaper(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.expire_sessions(Utc::now()).await;
                    if expired > 0 {
                        info!(count = expired, "Reaped idle wizard sessions");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Session reaper stopping");
                    return;
                }
            }
        }
    }
}

/// Map a choice onto an action or a standing option. Invalid choices leave
/// the session untouched.
fn resolve_choice(session: &Session, choice: &Choice) -> Result<Resolved> {
    let suggestion = match choice {
        Choice::ReviewLogs => return Ok(Resolved::ReviewLogs),
        Choice::ViewMetrics => return Ok(Resolved::ViewMetrics),
        Choice::Label { label } if label.eq_ignore_ascii_case(REVIEW_LOGS) => {
            return Ok(Resolved::ReviewLogs)
        }
        Choice::Label { label } if label.eq_ignore_ascii_case(VIEW_METRICS) => {
            return Ok(Resolved::ViewMetrics)
        }
        Choice::Custom {
            action_type,
            parameters,
        } => {
            let request = ActionRequest::parse(action_type, parameters, session.target.clone())?;
            return Ok(Resolved::Action {
                label: format!("custom {}", action_type),
                request,
            });
        }
        Choice::Suggestion { index } => session.suggestions().get(*index).ok_or_else(|| {
            RemedyError::InvalidRequest(format!(
                "suggestion index {} out of range ({} suggestions)",
                index,
                session.suggestions().len()
            ))
        })?,
        Choice::Label { label } => session
            .suggestions()
            .iter()
            .find(|s| s.label == *label)
            .ok_or_else(|| RemedyError::InvalidRequest(format!("no suggestion labelled '{}'", label)))?,
    };

    let request = ActionRequest::parse(
        &suggestion.action_type,
        &suggestion.parameters,
        session.target.clone(),
    )?;
    Ok(Resolved::Action {
        label: suggestion.label.clone(),
        request,
    })
}
