//! Monitor - the background evaluation loop
//!
//! One tick: poll the metrics source, ingest and prune the sample windows,
//! evaluate every applicable rule per target, report violations and clears
//! to the registry, and log one health check per evaluation.
//!
//! Ticks never overlap: scheduled ticks and detect-now both take the tick
//! guard. The monitor is the only caller of `report_violation` and
//! `report_cleared`.

use chrono::{DateTime, Utc};
use remedy_common::{
    config::MonitorConfig, HealthCheckResult, Issue, Rule, Sample, Target,
};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::evaluator::{to_chrono, Evaluator, Verdict};
use crate::ports::MetricsSource;
use crate::registry::IssueRegistry;
use crate::samples::SampleWindows;
use crate::store::HistoryStore;

/// Outcome of the most recent polls, used for staleness reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Summary of one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub samples: usize,
    pub targets: usize,
    pub evaluations: usize,
    pub unknown: usize,
    /// Issues created during this tick
    pub opened: Vec<Issue>,
    /// Issues auto-resolved during this tick
    pub resolved: Vec<Issue>,
    /// Targets whose evaluation ran past the tick timeout
    pub timed_out: Vec<Target>,
    pub poll_error: Option<String>,
}

impl TickReport {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            samples: 0,
            targets: 0,
            evaluations: 0,
            unknown: 0,
            opened: Vec::new(),
            resolved: Vec::new(),
            timed_out: Vec::new(),
            poll_error: None,
        }
    }
}

#[derive(Default)]
struct TargetOutcome {
    evaluations: usize,
    unknown: usize,
    opened: Vec<Issue>,
    resolved: Vec<Issue>,
}

pub struct Monitor {
    source: Arc<dyn MetricsSource>,
    registry: Arc<IssueRegistry>,
    store: Arc<dyn HistoryStore>,
    windows: Arc<SampleWindows>,
    evaluator: Evaluator,
    rules: Vec<Rule>,
    tick_guard: Mutex<()>,
    status: RwLock<PollStatus>,
    poll_timeout: Duration,
    tick_timeout: Duration,
    stale_after: Duration,
    resolved_retention: Duration,
}

impl Monitor {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        registry: Arc<IssueRegistry>,
        store: Arc<dyn HistoryStore>,
        rules: Vec<Rule>,
        config: &MonitorConfig,
        resolved_retention: Duration,
    ) -> Self {
        let poll_interval = config.poll_interval();
        // Keep enough history for the longest rule, plus one tick of slack
        let longest = rules
            .iter()
            .map(|r| r.lookback())
            .max()
            .unwrap_or_default()
            + poll_interval;
        let retention = config.retention().max(longest);

        info!(
            rules = rules.len(),
            retention_secs = retention.as_secs(),
            source = source.name(),
            "Monitor configured"
        );

        Self {
            source,
            registry,
            store,
            windows: Arc::new(SampleWindows::new(retention)),
            evaluator: Evaluator::new(poll_interval),
            rules,
            tick_guard: Mutex::new(()),
            status: RwLock::new(PollStatus::default()),
            poll_timeout: config.poll_timeout(),
            tick_timeout: config.tick_timeout(),
            stale_after: config.stale_after(),
            resolved_retention,
        }
    }

    pub fn windows(&self) -> &Arc<SampleWindows> {
        &self.windows
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn poll_status(&self) -> PollStatus {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True when no poll has succeeded within `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.poll_status().last_success {
            Some(at) => now - at > to_chrono(self.stale_after),
            None => true,
        }
    }

    /// Run one tick at the current time
    pub async fn tick_now(&self) -> TickReport {
        self.tick(Utc::now()).await
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _guard = self.tick_guard.lock().await;
        let mut report = TickReport::new(now);

        match self.poll().await {
            Ok(samples) => {
                report.samples = self.windows.ingest(samples).await;
                self.record_poll(now, None);
            }
            Err(message) => {
                warn!("Metrics poll failed, evaluating last known samples: {}", message);
                self.record_poll(now, Some(message.clone()));
                report.poll_error = Some(message);
            }
        }

        let dropped = self.windows.prune(now).await;
        if dropped > 0 {
            debug!(dropped, "Pruned samples outside retention");
        }

        let targets = self.windows.targets().await;
        report.targets = targets.len();

        for target in targets {
            let window = self.windows.window(&target).await;
            match tokio::time::timeout(
                self.tick_timeout,
                self.evaluate_target(&target, &window, now),
            )
            .await
            {
                Ok(outcome) => {
                    report.evaluations += outcome.evaluations;
                    report.unknown += outcome.unknown;
                    report.opened.extend(outcome.opened);
                    report.resolved.extend(outcome.resolved);
                }
                Err(_) => {
                    warn!(
                        target = %target,
                        timeout_secs = self.tick_timeout.as_secs(),
                        "Target evaluation exceeded tick timeout, abandoned"
                    );
                    report.timed_out.push(target);
                }
            }
        }

        self.registry
            .expire_resolved(now - to_chrono(self.resolved_retention));
        self.registry
            .prune_floors(now - to_chrono(self.windows.retention()));

        debug!(
            samples = report.samples,
            targets = report.targets,
            evaluations = report.evaluations,
            opened = report.opened.len(),
            resolved = report.resolved.len(),
            "Tick complete"
        );
        report
    }

    async fn poll(&self) -> std::result::Result<Vec<Sample>, String> {
        match tokio::time::timeout(self.poll_timeout, self.source.poll()).await {
            Ok(Ok(samples)) => Ok(samples),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "{} did not answer within {}s",
                self.source.name(),
                self.poll_timeout.as_secs()
            )),
        }
    }

    fn record_poll(&self, at: DateTime<Utc>, error: Option<String>) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.last_attempt = Some(at);
        match error {
            None => {
                status.last_success = Some(at);
                status.last_error = None;
                status.consecutive_failures = 0;
            }
            Some(e) => {
                status.last_error = Some(e);
                status.consecutive_failures += 1;
            }
        }
    }

    async fn evaluate_target(
        &self,
        target: &Target,
        window: &[Sample],
        now: DateTime<Utc>,
    ) -> TargetOutcome {
        let mut outcome = TargetOutcome::default();

        for rule in self.rules.iter().filter(|r| r.applies_to(target.target_type)) {
            // Restarts before a remediation are not held against the target again
            let floor = self
                .registry
                .evaluation_floor(target, &rule.id)
                .filter(|_| rule.is_restart_loop());
            let evaluation = match floor {
                Some(floor) => {
                    let since_floor: Vec<Sample> = window
                        .iter()
                        .filter(|s| s.timestamp > floor)
                        .cloned()
                        .collect();
                    self.evaluator.evaluate(rule, &since_floor, now)
                }
                None => self.evaluator.evaluate(rule, window, now),
            };
            outcome.evaluations += 1;

            match evaluation.verdict {
                Verdict::Holds => {
                    let existed = self.registry.active_for(target, &rule.id).is_some();
                    let issue = self.registry.report_violation(rule, target, now).await;
                    if !existed {
                        outcome.opened.push(issue);
                    }
                }
                Verdict::Clear => {
                    if let Some(issue) = self.registry.report_cleared(rule, target, now).await {
                        outcome.resolved.push(issue);
                    }
                }
                Verdict::Unknown => outcome.unknown += 1,
            }

            let check = HealthCheckResult {
                timestamp: now,
                target_type: target.target_type,
                target_id: target.target_id.clone(),
                rule_id: rule.id.clone(),
                status: evaluation.verdict.status(),
                observed: evaluation.observed,
            };
            if let Err(e) = self.store.append_health_check(&check) {
                warn!(target = %target, rule = %rule.id, "Failed to record health check: {}", e);
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use remedy_common::{Comparator, IssueState, RemedyError, Severity, TargetType};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Hands out one queued batch per poll; an empty queue fails the poll
    struct QueuedSource {
        batches: StdMutex<VecDeque<Vec<Sample>>>,
    }

    #[async_trait]
    impl MetricsSource for QueuedSource {
        async fn poll(&self) -> remedy_common::Result<Vec<Sample>> {
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| RemedyError::Unavailable("docker daemon unreachable".to_string()))
        }

        fn name(&self) -> &str {
            "queued"
        }
    }

    const TICK: i64 = 30;

    fn cpu_rule() -> Rule {
        Rule::threshold(
            "cpu_sustained_80",
            Some(TargetType::Container),
            "cpu_percent",
            Comparator::Gt,
            80.0,
            Duration::from_secs(4 * TICK as u64),
            Severity::High,
        )
    }

    fn setup(values: &[f64], t0: DateTime<Utc>) -> (Monitor, Arc<IssueRegistry>, Arc<MemoryStore>) {
        let c1 = Target::container("c1");
        let batches = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                vec![Sample::new(
                    &c1,
                    "cpu_percent",
                    *v,
                    t0 + chrono::Duration::seconds(i as i64 * TICK),
                )]
            })
            .collect();
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(IssueRegistry::new(store.clone(), Duration::from_secs(120)));
        let config = MonitorConfig {
            poll_interval_secs: TICK as u64,
            ..MonitorConfig::default()
        };
        let monitor = Monitor::new(
            Arc::new(QueuedSource {
                batches: StdMutex::new(batches),
            }),
            Arc::clone(&registry),
            store.clone(),
            vec![cpu_rule()],
            &config,
            Duration::from_secs(86_400),
        );
        (monitor, registry, store)
    }

    fn at(t0: DateTime<Utc>, tick: i64) -> DateTime<Utc> {
        t0 + chrono::Duration::seconds(tick * TICK)
    }

    #[tokio::test]
    async fn test_sustained_violation_opens_one_issue() {
        let t0 = Utc::now();
        let (monitor, registry, _) = setup(&[95.0, 92.0, 88.0, 85.0, 91.0], t0);

        for tick in 0..2 {
            assert!(monitor.tick(at(t0, tick)).await.opened.is_empty());
        }
        // Three of four ticks present, the missing one tolerated
        let report = monitor.tick(at(t0, 2)).await;
        assert_eq!(report.opened.len(), 1);
        assert_eq!(report.opened[0].severity, Severity::High);

        for tick in 3..5 {
            assert!(monitor.tick(at(t0, tick)).await.opened.is_empty());
        }
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_resolves_after_grace() {
        let t0 = Utc::now();
        let (monitor, registry, _) =
            setup(&[95.0, 92.0, 88.0, 85.0, 40.0, 35.0, 30.0, 30.0, 30.0], t0);

        for tick in 0..4 {
            monitor.tick(at(t0, tick)).await;
        }
        let issue = registry
            .active_for(&Target::container("c1"), "cpu_sustained_80")
            .unwrap();

        // Clear first seen at tick 4, grace is four ticks
        for tick in 4..8 {
            assert!(monitor.tick(at(t0, tick)).await.resolved.is_empty());
        }
        let report = monitor.tick(at(t0, 8)).await;
        assert_eq!(report.resolved.len(), 1);
        let resolved = registry.get(issue.id).unwrap();
        assert_eq!(resolved.state, IssueState::Resolved);
        assert!(resolved.auto_resolved);
    }

    #[tokio::test]
    async fn test_poll_failure_marks_stale_but_keeps_issue() {
        let t0 = Utc::now();
        let (monitor, registry, _) = setup(&[95.0, 92.0, 88.0, 85.0], t0);
        for tick in 0..4 {
            monitor.tick(at(t0, tick)).await;
        }
        assert!(!monitor.is_stale(at(t0, 3)));

        // Queue exhausted: every further poll fails
        for tick in 4..10 {
            let report = monitor.tick(at(t0, tick)).await;
            assert!(report.poll_error.is_some());
            assert!(report.resolved.is_empty());
        }
        assert!(monitor.is_stale(at(t0, 10)));
        assert_eq!(monitor.poll_status().consecutive_failures, 6);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_health_checks_logged_per_evaluation() {
        let t0 = Utc::now();
        let (monitor, _, store) = setup(&[95.0, 92.0], t0);
        monitor.tick(at(t0, 0)).await;
        monitor.tick(at(t0, 1)).await;

        let checks = store
            .recent_health_checks(&Target::container("c1"), 10)
            .unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].status, remedy_common::CheckStatus::Unknown);
        assert_eq!(checks[0].observed, Some(92.0));
    }

    #[test]
    fn test_retention_covers_longest_rule() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(IssueRegistry::new(store.clone(), Duration::from_secs(120)));
        let long_rule = Rule::restart_loop(
            "restart_loop",
            Some(TargetType::Container),
            5,
            Duration::from_secs(3600),
            Severity::Critical,
        );
        let monitor = Monitor::new(
            Arc::new(QueuedSource {
                batches: StdMutex::new(VecDeque::new()),
            }),
            registry,
            store,
            vec![long_rule],
            &MonitorConfig::default(),
            Duration::from_secs(86_400),
        );
        assert!(monitor.windows().retention() >= Duration::from_secs(3600));
    }
}
