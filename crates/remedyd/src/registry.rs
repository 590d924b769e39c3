//! Issue Registry
//!
//! Owns every Issue and its lifecycle:
//! - violations open or refresh the one active issue per `(target, rule)`
//! - clears start a confirmation that resolves the issue after a grace period
//! - the wizard drives acknowledged -> resolving -> resolved/open
//!
//! Mutations for one key are serialized through `KeyedLocks`; the index
//! itself sits behind a plain lock that is never held across an await.
//! Every change is upserted into the history store, and a store failure is
//! logged without failing the call.

use chrono::{DateTime, Utc};
use remedy_common::{
    Issue, IssueFilter, IssueId, IssueState, RemedyError, Result, Rule, Target,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::evaluator::to_chrono;
use crate::keyed::KeyedLocks;
use crate::store::HistoryStore;

type IssueKey = (Target, String);

#[derive(Default)]
struct Index {
    issues: HashMap<IssueId, Issue>,
    active: HashMap<IssueKey, IssueId>,
    /// First clear observation of an issue still waiting out its grace period
    pending_clear: HashMap<IssueId, DateTime<Utc>>,
    /// When a remediated issue was resolved; earlier samples are already handled
    floors: HashMap<IssueKey, DateTime<Utc>>,
}

impl Index {
    fn key_of(&self, id: IssueId) -> Result<IssueKey> {
        self.issues
            .get(&id)
            .map(|issue| (issue.target(), issue.rule_id.clone()))
            .ok_or_else(|| RemedyError::NotFound(format!("issue {}", id)))
    }
}

pub struct IssueRegistry {
    store: Arc<dyn HistoryStore>,
    clear_grace: Duration,
    locks: KeyedLocks<IssueKey>,
    index: RwLock<Index>,
}

impl IssueRegistry {
    pub fn new(store: Arc<dyn HistoryStore>, clear_grace: Duration) -> Self {
        Self {
            store,
            clear_grace,
            locks: KeyedLocks::new(),
            index: RwLock::new(Index::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, issue: &Issue) {
        if let Err(e) = self.store.upsert_issue(issue) {
            warn!(issue_id = %issue.id, "Failed to persist issue: {}", e);
        }
    }

    /// Record that `rule` holds for `target`. Idempotent while the issue is active.
    pub async fn report_violation(
        &self,
        rule: &Rule,
        target: &Target,
        observed_at: DateTime<Utc>,
    ) -> Issue {
        let key = (target.clone(), rule.id.clone());
        let _guard = self.locks.lock(&key).await;

        let issue = {
            let mut index = self.write();
            let existing = index.active.get(&key).copied();
            let refreshed = match existing {
                Some(id) => {
                    index.pending_clear.remove(&id);
                    match index.issues.get_mut(&id) {
                        Some(issue) => {
                            if observed_at > issue.last_seen_at {
                                issue.last_seen_at = observed_at;
                            }
                            Some(issue.clone())
                        }
                        None => None,
                    }
                }
                None => None,
            };

            match refreshed {
                Some(issue) => issue,
                None => {
                    let issue = Issue::new(
                        target,
                        rule.id.clone(),
                        rule.severity,
                        rule.description.clone(),
                        observed_at,
                    );
                    info!(
                        issue_id = %issue.id,
                        target = %target,
                        rule = %rule.id,
                        severity = %rule.severity,
                        "Issue opened"
                    );
                    index.active.insert(key.clone(), issue.id);
                    index.issues.insert(issue.id, issue.clone());
                    issue
                }
            }
        };

        self.persist(&issue);
        issue
    }

    /// Record that `rule` no longer holds for `target`.
    ///
    /// Returns the issue when this call auto-resolved it. Issues in
    /// `resolving` belong to a wizard session and are left alone.
    pub async fn report_cleared(
        &self,
        rule: &Rule,
        target: &Target,
        observed_at: DateTime<Utc>,
    ) -> Option<Issue> {
        let key = (target.clone(), rule.id.clone());
        let _guard = self.locks.lock(&key).await;

        let resolved = {
            let mut index = self.write();
            let id = index.active.get(&key).copied()?;
            let state = index.issues.get(&id)?.state;
            if state == IssueState::Resolving {
                return None;
            }

            let first_clear = *index.pending_clear.entry(id).or_insert(observed_at);
            if observed_at - first_clear < to_chrono(self.clear_grace) {
                debug!(issue_id = %id, "Clear observed, waiting out grace period");
                return None;
            }

            index.pending_clear.remove(&id);
            index.active.remove(&key);
            let issue = index.issues.get_mut(&id)?;
            issue.state = IssueState::Resolved;
            issue.auto_resolved = true;
            issue.resolved_at = Some(observed_at);
            issue.clone()
        };

        info!(
            issue_id = %resolved.id,
            target = %target,
            rule = %rule.id,
            "Issue auto-resolved"
        );
        self.persist(&resolved);
        Some(resolved)
    }

    /// Apply a state change to one issue under its key lock
    async fn update<F>(&self, id: IssueId, apply: F) -> Result<Issue>
    where
        F: FnOnce(&mut Issue) -> Result<bool>,
    {
        let key = self.read().key_of(id)?;
        let _guard = self.locks.lock(&key).await;

        let (issue, changed) = {
            let mut index = self.write();
            let issue = index
                .issues
                .get_mut(&id)
                .ok_or_else(|| RemedyError::NotFound(format!("issue {}", id)))?;
            let changed = apply(issue)?;
            let snapshot = issue.clone();
            if snapshot.state == IssueState::Resolved {
                index.active.remove(&key);
                index.pending_clear.remove(&id);
                if let Some(at) = snapshot.resolved_at {
                    index.floors.insert(key.clone(), at);
                }
            }
            (snapshot, changed)
        };

        if changed {
            debug!(issue_id = %id, state = %issue.state, "Issue updated");
            self.persist(&issue);
        }
        Ok(issue)
    }

    /// open -> acknowledged. Acknowledging twice is a no-op.
    pub async fn acknowledge(&self, id: IssueId) -> Result<Issue> {
        self.update(id, |issue| match issue.state {
            IssueState::Open => {
                issue.state = IssueState::Acknowledged;
                Ok(true)
            }
            IssueState::Acknowledged => Ok(false),
            IssueState::Resolving => Err(RemedyError::Conflict(format!(
                "issue {} is being remediated",
                issue.id
            ))),
            IssueState::Resolved => Err(RemedyError::NotFound(format!(
                "issue {} is already resolved",
                issue.id
            ))),
        })
        .await
    }

    /// acknowledged -> resolving
    pub async fn mark_resolving(&self, id: IssueId) -> Result<Issue> {
        self.update(id, |issue| match issue.state {
            IssueState::Acknowledged => {
                issue.state = IssueState::Resolving;
                Ok(true)
            }
            other => Err(RemedyError::Conflict(format!(
                "issue {} is {}, expected acknowledged",
                issue.id, other
            ))),
        })
        .await
    }

    /// resolving -> resolved
    pub async fn mark_resolved(&self, id: IssueId, auto_resolved: bool) -> Result<Issue> {
        self.update(id, |issue| match issue.state {
            IssueState::Resolving => {
                issue.state = IssueState::Resolved;
                issue.auto_resolved = auto_resolved;
                issue.resolved_at = Some(Utc::now());
                Ok(true)
            }
            other => Err(RemedyError::Conflict(format!(
                "issue {} is {}, expected resolving",
                issue.id, other
            ))),
        })
        .await
    }

    /// acknowledged/resolving -> open, after a failed remediation
    pub async fn reopen(&self, id: IssueId) -> Result<Issue> {
        self.update(id, |issue| match issue.state {
            IssueState::Acknowledged | IssueState::Resolving => {
                issue.state = IssueState::Open;
                Ok(true)
            }
            IssueState::Open => Ok(false),
            IssueState::Resolved => Err(RemedyError::Conflict(format!(
                "issue {} is already resolved",
                issue.id
            ))),
        })
        .await
    }

    /// resolving -> acknowledged, after an abandoned session
    pub async fn revert_to_acknowledged(&self, id: IssueId) -> Result<Issue> {
        self.update(id, |issue| match issue.state {
            IssueState::Resolving => {
                issue.state = IssueState::Acknowledged;
                Ok(true)
            }
            IssueState::Acknowledged => Ok(false),
            other => Err(RemedyError::Conflict(format!(
                "issue {} is {}, cannot revert to acknowledged",
                issue.id, other
            ))),
        })
        .await
    }

    pub fn get(&self, id: IssueId) -> Result<Issue> {
        self.read()
            .issues
            .get(&id)
            .cloned()
            .ok_or_else(|| RemedyError::NotFound(format!("issue {}", id)))
    }

    /// Active issues matching `filter`, most severe first, then oldest first
    pub fn list_open(&self, filter: &IssueFilter) -> Vec<Issue> {
        let index = self.read();
        let mut issues: Vec<Issue> = index
            .active
            .values()
            .filter_map(|id| index.issues.get(id))
            .filter(|issue| filter.matches(issue))
            .cloned()
            .collect();
        drop(index);

        issues.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.detected_at.cmp(&b.detected_at))
                .then(a.id.cmp(&b.id))
        });
        issues
    }

    /// The active issue for a key, if any
    pub fn active_for(&self, target: &Target, rule_id: &str) -> Option<Issue> {
        let index = self.read();
        let id = index.active.get(&(target.clone(), rule_id.to_string()))?;
        index.issues.get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.read().active.len()
    }

    /// Resolution time of the last remediated issue for a key. Event counts
    /// for the key should start after it.
    pub fn evaluation_floor(&self, target: &Target, rule_id: &str) -> Option<DateTime<Utc>> {
        self.read()
            .floors
            .get(&(target.clone(), rule_id.to_string()))
            .copied()
    }

    /// Forget floors no sample window reaches back to anymore
    pub fn prune_floors(&self, older_than: DateTime<Utc>) -> usize {
        let mut index = self.write();
        let before = index.floors.len();
        index.floors.retain(|_, at| *at >= older_than);
        before - index.floors.len()
    }

    /// Forget resolved issues older than `older_than`. They stay in the store.
    pub fn expire_resolved(&self, older_than: DateTime<Utc>) -> usize {
        let expired = {
            let mut index = self.write();
            let before = index.issues.len();
            index.issues.retain(|_, issue| {
                issue.state != IssueState::Resolved
                    || issue.resolved_at.map_or(true, |at| at >= older_than)
            });
            before - index.issues.len()
        };
        self.locks.prune();
        if expired > 0 {
            debug!(count = expired, "Expired resolved issues");
        }
        expired
    }

    /// Rebuild the index from persisted issues. Resolved issues are skipped.
    pub fn restore(&self, issues: Vec<Issue>) -> usize {
        let mut index = self.write();
        let mut restored = 0;
        for issue in issues {
            if !issue.state.is_active() {
                continue;
            }
            let key = (issue.target(), issue.rule_id.clone());
            if let Some(existing) = index.active.get(&key) {
                warn!(
                    issue_id = %issue.id,
                    kept = %existing,
                    "Duplicate active issue in store, skipping"
                );
                continue;
            }
            index.active.insert(key, issue.id);
            index.issues.insert(issue.id, issue);
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Restored active issues");
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use remedy_common::{Comparator, Severity, TargetType};

    fn registry() -> IssueRegistry {
        IssueRegistry::new(Arc::new(MemoryStore::default()), Duration::from_secs(120))
    }

    fn rule(id: &str, severity: Severity) -> Rule {
        Rule::threshold(
            id,
            Some(TargetType::Container),
            "cpu_percent",
            Comparator::Gt,
            80.0,
            Duration::from_secs(120),
            severity,
        )
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    // ========================================================================
    // Violations and clears
    // ========================================================================

    #[tokio::test]
    async fn test_repeated_violations_keep_one_issue() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let first = reg.report_violation(&r, &c1, t0).await;
        for i in 1..10 {
            let again = reg.report_violation(&r, &c1, t0 + secs(i * 30)).await;
            assert_eq!(again.id, first.id);
        }
        assert_eq!(reg.active_count(), 1);
        assert_eq!(reg.get(first.id).unwrap().last_seen_at, t0 + secs(270));
        assert_eq!(first.severity, Severity::High);
        assert_eq!(first.state, IssueState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_violations_dedup() {
        let reg = Arc::new(registry());
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let mut handles = Vec::new();
        for i in 0..16 {
            let reg = Arc::clone(&reg);
            let r = r.clone();
            let c1 = c1.clone();
            handles.push(tokio::spawn(async move {
                reg.report_violation(&r, &c1, t0 + secs(i)).await.id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(reg.list_open(&IssueFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backward() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let issue = reg.report_violation(&r, &c1, t0 + secs(60)).await;
        reg.report_violation(&r, &c1, t0).await;
        assert_eq!(reg.get(issue.id).unwrap().last_seen_at, t0 + secs(60));
    }

    #[tokio::test]
    async fn test_clear_resolves_after_grace() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let issue = reg.report_violation(&r, &c1, t0).await;
        assert!(reg.report_cleared(&r, &c1, t0 + secs(30)).await.is_none());
        assert!(reg.report_cleared(&r, &c1, t0 + secs(90)).await.is_none());

        let resolved = reg.report_cleared(&r, &c1, t0 + secs(150)).await.unwrap();
        assert_eq!(resolved.id, issue.id);
        assert_eq!(resolved.state, IssueState::Resolved);
        assert!(resolved.auto_resolved);
        assert_eq!(resolved.resolved_at, Some(t0 + secs(150)));
        assert_eq!(reg.active_count(), 0);
    }

    #[tokio::test]
    async fn test_violation_cancels_pending_clear() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        reg.report_violation(&r, &c1, t0).await;
        reg.report_cleared(&r, &c1, t0 + secs(30)).await;
        reg.report_violation(&r, &c1, t0 + secs(60)).await;
        // Grace restarts from the next clear
        assert!(reg.report_cleared(&r, &c1, t0 + secs(160)).await.is_none());
        assert!(reg.report_cleared(&r, &c1, t0 + secs(280)).await.is_some());
    }

    #[tokio::test]
    async fn test_new_issue_after_resolution() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let first = reg.report_violation(&r, &c1, t0).await;
        reg.report_cleared(&r, &c1, t0 + secs(10)).await;
        reg.report_cleared(&r, &c1, t0 + secs(200)).await;
        let second = reg.report_violation(&r, &c1, t0 + secs(300)).await;
        assert_ne!(first.id, second.id);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_acknowledge_transitions() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let issue = reg
            .report_violation(&r, &Target::container("c1"), Utc::now())
            .await;

        let acked = reg.acknowledge(issue.id).await.unwrap();
        assert_eq!(acked.state, IssueState::Acknowledged);
        // Second acknowledge is a no-op
        assert_eq!(
            reg.acknowledge(issue.id).await.unwrap().state,
            IssueState::Acknowledged
        );

        reg.mark_resolving(issue.id).await.unwrap();
        let err = reg.acknowledge(issue.id).await.unwrap_err();
        assert_eq!(err.kind(), remedy_common::ErrorKind::Conflict);

        let err = reg.acknowledge(uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), remedy_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mark_resolved_requires_resolving() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let issue = reg
            .report_violation(&r, &Target::container("c1"), Utc::now())
            .await;

        assert!(reg.mark_resolved(issue.id, false).await.is_err());
        assert!(reg.mark_resolving(issue.id).await.is_err());

        reg.acknowledge(issue.id).await.unwrap();
        reg.mark_resolving(issue.id).await.unwrap();
        let resolved = reg.mark_resolved(issue.id, false).await.unwrap();
        assert_eq!(resolved.state, IssueState::Resolved);
        assert!(!resolved.auto_resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(reg.list_open(&IssueFilter::with_acknowledged()).is_empty());
    }

    #[tokio::test]
    async fn test_resolving_issue_ignores_clears() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();
        let issue = reg.report_violation(&r, &c1, t0).await;
        reg.acknowledge(issue.id).await.unwrap();
        reg.mark_resolving(issue.id).await.unwrap();

        reg.report_cleared(&r, &c1, t0 + secs(10)).await;
        assert!(reg.report_cleared(&r, &c1, t0 + secs(500)).await.is_none());
        assert_eq!(reg.get(issue.id).unwrap().state, IssueState::Resolving);
    }

    #[tokio::test]
    async fn test_reopen_and_revert() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let issue = reg
            .report_violation(&r, &Target::container("c1"), Utc::now())
            .await;
        reg.acknowledge(issue.id).await.unwrap();
        reg.mark_resolving(issue.id).await.unwrap();

        let reverted = reg.revert_to_acknowledged(issue.id).await.unwrap();
        assert_eq!(reverted.state, IssueState::Acknowledged);

        let reopened = reg.reopen(issue.id).await.unwrap();
        assert_eq!(reopened.state, IssueState::Open);
        assert_eq!(reg.list_open(&IssueFilter::default()).len(), 1);
    }

    // ========================================================================
    // Listing, expiry, restore
    // ========================================================================

    #[tokio::test]
    async fn test_list_open_ordering() {
        let reg = registry();
        let t0 = Utc::now();
        let low = rule("low", Severity::Low);
        let crit = rule("crit", Severity::Critical);
        let high = rule("high", Severity::High);

        reg.report_violation(&low, &Target::container("a"), t0).await;
        reg.report_violation(&high, &Target::container("b"), t0 + secs(5)).await;
        reg.report_violation(&crit, &Target::container("c"), t0 + secs(10)).await;
        reg.report_violation(&high, &Target::container("d"), t0 + secs(1)).await;

        let listed: Vec<_> = reg
            .list_open(&IssueFilter::default())
            .into_iter()
            .map(|i| i.target_id)
            .collect();
        assert_eq!(listed, vec!["c", "d", "b", "a"]);
    }

    #[tokio::test]
    async fn test_list_open_filters() {
        let reg = registry();
        let t0 = Utc::now();
        let high = rule("high", Severity::High);
        let low = rule("low", Severity::Low);

        let acked = reg.report_violation(&high, &Target::container("a"), t0).await;
        reg.report_violation(&low, &Target::container("b"), t0).await;
        reg.acknowledge(acked.id).await.unwrap();

        assert_eq!(reg.list_open(&IssueFilter::default()).len(), 1);
        assert_eq!(reg.list_open(&IssueFilter::with_acknowledged()).len(), 2);

        let filter = IssueFilter {
            include_acknowledged: true,
            min_severity: Some(Severity::Medium),
            ..IssueFilter::default()
        };
        let listed = reg.list_open(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, acked.id);
    }

    #[tokio::test]
    async fn test_remediated_resolution_sets_floor() {
        let reg = registry();
        let r = rule("restart_loop", Severity::Critical);
        let c2 = Target::container("c2");
        let t0 = Utc::now();

        // Resolved by clearing: no floor
        reg.report_violation(&r, &c2, t0).await;
        reg.report_cleared(&r, &c2, t0).await;
        reg.report_cleared(&r, &c2, t0 + secs(120)).await;
        assert!(reg.evaluation_floor(&c2, "restart_loop").is_none());

        let issue = reg.report_violation(&r, &c2, t0 + secs(200)).await;
        reg.acknowledge(issue.id).await.unwrap();
        reg.mark_resolving(issue.id).await.unwrap();
        let resolved = reg.mark_resolved(issue.id, false).await.unwrap();

        let floor = reg.evaluation_floor(&c2, "restart_loop").unwrap();
        assert_eq!(Some(floor), resolved.resolved_at);
        assert!(reg
            .evaluation_floor(&Target::container("c1"), "restart_loop")
            .is_none());

        assert_eq!(reg.prune_floors(floor), 0);
        assert_eq!(reg.prune_floors(floor + secs(1)), 1);
        assert!(reg.evaluation_floor(&c2, "restart_loop").is_none());
    }

    #[tokio::test]
    async fn test_expire_resolved() {
        let reg = registry();
        let r = rule("cpu_sustained_80", Severity::High);
        let c1 = Target::container("c1");
        let t0 = Utc::now();

        let issue = reg.report_violation(&r, &c1, t0).await;
        reg.report_cleared(&r, &c1, t0).await;
        reg.report_cleared(&r, &c1, t0 + secs(120)).await;

        assert_eq!(reg.expire_resolved(t0), 0);
        assert_eq!(reg.expire_resolved(t0 + secs(500)), 1);
        assert!(reg.get(issue.id).is_err());
    }

    #[tokio::test]
    async fn test_store_receives_upserts_and_restore_rebuilds() {
        let store: Arc<dyn HistoryStore> = Arc::new(MemoryStore::default());
        let reg = IssueRegistry::new(Arc::clone(&store), Duration::from_secs(120));
        let r = rule("cpu_sustained_80", Severity::High);
        let issue = reg
            .report_violation(&r, &Target::container("c1"), Utc::now())
            .await;
        reg.acknowledge(issue.id).await.unwrap();

        let persisted = store.load_issues().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].state, IssueState::Acknowledged);

        let fresh = IssueRegistry::new(Arc::clone(&store), Duration::from_secs(120));
        assert_eq!(fresh.restore(persisted), 1);
        let again = fresh
            .report_violation(&r, &Target::container("c1"), Utc::now())
            .await;
        assert_eq!(again.id, issue.id);
    }
}
