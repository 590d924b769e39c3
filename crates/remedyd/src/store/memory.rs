//! In-memory store with bounded logs.

use remedy_common::{ActionQuery, ActionRecord, HealthCheckResult, Issue, Result, Target};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use uuid::Uuid;

use super::HistoryStore;

pub struct MemoryStore {
    capacity: usize,
    issues: RwLock<HashMap<Uuid, Issue>>,
    actions: RwLock<VecDeque<ActionRecord>>,
    health_checks: RwLock<VecDeque<HealthCheckResult>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            issues: RwLock::new(HashMap::new()),
            actions: RwLock::new(VecDeque::new()),
            health_checks: RwLock::new(VecDeque::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) {
    if log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(item);
}

impl HistoryStore for MemoryStore {
    fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        let mut issues = self.issues.write().unwrap_or_else(|e| e.into_inner());
        issues.insert(issue.id, issue.clone());
        Ok(())
    }

    fn load_issues(&self) -> Result<Vec<Issue>> {
        let issues = self.issues.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Issue> = issues.values().cloned().collect();
        all.sort_by_key(|i| i.detected_at);
        Ok(all)
    }

    fn append_action(&self, record: &ActionRecord) -> Result<()> {
        let mut actions = self.actions.write().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut actions, record.clone(), self.capacity);
        Ok(())
    }

    fn action(&self, id: Uuid) -> Result<Option<ActionRecord>> {
        let actions = self.actions.read().unwrap_or_else(|e| e.into_inner());
        Ok(actions.iter().find(|r| r.id == id).cloned())
    }

    fn recent_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>> {
        let actions = self.actions.read().unwrap_or_else(|e| e.into_inner());
        Ok(actions
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(query.limit)
            .cloned()
            .collect())
    }

    fn append_health_check(&self, result: &HealthCheckResult) -> Result<()> {
        let mut checks = self.health_checks.write().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut checks, result.clone(), self.capacity);
        Ok(())
    }

    fn recent_health_checks(
        &self,
        target: &Target,
        limit: usize,
    ) -> Result<Vec<HealthCheckResult>> {
        let checks = self.health_checks.read().unwrap_or_else(|e| e.into_inner());
        Ok(checks
            .iter()
            .rev()
            .filter(|c| c.target_type == target.target_type && c.target_id == target.target_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
