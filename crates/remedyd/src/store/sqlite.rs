//! SQLite-backed store
//!
//! Schema:
//! - issues: one row per issue id, upserted on every lifecycle change
//! - action_history: append-only, one row per executor invocation
//! - health_checks: append-only, one row per rule evaluation

use chrono::{DateTime, Utc};
use remedy_common::{
    ActionQuery, ActionRecord, HealthCheckResult, Issue, Parameters, RemedyError, Result, Target,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::HistoryStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    resolved_at TEXT,
    auto_resolved INTEGER NOT NULL,
    state TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS action_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    action_type TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    parameters TEXT NOT NULL,
    result TEXT NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_action_target ON action_history(target_type, target_id);

CREATE TABLE IF NOT EXISTS health_checks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    status TEXT NOT NULL,
    observed REAL
);

CREATE INDEX IF NOT EXISTS idx_health_target ON health_checks(target_type, target_id);
"#;

fn db_err(e: rusqlite::Error) -> RemedyError {
    RemedyError::Storage(e.to_string())
}

fn parse<T: FromStr<Err = RemedyError>>(value: &str) -> Result<T> {
    value.parse::<T>()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| RemedyError::Storage(format!("bad id '{}': {}", value, e)))
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RemedyError::Storage(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        // WAL keeps readers off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_err)?;
        Self::init(conn, &path.display().to_string())
    }

    /// Throwaway database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        info!("History store ready ({})", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct RawIssue {
    id: String,
    target_type: String,
    target_id: String,
    rule_id: String,
    severity: String,
    description: String,
    detected_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    auto_resolved: bool,
    state: String,
}

impl RawIssue {
    fn into_issue(self) -> Result<Issue> {
        Ok(Issue {
            id: parse_uuid(&self.id)?,
            target_type: parse(&self.target_type)?,
            target_id: self.target_id,
            rule_id: self.rule_id,
            severity: parse(&self.severity)?,
            description: self.description,
            detected_at: self.detected_at,
            last_seen_at: self.last_seen_at,
            resolved_at: self.resolved_at,
            auto_resolved: self.auto_resolved,
            state: parse(&self.state)?,
        })
    }
}

struct RawAction {
    id: String,
    timestamp: DateTime<Utc>,
    action_type: String,
    target_type: String,
    target_id: String,
    parameters: String,
    result: String,
    error: Option<String>,
    duration_ms: i64,
    attempts: i64,
}

impl RawAction {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            action_type: row.get(2)?,
            target_type: row.get(3)?,
            target_id: row.get(4)?,
            parameters: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            duration_ms: row.get(8)?,
            attempts: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<ActionRecord> {
        let parameters: Parameters = serde_json::from_str(&self.parameters)?;
        Ok(ActionRecord {
            id: parse_uuid(&self.id)?,
            timestamp: self.timestamp,
            action_type: self.action_type,
            target_type: parse(&self.target_type)?,
            target_id: self.target_id,
            parameters,
            result: parse(&self.result)?,
            error: self.error,
            duration_ms: self.duration_ms.max(0) as u64,
            attempts: self.attempts.clamp(0, i64::from(u32::MAX)) as u32,
        })
    }
}

const ACTION_COLUMNS: &str = "id, timestamp, action_type, target_type, target_id, parameters, \
                              result, error, duration_ms, attempts";

impl HistoryStore for SqliteStore {
    fn upsert_issue(&self, issue: &Issue) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO issues (id, target_type, target_id, rule_id, severity, description,
                                     detected_at, last_seen_at, resolved_at, auto_resolved, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     severity = excluded.severity,
                     description = excluded.description,
                     last_seen_at = excluded.last_seen_at,
                     resolved_at = excluded.resolved_at,
                     auto_resolved = excluded.auto_resolved,
                     state = excluded.state",
                params![
                    issue.id.to_string(),
                    issue.target_type.as_str(),
                    issue.target_id,
                    issue.rule_id,
                    issue.severity.as_str(),
                    issue.description,
                    issue.detected_at,
                    issue.last_seen_at,
                    issue.resolved_at,
                    issue.auto_resolved,
                    issue.state.as_str(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_issues(&self) -> Result<Vec<Issue>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, target_type, target_id, rule_id, severity, description,
                        detected_at, last_seen_at, resolved_at, auto_resolved, state
                 FROM issues ORDER BY detected_at ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RawIssue {
                    id: row.get(0)?,
                    target_type: row.get(1)?,
                    target_id: row.get(2)?,
                    rule_id: row.get(3)?,
                    severity: row.get(4)?,
                    description: row.get(5)?,
                    detected_at: row.get(6)?,
                    last_seen_at: row.get(7)?,
                    resolved_at: row.get(8)?,
                    auto_resolved: row.get(9)?,
                    state: row.get(10)?,
                })
            })
            .map_err(db_err)?;

        let mut issues = Vec::new();
        for raw in rows {
            issues.push(raw.map_err(db_err)?.into_issue()?);
        }
        Ok(issues)
    }

    fn append_action(&self, record: &ActionRecord) -> Result<()> {
        let parameters = serde_json::to_string(&record.parameters)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO action_history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    ACTION_COLUMNS
                ),
                params![
                    record.id.to_string(),
                    record.timestamp,
                    record.action_type,
                    record.target_type.as_str(),
                    record.target_id,
                    parameters,
                    record.result.as_str(),
                    record.error,
                    record.duration_ms.min(i64::MAX as u64) as i64,
                    i64::from(record.attempts),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn action(&self, id: Uuid) -> Result<Option<ActionRecord>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM action_history WHERE id = ?1", ACTION_COLUMNS),
                params![id.to_string()],
                RawAction::from_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawAction::into_record).transpose()
    }

    fn recent_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM action_history
                 WHERE (?1 IS NULL OR target_type = ?1) AND (?2 IS NULL OR target_id = ?2)
                 ORDER BY seq DESC LIMIT ?3",
                ACTION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    query.target_type.map(|t| t.as_str()),
                    query.target_id.as_deref(),
                    query.limit.min(i64::MAX as usize) as i64,
                ],
                RawAction::from_row,
            )
            .map_err(db_err)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw.map_err(db_err)?.into_record()?);
        }
        Ok(records)
    }

    fn append_health_check(&self, result: &HealthCheckResult) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO health_checks (timestamp, target_type, target_id, rule_id, status, observed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    result.timestamp,
                    result.target_type.as_str(),
                    result.target_id,
                    result.rule_id,
                    result.status.as_str(),
                    result.observed,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn recent_health_checks(
        &self,
        target: &Target,
        limit: usize,
    ) -> Result<Vec<HealthCheckResult>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, target_type, target_id, rule_id, status, observed
                 FROM health_checks WHERE target_type = ?1 AND target_id = ?2
                 ORDER BY seq DESC LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    target.target_type.as_str(),
                    target.target_id,
                    limit.min(i64::MAX as usize) as i64,
                ],
                |row| {
                    Ok((
                        row.get::<_, DateTime<Utc>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                },
            )
            .map_err(db_err)?;

        let mut checks = Vec::new();
        for row in rows {
            let (timestamp, target_type, target_id, rule_id, status, observed) =
                row.map_err(db_err)?;
            checks.push(HealthCheckResult {
                timestamp,
                target_type: parse(&target_type)?,
                target_id,
                rule_id,
                status: parse(&status)?,
                observed,
            });
        }
        Ok(checks)
    }
}
