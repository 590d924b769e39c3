//! History & metrics store.
//!
//! Three logical tables: issues (upsert by id), action history
//! (append-only) and health check results (append-only). The store is
//! synchronous; calls are short and made outside any per-key lock that
//! would stall the monitor.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use remedy_common::{
    config::{StorageBackend, StorageConfig},
    ActionQuery, ActionRecord, HealthCheckResult, Issue, Result, Target,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub trait HistoryStore: Send + Sync {
    fn upsert_issue(&self, issue: &Issue) -> Result<()>;

    fn load_issues(&self) -> Result<Vec<Issue>>;

    fn append_action(&self, record: &ActionRecord) -> Result<()>;

    fn action(&self, id: Uuid) -> Result<Option<ActionRecord>>;

    /// Newest first
    fn recent_actions(&self, query: &ActionQuery) -> Result<Vec<ActionRecord>>;

    fn append_health_check(&self, result: &HealthCheckResult) -> Result<()>;

    /// Newest first
    fn recent_health_checks(&self, target: &Target, limit: usize)
        -> Result<Vec<HealthCheckResult>>;
}

/// Build the configured backend
pub fn open(config: &StorageConfig) -> Result<Arc<dyn HistoryStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory history store");
            Ok(Arc::new(MemoryStore::new(config.memory_capacity)))
        }
        StorageBackend::Sqlite => {
            info!("Using SQLite history store at {}", config.path);
            Ok(Arc::new(SqliteStore::open_at(&config.path)?))
        }
    }
}
