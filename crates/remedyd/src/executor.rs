//! Action Executor - runs remediation actions against targets
//!
//! Actions on one target run one at a time, in submission order. Actions on
//! different targets run concurrently, bounded by a semaphore. Every call
//! produces exactly one `ActionRecord`, whatever happened.

use chrono::Utc;
use remedy_common::{
    config::ExecutorConfig, ActionKind, ActionOutcome, ActionRecord, Parameters, RemedyError,
    Result, Target,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::keyed::KeyedLocks;
use crate::ports::CommandRunner;
use crate::store::HistoryStore;

/// A validated action, ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub target: Target,
    /// Overrides the configured action timeout
    pub timeout: Option<Duration>,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, target: Target) -> Self {
        Self {
            kind,
            target,
            timeout: None,
        }
    }

    /// Parse a free-form action. Unknown types and unsupported targets are rejected here.
    pub fn parse(action_type: &str, parameters: &Parameters, target: Target) -> Result<Self> {
        let kind = ActionKind::parse(action_type, parameters)?;
        if !kind.supports(target.target_type) {
            return Err(RemedyError::InvalidRequest(format!(
                "{} is not supported for {} targets",
                action_type, target.target_type
            )));
        }
        Ok(Self::new(kind, target))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Requests cancellation of an in-flight action
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observed by the executor while an action is queued or running
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&mut self) {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return std::future::pending().await,
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                return std::future::pending().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (
        CancelHandle { tx: Arc::new(tx) },
        CancelToken { rx: Some(rx) },
    )
}

// ============================================================================
// Executor
// ============================================================================

enum Finished {
    Done(Result<String>),
    TimedOut(Duration),
    Cancelled,
}

pub struct ActionExecutor {
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn HistoryStore>,
    queues: KeyedLocks<Target>,
    permits: Semaphore,
    action_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ActionExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn HistoryStore>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            store,
            queues: KeyedLocks::new(),
            permits: Semaphore::new(config.max_concurrency.max(1)),
            action_timeout: config.action_timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Run one action and record it. Never fails: the outcome is in the record.
    pub async fn execute(&self, request: ActionRequest, cancel: Option<CancelToken>) -> ActionRecord {
        let mut cancel = cancel.unwrap_or_else(CancelToken::never);
        let timeout = request.timeout.unwrap_or(self.action_timeout);
        let timestamp = Utc::now();
        let started = Instant::now();
        let mut attempts = 0u32;

        let finished = {
            let work = async {
                let _queue = self.queues.lock(&request.target).await;
                let _permit = match self.permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Finished::Done(Err(RemedyError::Unavailable(
                            "executor is shutting down".to_string(),
                        )))
                    }
                };
                match tokio::time::timeout(
                    timeout,
                    self.run_with_retries(&request, timeout, &mut attempts),
                )
                .await
                {
                    Ok(result) => Finished::Done(result),
                    Err(_) => Finished::TimedOut(timeout),
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Finished::Cancelled,
                finished = work => finished,
            }
        };
        self.queues.prune();

        let (result, error) = match finished {
            Finished::Done(Ok(_)) => (ActionOutcome::Success, None),
            Finished::Done(Err(e)) => (ActionOutcome::Failure, Some(e.to_string())),
            Finished::TimedOut(after) => (
                ActionOutcome::Timeout,
                Some(format!("timed out after {}s", after.as_secs_f64())),
            ),
            Finished::Cancelled => (ActionOutcome::Failure, Some("cancelled".to_string())),
        };

        let record = ActionRecord {
            id: Uuid::new_v4(),
            timestamp,
            action_type: request.kind.action_type().to_string(),
            target_type: request.target.target_type,
            target_id: request.target.target_id.clone(),
            parameters: request.kind.parameters(),
            result,
            error,
            duration_ms: started.elapsed().as_millis().min(u64::MAX as u128) as u64,
            attempts,
        };

        match record.result {
            ActionOutcome::Success => info!(
                action_id = %record.id,
                target = %request.target,
                action = %record.action_type,
                attempts = record.attempts,
                "Action succeeded"
            ),
            _ => warn!(
                action_id = %record.id,
                target = %request.target,
                action = %record.action_type,
                result = record.result.as_str(),
                "Action did not succeed: {}",
                record.error.as_deref().unwrap_or("")
            ),
        }

        if let Err(e) = self.store.append_action(&record) {
            error!(action_id = %record.id, "Failed to append action record: {}", e);
        }
        record
    }

    async fn run_with_retries(
        &self,
        request: &ActionRequest,
        timeout: Duration,
        attempts: &mut u32,
    ) -> Result<String> {
        let max_attempts = if request.kind.is_idempotent() {
            1 + self.max_retries
        } else {
            1
        };
        let mut backoff = self.retry_backoff;

        loop {
            *attempts += 1;
            match self.runner.run(&request.kind, &request.target, timeout).await {
                Ok(output) => return Ok(output),
                Err(e) if *attempts < max_attempts => {
                    warn!(
                        target = %request.target,
                        action = request.kind.action_type(),
                        attempt = *attempts,
                        "Action attempt failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
