//! # Resilient Connection
//!
//! Every primary-store operation goes through [`ResilientConnection::execute`]:
//!
//! 1. No driver, forced fallback, or a breaker refusal: straight to the fallback
//!    tier, no network attempt.
//! 2. Otherwise up to `max_retries` attempts, each in its own [`ScopedSession`]
//!    under the connection timeout. Only retryable kinds are retried; a fatal
//!    error fails after one attempt.
//! 3. The call's outcome is fed to the circuit breaker once. Exhausted or fatal
//!    calls are served by the fallback tier and returned as
//!    [`ExecuteOutcome::Fallback`].
//!
//! Recovery from `Degraded` needs `half_open_max_calls` consecutive successes,
//! and probes count as ordinary successes there. From `Unavailable` or
//! `CircuitOpen` one successful [`probe`](ResilientConnection::probe) is the
//! reconnect. Either flip to `Healthy` starts a background sync pass.
//!
//! The handle is cheap to clone; all clones share one state machine.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use kurultai_core::config::KurultaiConfig;
//! use kurultai_core::connection::{Operation, ResilientConnection};
//! use kurultai_core::fallback::{FallbackStore, FallbackTable};
//! use kurultai_core::store::{MemoryGraphStore, Params};
//!
//! # tokio_test::block_on(async {
//! let mut config = KurultaiConfig::default();
//! # config.retry.base_delay_ms = 0;
//! # config.retry.max_delay_ms = 0;
//! let store = MemoryGraphStore::new();
//! let fallback = FallbackStore::in_memory(&config.fallback).await.unwrap();
//! let connection = ResilientConnection::new(Some(Arc::new(store.clone())), fallback, &config);
//!
//! // the primary store goes away; the write is kept locally and queued
//! store.set_unavailable(true);
//! let mut task = Params::new();
//! task.insert("status".to_string(), "pending".into());
//! let outcome = connection
//!     .execute(Operation::upsert(FallbackTable::Tasks, "t-1", task))
//!     .await
//!     .unwrap();
//! assert!(outcome.is_fallback());
//!
//! // once it is back, the queued write is replayed
//! store.set_unavailable(false);
//! let report = connection.sync_pending().await.unwrap().unwrap();
//! assert_eq!(report.synced, 1);
//! # });
//! ```

pub mod operation;
pub mod session;
pub mod status;
pub mod sync;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::KurultaiConfig;
use crate::error::{ErrorKind, KurultaiResult, StoreError};
use crate::fallback::{FallbackExport, FallbackStore, ImportSummary, SyncQueueEntry};
use crate::logging::{log_error, log_store_operation};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorClassifier, Rejection, RetryPolicy,
    StandardErrorClassifier,
};
use crate::store::{GraphStore, Row, Statement};

pub use operation::{ExecuteOutcome, FallbackAction, FallbackResult, Operation};
pub use session::ScopedSession;
pub use status::{ConnectionState, ConnectionStatus};
pub use sync::SyncReport;

#[derive(Debug, Clone)]
struct ConnectionInner {
    state: ConnectionState,
    consecutive_successes: u32,
    forced_fallback: bool,
    last_error: Option<StoreError>,
    last_error_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

pub(crate) struct ConnectionShared {
    store: Option<Arc<dyn GraphStore>>,
    breaker: CircuitBreaker,
    fallback: FallbackStore,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    successes_required: u32,
    classifier: StandardErrorClassifier,
    inner: Mutex<ConnectionInner>,
    primary_calls: AtomicU64,
    fallback_calls: AtomicU64,
    sync_running: AtomicBool,
    last_sync: Mutex<Option<SyncReport>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

/// Primary store with retry, circuit breaking and a durable fallback tier
#[derive(Clone)]
pub struct ResilientConnection {
    shared: Arc<ConnectionShared>,
}

impl std::fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("store", &self.shared.store)
            .field("state", &self.state())
            .field("circuit", &self.shared.breaker.state())
            .field("fallback", &self.shared.fallback)
            .finish()
    }
}

impl ResilientConnection {
    /// Build from the loaded configuration.
    ///
    /// `store` is `None` when no driver or credentials are available; every
    /// operation is then served by the fallback tier.
    pub fn new(
        store: Option<Arc<dyn GraphStore>>,
        fallback: FallbackStore,
        config: &KurultaiConfig,
    ) -> Self {
        Self::from_parts(
            store,
            fallback,
            RetryPolicy::from(&config.retry),
            CircuitBreakerConfig::from(&config.circuit_breaker),
            config.primary_store.connection_timeout(),
        )
    }

    pub fn from_parts(
        store: Option<Arc<dyn GraphStore>>,
        fallback: FallbackStore,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
        attempt_timeout: Duration,
    ) -> Self {
        if store.is_none() {
            warn!("No primary store configured; operating in fallback mode");
        }
        let successes_required = breaker.half_open_max_calls.max(1);

        Self {
            shared: Arc::new(ConnectionShared {
                store,
                breaker: CircuitBreaker::new("primary_store", breaker),
                fallback,
                retry,
                attempt_timeout,
                successes_required,
                classifier: StandardErrorClassifier::new(),
                inner: Mutex::new(ConnectionInner {
                    state: ConnectionState::Unavailable,
                    consecutive_successes: 0,
                    forced_fallback: false,
                    last_error: None,
                    last_error_at: None,
                    last_success_at: None,
                }),
                primary_calls: AtomicU64::new(0),
                fallback_calls: AtomicU64::new(0),
                sync_running: AtomicBool::new(false),
                last_sync: Mutex::new(None),
                sync_task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn has_primary_store(&self) -> bool {
        self.shared.store.is_some()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    pub fn fallback(&self) -> &FallbackStore {
        &self.shared.fallback
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.retry
    }

    /// Run an operation against the primary store, falling back when it cannot
    /// be served. The only error is a failure of the fallback tier itself.
    pub async fn execute(&self, operation: Operation) -> KurultaiResult<ExecuteOutcome> {
        let shared = &self.shared;
        let Some(store) = shared.store.clone() else {
            return self
                .run_fallback(&operation, "primary store not configured")
                .await;
        };
        if shared.inner.lock().forced_fallback {
            return self.run_fallback(&operation, "fallback mode forced").await;
        }
        if let Err(rejection) = shared.breaker.check() {
            if rejection == Rejection::CircuitOpen {
                self.set_state(ConnectionState::CircuitOpen);
            }
            debug!(operation = %operation.name, reason = %rejection, "Primary store bypassed");
            return self.run_fallback(&operation, &rejection.to_string()).await;
        }

        let started = Instant::now();
        match self
            .attempt_with_retry(store.as_ref(), &operation)
            .await
        {
            Ok(rows) => {
                shared.breaker.record_success(operation.cost);
                shared.primary_calls.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                log_store_operation(
                    &operation.name,
                    "primary",
                    None,
                    None,
                    "success",
                    Some(started.elapsed().as_millis() as u64),
                );
                Ok(ExecuteOutcome::Primary(rows))
            }
            Err(e) => {
                shared.breaker.record_failure();
                self.on_failure(&e);
                let classification = shared.classifier.classify(&e);
                if e.kind == ErrorKind::Fatal {
                    log_error(
                        "resilient_connection",
                        &operation.name,
                        &e.to_string(),
                        Some(&classification.error_code),
                    );
                } else {
                    warn!(
                        operation = %operation.name,
                        kind = %e.kind,
                        category = %classification.category,
                        attempts = shared.retry.max_retries,
                        error = %e.message,
                        "Primary store operation failed after retries; using fallback"
                    );
                }
                self.run_fallback(&operation, &e.to_string()).await
            }
        }
    }

    /// One-shot liveness check used as the reconnect signal. Never touches the
    /// fallback tier.
    pub async fn probe(&self) -> ConnectionState {
        let shared = &self.shared;
        let Some(store) = shared.store.clone() else {
            return self.state();
        };
        if shared.inner.lock().forced_fallback {
            return self.state();
        }
        if let Err(rejection) = shared.breaker.check() {
            if rejection == Rejection::CircuitOpen {
                self.set_state(ConnectionState::CircuitOpen);
            }
            return self.state();
        }

        match self.attempt_once(store.as_ref(), &[Statement::Ping]).await {
            Ok(_) => {
                shared.breaker.record_success(0.0);
                if self.state() == ConnectionState::Degraded {
                    self.on_success();
                    return self.state();
                }
                let recovered = {
                    let mut inner = shared.inner.lock();
                    let recovered = inner.state != ConnectionState::Healthy;
                    inner.state = ConnectionState::Healthy;
                    inner.consecutive_successes = 0;
                    inner.last_success_at = Some(Utc::now());
                    recovered
                };
                if recovered {
                    info!(store = store.name(), "Primary store reachable; connection healthy");
                    self.trigger_sync();
                }
            }
            Err(e) => {
                shared.breaker.record_failure();
                self.on_failure(&e);
                debug!(error = %e, "Primary store probe failed");
            }
        }
        self.state()
    }

    async fn attempt_with_retry(
        &self,
        store: &dyn GraphStore,
        operation: &Operation,
    ) -> Result<Vec<Row>, StoreError> {
        let policy = &self.shared.retry;
        let statements = std::slice::from_ref(&operation.statement);
        let mut attempt = 0;
        loop {
            match self.attempt_once(store, statements).await {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= policy.max_retries {
                        return Err(e);
                    }
                    let delay = policy.delay_for_attempt(attempt - 1);
                    debug!(
                        operation = %operation.name,
                        attempt = attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying primary store operation"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Single attempt in a fresh session, bounded by the connection timeout
    pub(crate) async fn attempt_once(
        &self,
        store: &dyn GraphStore,
        statements: &[Statement],
    ) -> Result<Vec<Row>, StoreError> {
        let timeout = self.shared.attempt_timeout;
        let attempt = async {
            let mut session = ScopedSession::acquire(store).await?;
            let rows = session.run_all(statements).await;
            session.close().await;
            rows
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient(format!(
                "attempt timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn run_fallback(
        &self,
        operation: &Operation,
        reason: &str,
    ) -> KurultaiResult<ExecuteOutcome> {
        self.shared.fallback_calls.fetch_add(1, Ordering::Relaxed);
        let fallback = &self.shared.fallback;

        let result = match &operation.fallback {
            FallbackAction::Queue(write) => {
                let entry = fallback.queue_write(write.clone()).await.inspect_err(|e| {
                    log_error(
                        "fallback_store",
                        &operation.name,
                        &e.to_string(),
                        Some(reason),
                    )
                })?;
                log_store_operation(
                    &operation.name,
                    "fallback",
                    Some(entry.table.as_str()),
                    Some(&entry.record_id),
                    "queued",
                    None,
                );
                FallbackResult::Queued {
                    table: entry.table,
                    record_id: entry.record_id,
                    queue_id: entry.id,
                }
            }
            FallbackAction::Read { selector, limit } => {
                let records = fallback.get_records(selector, *limit).await.inspect_err(|e| {
                    log_error(
                        "fallback_store",
                        &operation.name,
                        &e.to_string(),
                        Some(reason),
                    )
                })?;
                FallbackResult::Records { records }
            }
            FallbackAction::None => FallbackResult::Skipped {
                reason: reason.to_string(),
            },
        };
        Ok(ExecuteOutcome::Fallback(result))
    }

    fn on_success(&self) {
        let recovered = {
            let mut inner = self.shared.inner.lock();
            inner.last_success_at = Some(Utc::now());
            if inner.state == ConnectionState::Healthy {
                false
            } else {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.shared.successes_required {
                    inner.state = ConnectionState::Healthy;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    inner.state = ConnectionState::Degraded;
                    false
                }
            }
        };
        if recovered {
            info!(
                successes_required = self.shared.successes_required,
                "Primary store recovered; connection healthy"
            );
            self.trigger_sync();
        }
    }

    fn on_failure(&self, error: &StoreError) {
        let circuit_open = self.shared.breaker.state() == CircuitState::Open;
        let mut inner = self.shared.inner.lock();
        inner.consecutive_successes = 0;
        inner.last_error = Some(error.clone());
        inner.last_error_at = Some(Utc::now());
        inner.state = if circuit_open {
            ConnectionState::CircuitOpen
        } else if error.kind == ErrorKind::Unavailable {
            ConnectionState::Unavailable
        } else {
            ConnectionState::Degraded
        };
    }

    fn set_state(&self, state: ConnectionState) {
        let mut inner = self.shared.inner.lock();
        if inner.state != state {
            debug!(from = %inner.state, to = %state, "Connection state changed");
            inner.state = state;
            inner.consecutive_successes = 0;
        }
    }

    /// Best-known state of both tiers; never fails
    pub async fn status(&self) -> ConnectionStatus {
        let (fallback, fallback_error) = match self.shared.fallback.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let inner = self.shared.inner.lock().clone();

        ConnectionStatus {
            state: inner.state,
            primary_store: self.shared.store.as_ref().map(|s| s.name().to_string()),
            forced_fallback: inner.forced_fallback,
            consecutive_successes: inner.consecutive_successes,
            successes_required: self.shared.successes_required,
            primary_calls: self.shared.primary_calls.load(Ordering::Relaxed),
            fallback_calls: self.shared.fallback_calls.load(Ordering::Relaxed),
            last_error: inner.last_error.as_ref().map(ToString::to_string),
            last_error_kind: inner.last_error.as_ref().map(|e| e.kind),
            last_error_at: inner.last_error_at,
            last_success_at: inner.last_success_at,
            circuit: self.shared.breaker.metrics(),
            fallback,
            fallback_error,
            sync_running: self.is_sync_running(),
            last_sync: self.last_sync(),
            checked_at: Utc::now(),
        }
    }

    /// Route every operation to the fallback tier until disabled
    pub fn force_fallback(&self, enabled: bool) {
        let mut inner = self.shared.inner.lock();
        if inner.forced_fallback != enabled {
            warn!(enabled = enabled, "Forced fallback mode changed");
        }
        inner.forced_fallback = enabled;
    }

    pub fn is_fallback_forced(&self) -> bool {
        self.shared.inner.lock().forced_fallback
    }

    pub async fn export_fallback(&self) -> KurultaiResult<FallbackExport> {
        self.shared.fallback.export().await
    }

    pub async fn import_fallback(&self, export: &FallbackExport) -> KurultaiResult<ImportSummary> {
        self.shared.fallback.import(export).await
    }

    pub async fn stuck_sync_entries(
        &self,
        min_retry: Option<u32>,
    ) -> KurultaiResult<Vec<SyncQueueEntry>> {
        self.shared.fallback.stuck_entries(min_retry).await
    }

    pub async fn clear_stuck_sync_entries(&self, min_retry: Option<u32>) -> KurultaiResult<u64> {
        self.shared.fallback.clear_stuck_entries(min_retry).await
    }

    pub async fn retry_stuck_sync_entries(&self, min_retry: Option<u32>) -> KurultaiResult<u64> {
        self.shared.fallback.retry_stuck_entries(min_retry).await
    }

    /// Wait for an in-flight sync pass, then release both tiers
    pub async fn close(&self, timeout: Duration) {
        let task = self.shared.sync_task.lock().take();
        if let Some(mut handle) = task {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Sync pass still running at shutdown; aborting it"
                );
                handle.abort();
            }
        }
        if let Some(store) = &self.shared.store {
            store.shutdown().await;
        }
        self.shared.fallback.close().await;
        info!("Resilient connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackConfig;
    use crate::fallback::{FallbackTable, RecordSelector};
    use crate::store::{MemoryGraphStore, NodeLabel, Params};
    use serde_json::json;

    async fn connection(store: &MemoryGraphStore, threshold: u32) -> ResilientConnection {
        let fallback = FallbackStore::in_memory(&FallbackConfig::default())
            .await
            .unwrap();
        ResilientConnection::from_parts(
            Some(Arc::new(store.clone())),
            fallback,
            RetryPolicy::immediate(3),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_max_calls: 3,
                daily_cost_limit: None,
            },
            Duration::from_secs(1),
        )
    }

    fn payload(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_primary_write_returns_rows() {
        let store = MemoryGraphStore::new();
        let conn = connection(&store, 5).await;

        let outcome = conn
            .execute(Operation::upsert(
                FallbackTable::Tasks,
                "t-1",
                payload(json!({"status": "pending"})),
            ))
            .await
            .unwrap();

        assert!(outcome.is_primary());
        assert_eq!(store.node_count(NodeLabel::Task), 1);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = MemoryGraphStore::new();
        store.fail_next(2, ErrorKind::Transient);
        let conn = connection(&store, 5).await;

        let outcome = conn.execute(Operation::ping()).await.unwrap();

        assert!(outcome.is_primary());
        assert_eq!(store.session_attempts(), 3);
        assert_eq!(conn.breaker().metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_fast_and_queues_write() {
        let store = MemoryGraphStore::new();
        store.fail_next(1, ErrorKind::Fatal);
        let conn = connection(&store, 5).await;

        let outcome = conn
            .execute(Operation::upsert(
                FallbackTable::AgentMemories,
                "m-1",
                payload(json!({"content": "note"})),
            ))
            .await
            .unwrap();

        assert_eq!(store.session_attempts(), 1);
        assert!(matches!(
            outcome,
            ExecuteOutcome::Fallback(FallbackResult::Queued { .. })
        ));
        assert_eq!(conn.breaker().metrics().failure_count, 1);
        assert_eq!(conn.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_read_is_served_from_fallback_when_unavailable() {
        let store = MemoryGraphStore::new();
        store.set_unavailable(true);
        let conn = connection(&store, 5).await;

        conn.execute(Operation::upsert(
            FallbackTable::Tasks,
            "t-1",
            payload(json!({"tags": ["a", "b"]})),
        ))
        .await
        .unwrap();

        let outcome = conn
            .execute(Operation::read(
                "list_tasks",
                Statement::ListNodes {
                    label: NodeLabel::Task,
                    order_by: None,
                    descending: false,
                    limit: 10,
                },
                RecordSelector::table(FallbackTable::Tasks),
                10,
            ))
            .await
            .unwrap();

        match outcome {
            ExecuteOutcome::Fallback(FallbackResult::Records { records }) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].payload["tags"], json!(["a", "b"]));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Unavailable);
    }

    #[tokio::test]
    async fn test_no_store_means_fallback_mode() {
        let fallback = FallbackStore::in_memory(&FallbackConfig::default())
            .await
            .unwrap();
        let conn = ResilientConnection::new(None, fallback, &KurultaiConfig::default());

        let outcome = conn.execute(Operation::ping()).await.unwrap();
        assert!(outcome.is_fallback());
        assert_eq!(conn.probe().await, ConnectionState::Unavailable);
        assert!(conn.status().await.primary_store.is_none());
    }

    #[tokio::test]
    async fn test_degraded_needs_consecutive_successes() {
        let store = MemoryGraphStore::new();
        let conn = connection(&store, 5).await;
        assert_eq!(conn.probe().await, ConnectionState::Healthy);

        store.fail_next(1, ErrorKind::Fatal);
        conn.execute(Operation::ping()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Degraded);

        conn.execute(Operation::ping()).await.unwrap();
        conn.execute(Operation::ping()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Degraded);

        conn.execute(Operation::ping()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_from_degraded_counts_towards_recovery() {
        let store = MemoryGraphStore::new();
        let conn = connection(&store, 5).await;
        assert_eq!(conn.probe().await, ConnectionState::Healthy);

        store.fail_next(1, ErrorKind::Fatal);
        conn.execute(Operation::ping()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Degraded);

        assert_eq!(conn.probe().await, ConnectionState::Degraded);
        assert_eq!(conn.probe().await, ConnectionState::Degraded);
        assert_eq!(conn.probe().await, ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_probe_reconnects_an_unavailable_store_at_once() {
        let store = MemoryGraphStore::new();
        store.set_unavailable(true);
        let conn = connection(&store, 5).await;
        assert_eq!(conn.probe().await, ConnectionState::Unavailable);

        store.set_unavailable(false);
        assert_eq!(conn.probe().await, ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_forced_fallback_skips_primary() {
        let store = MemoryGraphStore::new();
        let conn = connection(&store, 5).await;
        conn.force_fallback(true);

        let outcome = conn.execute(Operation::ping()).await.unwrap();

        assert!(outcome.is_fallback());
        assert_eq!(store.session_attempts(), 0);
        assert!(conn.status().await.forced_fallback);
    }

    #[tokio::test]
    async fn test_status_reports_after_fallback_closed() {
        let store = MemoryGraphStore::new();
        let conn = connection(&store, 5).await;
        conn.fallback().close().await;

        let status = conn.status().await;
        assert!(status.fallback.is_none());
        assert!(status.fallback_error.is_some());
    }
}
