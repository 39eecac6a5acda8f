//! Replay of queued fallback writes into the primary store.
//!
//! A pass walks `sync_queue` in id order. Each entry replays the record's
//! *current* local payload with upsert-by-id semantics, so replaying an entry
//! twice (crash between the primary write and the local bookkeeping) leaves the
//! primary store unchanged. Once an entry for a record fails, later entries of
//! the same record are skipped for the rest of the pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{ConnectionShared, ResilientConnection};
use crate::error::{ErrorKind, KurultaiResult};
use crate::fallback::{FallbackRecord, FallbackTable, SyncOperation, SyncQueueEntry};
use crate::logging::log_error;
use crate::store::Statement;

/// Outcome of one sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Entries replayed against the primary store
    pub attempted: u64,
    pub synced: u64,
    pub failed: u64,
    /// Entries not attempted because an earlier entry of the same record failed
    pub skipped: u64,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    fn started() -> Self {
        Self {
            attempted: 0,
            synced: 0,
            failed: 0,
            skipped: 0,
            aborted: false,
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn abort(&mut self, reason: impl Into<String>) {
        self.aborted = true;
        self.abort_reason = Some(reason.into());
    }

    pub fn is_clean(&self) -> bool {
        !self.aborted && self.failed == 0 && self.skipped == 0
    }
}

/// Clears the single-pass flag when the pass ends, however it ends
struct SyncGuard {
    shared: Arc<ConnectionShared>,
}

impl SyncGuard {
    fn acquire(shared: &Arc<ConnectionShared>) -> Option<Self> {
        shared
            .sync_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                shared: Arc::clone(shared),
            })
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.shared.sync_running.store(false, Ordering::Release);
    }
}

impl ResilientConnection {
    /// Run a sync pass inline.
    ///
    /// Returns `Ok(None)` when another pass is already running. Replay failures
    /// are recorded on the queue entries; only fallback-tier errors surface here.
    pub async fn sync_pending(&self) -> KurultaiResult<Option<SyncReport>> {
        let Some(_guard) = SyncGuard::acquire(&self.shared) else {
            debug!("Sync pass already running; request ignored");
            return Ok(None);
        };
        self.run_sync_pass().await.map(Some)
    }

    /// Start a sync pass in the background. Returns `false` when one is already
    /// running or no runtime is available.
    pub fn trigger_sync(&self) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available; sync pass not started");
            return false;
        };
        let Some(guard) = SyncGuard::acquire(&self.shared) else {
            debug!("Sync pass already running; trigger ignored");
            return false;
        };

        let connection = self.clone();
        let task = handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = connection.run_sync_pass().await {
                log_error(
                    "resilient_connection",
                    "sync_pass",
                    &e.to_string(),
                    Some("background"),
                );
            }
        });
        *self.shared.sync_task.lock() = Some(task);
        true
    }

    pub fn is_sync_running(&self) -> bool {
        self.shared.sync_running.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<SyncReport> {
        self.shared.last_sync.lock().clone()
    }

    async fn run_sync_pass(&self) -> KurultaiResult<SyncReport> {
        let mut report = SyncReport::started();
        let result = self.replay_queue(&mut report).await;
        report.finished_at = Some(Utc::now());

        match &result {
            Ok(()) => info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                skipped = report.skipped,
                aborted = report.aborted,
                abort_reason = report.abort_reason.as_deref(),
                "Sync pass finished"
            ),
            Err(e) => {
                error!(error = %e, synced = report.synced, "Sync pass stopped on a fallback store error");
                report.abort(e.to_string());
            }
        }
        *self.shared.last_sync.lock() = Some(report.clone());
        result.map(|()| report)
    }

    async fn replay_queue(&self, report: &mut SyncReport) -> KurultaiResult<()> {
        let shared = &self.shared;
        let Some(store) = shared.store.clone() else {
            report.abort("primary store not configured");
            return Ok(());
        };
        let fallback = &shared.fallback;

        let stats = fallback.stats().await?;
        if stats.stuck_count > 0 {
            warn!(
                stuck_count = stats.stuck_count,
                max_sync_attempts = fallback.max_sync_attempts(),
                "Sync queue holds entries excluded from automatic replay; retry or clear them explicitly"
            );
        }
        if stats.pending_sync_count == 0 {
            return Ok(());
        }

        let batch_size = fallback.sync_batch_size().max(1);
        let mut cursor = 0_i64;
        let mut blocked: HashSet<(FallbackTable, String)> = HashSet::new();

        loop {
            let entries = fallback.get_pending_sync_after(cursor, batch_size).await?;
            if entries.is_empty() {
                return Ok(());
            }

            for entry in entries {
                cursor = entry.id;
                let key = (entry.table, entry.record_id.clone());
                if blocked.contains(&key) {
                    report.skipped += 1;
                    continue;
                }
                if let Err(rejection) = shared.breaker.check() {
                    report.abort(format!("replay refused: {rejection}"));
                    return Ok(());
                }

                report.attempted += 1;
                let record = fallback.get_record(entry.table, &entry.record_id).await?;
                let statements = replay_statements(&entry, record.as_ref());
                if statements.is_empty() {
                    debug!(queue_id = entry.id, record_id = %entry.record_id, "Queued record no longer exists locally");
                    fallback.mark_entry_synced(&entry).await?;
                    report.synced += 1;
                    continue;
                }

                match self.attempt_once(store.as_ref(), &statements).await {
                    Ok(_) => {
                        shared.breaker.record_success(0.0);
                        fallback.mark_entry_synced(&entry).await?;
                        report.synced += 1;
                    }
                    Err(e) => {
                        shared.breaker.record_failure();
                        self.on_failure(&e);
                        let retry_count = fallback.record_sync_failure(&entry, &e.to_string()).await?;
                        report.failed += 1;
                        blocked.insert(key);
                        warn!(
                            queue_id = entry.id,
                            table = %entry.table,
                            record_id = %entry.record_id,
                            operation = %entry.operation,
                            retry_count = retry_count,
                            error = %e,
                            "Sync replay failed"
                        );
                        if e.kind == ErrorKind::Unavailable {
                            report.abort(format!("primary store unavailable: {}", e.message));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Statements that bring the primary store in line with the local record
pub(crate) fn replay_statements(
    entry: &SyncQueueEntry,
    record: Option<&FallbackRecord>,
) -> Vec<Statement> {
    let label = entry.table.label();
    let delete = || Statement::DeleteNode {
        label,
        id: entry.record_id.clone(),
    };

    if entry.operation == SyncOperation::Delete {
        return vec![delete()];
    }
    let Some(record) = record else {
        return Vec::new();
    };
    if record.deleted {
        return vec![delete()];
    }

    let mut properties = record.payload.clone();
    let mut statements = Vec::with_capacity(2);
    match entry.table {
        FallbackTable::AgentState => {
            if let Some(at_millis) = properties
                .remove("last_heartbeat")
                .and_then(|value| value.as_i64())
            {
                statements.push(Statement::TouchHeartbeat {
                    agent_id: entry.record_id.clone(),
                    at_millis,
                });
            }
        }
        FallbackTable::FailoverEvents => {
            if let Some(count) = properties
                .remove("messages_routed")
                .and_then(|value| value.as_u64())
            {
                statements.push(Statement::RaiseRoutedCount {
                    event_id: entry.record_id.clone(),
                    count,
                });
            }
        }
        _ => {}
    }
    statements.push(Statement::upsert(label, entry.record_id.clone(), properties));
    statements
}
