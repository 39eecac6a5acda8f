//! # Fallback Store
//!
//! Durable local storage for writes the primary store could not take.
//!
//! Every mirrored record is written in the same SQLite transaction as its
//! [`SyncQueueEntry`], so a record never exists unsynced without a queued
//! mutation. A later sync pass replays the queue in id order and deletes
//! entries only after the primary store accepted them.
//!
//! The pool hands each concurrent worker its own connection; WAL mode lets
//! readers proceed while a writer holds the database. Writes are serialized
//! in-process: SQLite cannot upgrade a stale WAL read snapshot to a write lock.

pub mod types;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FallbackConfig;
use crate::error::{KurultaiError, KurultaiResult};
use crate::store::Params;

pub use types::{
    FallbackExport, FallbackRecord, FallbackStats, FallbackTable, FallbackWrite, ImportSummary,
    RecordSelector, SyncOperation, SyncQueueEntry, TableStats,
};

const SCHEMA: &str = include_str!("../../migrations/0001_fallback_store.sql");

/// SQLite-backed fallback tier
#[derive(Debug, Clone)]
pub struct FallbackStore {
    pool: SqlitePool,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    path: Option<PathBuf>,
    max_sync_attempts: u32,
    sync_batch_size: u32,
}

impl FallbackStore {
    /// Open (creating if needed) the on-disk store named by the configuration
    pub async fn open(config: &FallbackConfig) -> KurultaiResult<Self> {
        let path = config.database_path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| KurultaiError::fallback("open", format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| KurultaiError::fallback("open", e))?;

        let store = Self {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            path: Some(path.to_path_buf()),
            max_sync_attempts: config.max_sync_attempts,
            sync_batch_size: config.sync_batch_size,
        };
        store.run_migrations().await?;

        info!(
            path = %path.display(),
            max_connections = config.max_connections,
            "Fallback store opened"
        );
        Ok(store)
    }

    /// Open an in-memory store (tests, ephemeral deployments)
    pub async fn in_memory(config: &FallbackConfig) -> KurultaiResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| KurultaiError::fallback("open", e))?;

        let store = Self {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            path: None,
            max_sync_attempts: config.max_sync_attempts,
            sync_batch_size: config.sync_batch_size,
        };
        store.run_migrations().await?;
        debug!("In-memory fallback store opened");
        Ok(store)
    }

    async fn run_migrations(&self) -> KurultaiResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("migrate", e))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn max_sync_attempts(&self) -> u32 {
        self.max_sync_attempts
    }

    pub fn sync_batch_size(&self) -> u32 {
        self.sync_batch_size
    }

    /// Store a record and queue it for replay.
    ///
    /// The id is taken from `payload["id"]` when present, otherwise generated.
    /// Returns `true` when a new record was created and `false` when an existing
    /// one was updated.
    pub async fn add_record(&self, table: FallbackTable, mut payload: Params) -> KurultaiResult<bool> {
        let record_id = match payload.get("id") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id.clone(),
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => {
                let id = Uuid::new_v4().to_string();
                payload.insert("id".to_string(), serde_json::Value::String(id.clone()));
                id
            }
        };

        let entry = self
            .queue_write(FallbackWrite::upsert(table, record_id, payload))
            .await?;
        Ok(entry.operation == SyncOperation::Create)
    }

    /// Apply a write locally and append its sync-queue entry, atomically
    pub async fn queue_write(&self, write: FallbackWrite) -> KurultaiResult<SyncQueueEntry> {
        let table = write.table;
        let _write = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KurultaiError::fallback("queue_write", e))?;

        let existing: Option<String> =
            sqlx::query_scalar(&format!("SELECT payload FROM {table} WHERE id = ?"))
                .bind(&write.record_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| KurultaiError::fallback("queue_write", e))?;

        let operation = match (write.operation, existing.is_some()) {
            (SyncOperation::Delete, _) => SyncOperation::Delete,
            (_, true) => SyncOperation::Update,
            (_, false) => SyncOperation::Create,
        };

        match existing {
            Some(stored) => {
                let mut merged = parse_payload(&stored)?;
                if operation != SyncOperation::Delete {
                    table.merge(&mut merged, &write.payload);
                }
                sqlx::query(&format!(
                    "UPDATE {table} SET payload = ?, updated_at = ?, synced_to_primary = 0, deleted = ? WHERE id = ?"
                ))
                .bind(serde_json::to_string(&merged)?)
                .bind(now)
                .bind(operation == SyncOperation::Delete)
                .bind(&write.record_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| KurultaiError::fallback("queue_write", e))?;
            }
            None => {
                let mut payload = write.payload.clone();
                payload
                    .entry("id".to_string())
                    .or_insert_with(|| serde_json::Value::String(write.record_id.clone()));
                sqlx::query(&format!(
                    "INSERT INTO {table} (id, payload, created_at, updated_at, synced_to_primary, sync_attempts, deleted) \
                     VALUES (?, ?, ?, ?, 0, 0, ?)"
                ))
                .bind(&write.record_id)
                .bind(serde_json::to_string(&payload)?)
                .bind(now)
                .bind(now)
                .bind(operation == SyncOperation::Delete)
                .execute(&mut *tx)
                .await
                .map_err(|e| KurultaiError::fallback("queue_write", e))?;
            }
        }

        let queue_id = sqlx::query(
            "INSERT INTO sync_queue (table_name, record_id, operation, created_at, retry_count) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(table.as_str())
        .bind(&write.record_id)
        .bind(operation.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| KurultaiError::fallback("queue_write", e))?
        .last_insert_rowid();

        tx.commit()
            .await
            .map_err(|e| KurultaiError::fallback("queue_write", e))?;

        debug!(
            table = %table,
            record_id = %write.record_id,
            operation = %operation,
            queue_id = queue_id,
            "Fallback write queued"
        );

        Ok(SyncQueueEntry {
            id: queue_id,
            table,
            record_id: write.record_id,
            operation,
            created_at: now,
            retry_count: 0,
            last_error: None,
        })
    }

    pub async fn get_record(
        &self,
        table: FallbackTable,
        record_id: &str,
    ) -> KurultaiResult<Option<FallbackRecord>> {
        let row = sqlx::query(&format!(
            "SELECT id, payload, created_at, updated_at, synced_to_primary, sync_attempts, deleted \
             FROM {table} WHERE id = ?"
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| KurultaiError::fallback("get_record", e))?;

        row.map(|row| record_from_row(table, &row)).transpose()
    }

    /// Records matching `selector`, most recently updated first
    pub async fn get_records(
        &self,
        selector: &RecordSelector,
        limit: u32,
    ) -> KurultaiResult<Vec<FallbackRecord>> {
        let table = selector.table;
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT id, payload, created_at, updated_at, synced_to_primary, sync_attempts, deleted \
             FROM {table} WHERE 1 = 1"
        ));
        if let Some(record_id) = &selector.record_id {
            query.push(" AND id = ").push_bind(record_id.clone());
        }
        if selector.unsynced_only {
            query.push(" AND synced_to_primary = 0");
        }
        if !selector.include_deleted {
            query.push(" AND deleted = 0");
        }
        query
            .push(" ORDER BY updated_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("get_records", e))?;

        rows.iter().map(|row| record_from_row(table, row)).collect()
    }

    /// Queue entries eligible for replay, oldest first
    pub async fn get_pending_sync(&self, limit: u32) -> KurultaiResult<Vec<SyncQueueEntry>> {
        self.get_pending_sync_after(0, limit).await
    }

    /// Eligible entries with an id greater than `after_id`, oldest first
    pub async fn get_pending_sync_after(
        &self,
        after_id: i64,
        limit: u32,
    ) -> KurultaiResult<Vec<SyncQueueEntry>> {
        let rows = sqlx::query(
            "SELECT id, table_name, record_id, operation, created_at, retry_count, last_error \
             FROM sync_queue WHERE id > ? AND retry_count < ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(i64::from(self.max_sync_attempts))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KurultaiError::fallback("get_pending_sync", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Mark a record replayed and drop all of its queue entries. Idempotent.
    pub async fn mark_synced(&self, table: FallbackTable, record_id: &str) -> KurultaiResult<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KurultaiError::fallback("mark_synced", e))?;

        sqlx::query("DELETE FROM sync_queue WHERE table_name = ? AND record_id = ?")
            .bind(table.as_str())
            .bind(record_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| KurultaiError::fallback("mark_synced", e))?;

        settle_record(&mut tx, table, record_id).await?;

        tx.commit()
            .await
            .map_err(|e| KurultaiError::fallback("mark_synced", e))?;
        Ok(())
    }

    /// Drop `entry` and every older entry of the same record.
    ///
    /// The record is only marked synced once no newer entry remains, so a write
    /// that raced the replay stays queued. Idempotent.
    pub async fn mark_entry_synced(&self, entry: &SyncQueueEntry) -> KurultaiResult<bool> {
        let _write = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KurultaiError::fallback("mark_entry_synced", e))?;

        sqlx::query("DELETE FROM sync_queue WHERE table_name = ? AND record_id = ? AND id <= ?")
            .bind(entry.table.as_str())
            .bind(&entry.record_id)
            .bind(entry.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| KurultaiError::fallback("mark_entry_synced", e))?;

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_queue WHERE table_name = ? AND record_id = ?",
        )
        .bind(entry.table.as_str())
        .bind(&entry.record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| KurultaiError::fallback("mark_entry_synced", e))?;

        let settled = remaining == 0;
        if settled {
            settle_record(&mut tx, entry.table, &entry.record_id).await?;
        }

        tx.commit()
            .await
            .map_err(|e| KurultaiError::fallback("mark_entry_synced", e))?;
        Ok(settled)
    }

    /// Count a failed replay; returns the entry's new retry count
    pub async fn record_sync_failure(
        &self,
        entry: &SyncQueueEntry,
        error: &str,
    ) -> KurultaiResult<u32> {
        let _write = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KurultaiError::fallback("record_sync_failure", e))?;

        sqlx::query(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(entry.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| KurultaiError::fallback("record_sync_failure", e))?;

        sqlx::query(&format!(
            "UPDATE {} SET sync_attempts = sync_attempts + 1 WHERE id = ?",
            entry.table
        ))
        .bind(&entry.record_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| KurultaiError::fallback("record_sync_failure", e))?;

        tx.commit()
            .await
            .map_err(|e| KurultaiError::fallback("record_sync_failure", e))?;

        let retry_count = entry.retry_count.saturating_add(1);
        if retry_count >= self.max_sync_attempts {
            warn!(
                queue_id = entry.id,
                table = %entry.table,
                record_id = %entry.record_id,
                retry_count = retry_count,
                error = error,
                "Sync entry reached the attempt limit and is excluded from automatic replay"
            );
        }
        Ok(retry_count)
    }

    pub async fn stats(&self) -> KurultaiResult<FallbackStats> {
        let mut stats = FallbackStats::default();

        for table in FallbackTable::ALL {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*) AS total, \
                 COALESCE(SUM(CASE WHEN synced_to_primary = 0 THEN 1 ELSE 0 END), 0) AS unsynced \
                 FROM {table}"
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("stats", e))?;

            let table_stats = TableStats {
                total: count_column(&row, "total")?,
                unsynced: count_column(&row, "unsynced")?,
            };
            stats.total += table_stats.total;
            stats.unsynced += table_stats.unsynced;
            stats.by_table.insert(table.as_str().to_string(), table_stats);
        }

        let row = sqlx::query(
            "SELECT COALESCE(SUM(CASE WHEN retry_count < ? THEN 1 ELSE 0 END), 0) AS pending, \
             COALESCE(SUM(CASE WHEN retry_count >= ? THEN 1 ELSE 0 END), 0) AS stuck \
             FROM sync_queue",
        )
        .bind(i64::from(self.max_sync_attempts))
        .bind(i64::from(self.max_sync_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| KurultaiError::fallback("stats", e))?;

        stats.pending_sync_count = count_column(&row, "pending")?;
        stats.stuck_count = count_column(&row, "stuck")?;
        Ok(stats)
    }

    /// Entries at or above `min_retry` attempts (default: the replay limit)
    pub async fn stuck_entries(&self, min_retry: Option<u32>) -> KurultaiResult<Vec<SyncQueueEntry>> {
        let threshold = min_retry.unwrap_or(self.max_sync_attempts);
        let rows = sqlx::query(
            "SELECT id, table_name, record_id, operation, created_at, retry_count, last_error \
             FROM sync_queue WHERE retry_count >= ? ORDER BY id ASC",
        )
        .bind(i64::from(threshold))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KurultaiError::fallback("stuck_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Delete entries at or above `min_retry` attempts; their records stay readable locally
    pub async fn clear_stuck_entries(&self, min_retry: Option<u32>) -> KurultaiResult<u64> {
        let _write = self.write_lock.lock().await;
        let threshold = min_retry.unwrap_or(self.max_sync_attempts);
        let cleared = sqlx::query("DELETE FROM sync_queue WHERE retry_count >= ?")
            .bind(i64::from(threshold))
            .execute(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("clear_stuck_entries", e))?
            .rows_affected();

        warn!(
            cleared = cleared,
            min_retry = threshold,
            "Cleared stuck sync queue entries"
        );
        Ok(cleared)
    }

    /// Put entries at or above `min_retry` attempts back into automatic replay
    pub async fn retry_stuck_entries(&self, min_retry: Option<u32>) -> KurultaiResult<u64> {
        let _write = self.write_lock.lock().await;
        let threshold = min_retry.unwrap_or(self.max_sync_attempts);
        let requeued = sqlx::query("UPDATE sync_queue SET retry_count = 0 WHERE retry_count >= ?")
            .bind(i64::from(threshold))
            .execute(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("retry_stuck_entries", e))?
            .rows_affected();

        info!(requeued = requeued, min_retry = threshold, "Requeued stuck sync entries");
        Ok(requeued)
    }

    pub async fn export(&self) -> KurultaiResult<FallbackExport> {
        let mut records = Vec::new();
        for table in FallbackTable::ALL {
            let rows = sqlx::query(&format!(
                "SELECT id, payload, created_at, updated_at, synced_to_primary, sync_attempts, deleted \
                 FROM {table} ORDER BY created_at ASC, rowid ASC"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KurultaiError::fallback("export", e))?;
            for row in &rows {
                records.push(record_from_row(table, row)?);
            }
        }

        let rows = sqlx::query(
            "SELECT id, table_name, record_id, operation, created_at, retry_count, last_error \
             FROM sync_queue ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KurultaiError::fallback("export", e))?;
        let sync_queue = rows.iter().map(entry_from_row).collect::<KurultaiResult<Vec<_>>>()?;

        Ok(FallbackExport {
            version: FallbackExport::VERSION,
            exported_at: Utc::now(),
            records,
            sync_queue,
        })
    }

    /// Load an export. Records replace local copies by id; queue entries are
    /// appended in their original order unless an identical entry exists.
    pub async fn import(&self, export: &FallbackExport) -> KurultaiResult<ImportSummary> {
        let _write = self.write_lock.lock().await;
        if export.version != FallbackExport::VERSION {
            return Err(KurultaiError::InvalidInput(format!(
                "unsupported fallback export version {}",
                export.version
            )));
        }

        let mut summary = ImportSummary::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KurultaiError::fallback("import", e))?;

        for record in &export.records {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO {} (id, payload, created_at, updated_at, synced_to_primary, sync_attempts, deleted) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                record.table
            ))
            .bind(&record.id)
            .bind(serde_json::to_string(&record.payload)?)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.synced_to_primary)
            .bind(i64::from(record.sync_attempts))
            .bind(record.deleted)
            .execute(&mut *tx)
            .await
            .map_err(|e| KurultaiError::fallback("import", e))?;
            summary.records += 1;
        }

        let mut entries: Vec<&SyncQueueEntry> = export.sync_queue.iter().collect();
        entries.sort_by_key(|entry| entry.id);
        for entry in entries {
            let duplicate: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sync_queue \
                 WHERE table_name = ? AND record_id = ? AND operation = ? AND created_at = ?",
            )
            .bind(entry.table.as_str())
            .bind(&entry.record_id)
            .bind(entry.operation.as_str())
            .bind(entry.created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| KurultaiError::fallback("import", e))?;

            if duplicate > 0 {
                summary.skipped_queue_entries += 1;
                continue;
            }

            sqlx::query(
                "INSERT INTO sync_queue (table_name, record_id, operation, created_at, retry_count, last_error) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.table.as_str())
            .bind(&entry.record_id)
            .bind(entry.operation.as_str())
            .bind(entry.created_at)
            .bind(i64::from(entry.retry_count))
            .bind(&entry.last_error)
            .execute(&mut *tx)
            .await
            .map_err(|e| KurultaiError::fallback("import", e))?;
            summary.queue_entries += 1;
        }

        tx.commit()
            .await
            .map_err(|e| KurultaiError::fallback("import", e))?;

        info!(
            records = summary.records,
            queue_entries = summary.queue_entries,
            skipped = summary.skipped_queue_entries,
            "Fallback data imported"
        );
        Ok(summary)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Fallback store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Mark a replayed record synced; a replayed delete removes the tombstone
async fn settle_record(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    table: FallbackTable,
    record_id: &str,
) -> KurultaiResult<()> {
    sqlx::query(&format!("DELETE FROM {table} WHERE id = ? AND deleted = 1"))
        .bind(record_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| KurultaiError::fallback("mark_synced", e))?;

    sqlx::query(&format!(
        "UPDATE {table} SET synced_to_primary = 1 WHERE id = ?"
    ))
    .bind(record_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| KurultaiError::fallback("mark_synced", e))?;
    Ok(())
}

fn parse_payload(raw: &str) -> KurultaiResult<Params> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(KurultaiError::fallback(
            "decode",
            format!("payload is not a JSON object: {other}"),
        )),
    }
}

fn count_column(row: &SqliteRow, column: &str) -> KurultaiResult<u64> {
    let value: i64 = row
        .try_get(column)
        .map_err(|e| KurultaiError::fallback("decode", e))?;
    Ok(u64::try_from(value).unwrap_or_default())
}

fn record_from_row(table: FallbackTable, row: &SqliteRow) -> KurultaiResult<FallbackRecord> {
    let decode = |e: sqlx::Error| KurultaiError::fallback("decode", e);
    let payload: String = row.try_get("payload").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;
    let sync_attempts: i64 = row.try_get("sync_attempts").map_err(decode)?;

    Ok(FallbackRecord {
        id: row.try_get("id").map_err(decode)?,
        table,
        payload: parse_payload(&payload)?,
        created_at,
        updated_at,
        synced_to_primary: row.try_get("synced_to_primary").map_err(decode)?,
        sync_attempts: u32::try_from(sync_attempts).unwrap_or(u32::MAX),
        deleted: row.try_get("deleted").map_err(decode)?,
    })
}

fn entry_from_row(row: &SqliteRow) -> KurultaiResult<SyncQueueEntry> {
    let decode = |e: sqlx::Error| KurultaiError::fallback("decode", e);
    let table: String = row.try_get("table_name").map_err(decode)?;
    let operation: String = row.try_get("operation").map_err(decode)?;
    let retry_count: i64 = row.try_get("retry_count").map_err(decode)?;

    Ok(SyncQueueEntry {
        id: row.try_get("id").map_err(decode)?,
        table: table.parse()?,
        record_id: row.try_get("record_id").map_err(decode)?,
        operation: operation.parse()?,
        created_at: row.try_get("created_at").map_err(decode)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> FallbackConfig {
        FallbackConfig::default()
    }

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_reads_are_empty() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        assert!(store.get_pending_sync(10).await.unwrap().is_empty());
        assert!(store
            .get_records(&RecordSelector::table(FallbackTable::Tasks), 10)
            .await
            .unwrap()
            .is_empty());
        assert!(store.stuck_entries(None).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending_sync_count, 0);
        assert_eq!(stats.by_table.len(), FallbackTable::ALL.len());
    }

    #[tokio::test]
    async fn test_add_record_round_trips_nested_payload() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        let payload = params(json!({
            "id": "mem-1",
            "agent": "researcher",
            "tags": ["outage", "neo4j"],
            "context": {"source": "chat", "scores": [1, 2.5, null]}
        }));

        assert!(store
            .add_record(FallbackTable::AgentMemories, payload.clone())
            .await
            .unwrap());

        let records = store
            .get_records(&RecordSelector::table(FallbackTable::AgentMemories), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, payload);
        assert!(!records[0].synced_to_primary);

        let pending = store.get_pending_sync(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, SyncOperation::Create);
        assert_eq!(pending[0].record_id, "mem-1");
    }

    #[tokio::test]
    async fn test_add_record_generates_missing_id() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        store
            .add_record(FallbackTable::Tasks, params(json!({"title": "audit"})))
            .await
            .unwrap();

        let records = store
            .get_records(&RecordSelector::table(FallbackTable::Tasks), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["id"], json!(records[0].id));
    }

    #[tokio::test]
    async fn test_second_write_is_update_and_preserves_order() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        store
            .queue_write(FallbackWrite::upsert(
                FallbackTable::Tasks,
                "t-1",
                params(json!({"status": "pending"})),
            ))
            .await
            .unwrap();
        let created = store
            .add_record(FallbackTable::Tasks, params(json!({"id": "t-1", "status": "done"})))
            .await
            .unwrap();
        assert!(!created);

        let pending = store.get_pending_sync(10).await.unwrap();
        let operations: Vec<_> = pending.iter().map(|e| e.operation).collect();
        assert_eq!(operations, vec![SyncOperation::Create, SyncOperation::Update]);
        assert!(pending[0].id < pending[1].id);

        let record = store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert_eq!(record.payload["status"], "done");
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        store
            .add_record(FallbackTable::Tasks, params(json!({"id": "t-1"})))
            .await
            .unwrap();

        store.mark_synced(FallbackTable::Tasks, "t-1").await.unwrap();
        store.mark_synced(FallbackTable::Tasks, "t-1").await.unwrap();
        store.mark_synced(FallbackTable::Tasks, "missing").await.unwrap();

        let record = store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert!(record.synced_to_primary);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending_sync_count, 0);
        assert_eq!(stats.unsynced, 0);
    }

    #[tokio::test]
    async fn test_mark_entry_synced_keeps_newer_writes_queued() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        let first = store
            .queue_write(FallbackWrite::upsert(
                FallbackTable::Tasks,
                "t-1",
                params(json!({"status": "pending"})),
            ))
            .await
            .unwrap();
        store
            .queue_write(FallbackWrite::upsert(
                FallbackTable::Tasks,
                "t-1",
                params(json!({"status": "done"})),
            ))
            .await
            .unwrap();

        assert!(!store.mark_entry_synced(&first).await.unwrap());
        assert!(!store.mark_entry_synced(&first).await.unwrap());
        let pending = store.get_pending_sync(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, SyncOperation::Update);

        let record = store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert!(!record.synced_to_primary);

        assert!(store.mark_entry_synced(&pending[0]).await.unwrap());
        let record = store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert!(record.synced_to_primary);
    }

    #[tokio::test]
    async fn test_stuck_entries_are_excluded_and_clearable() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        let entry = store
            .queue_write(FallbackWrite::upsert(
                FallbackTable::Tasks,
                "t-1",
                params(json!({"status": "pending"})),
            ))
            .await
            .unwrap();

        let mut current = entry.clone();
        for attempt in 1..=5 {
            let retry_count = store.record_sync_failure(&current, "boom").await.unwrap();
            assert_eq!(retry_count, attempt);
            current.retry_count = retry_count;
        }

        assert!(store.get_pending_sync(10).await.unwrap().is_empty());
        let stuck = store.stuck_entries(None).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].last_error.as_deref(), Some("boom"));
        let record = store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert_eq!(record.sync_attempts, 5);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.stuck_count, 1);
        assert_eq!(stats.pending_sync_count, 0);

        assert_eq!(store.retry_stuck_entries(None).await.unwrap(), 1);
        assert_eq!(store.get_pending_sync(10).await.unwrap().len(), 1);

        for _ in 0..5 {
            let pending = store.get_pending_sync(10).await.unwrap();
            store.record_sync_failure(&pending[0], "boom").await.unwrap();
        }
        assert_eq!(store.clear_stuck_entries(Some(3)).await.unwrap(), 1);
        assert!(store.stuck_entries(Some(0)).await.unwrap().is_empty());
        assert!(store.get_record(FallbackTable::Tasks, "t-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_is_a_tombstone_until_synced() {
        let store = FallbackStore::in_memory(&config()).await.unwrap();
        store
            .add_record(FallbackTable::Notifications, params(json!({"id": "n-1"})))
            .await
            .unwrap();
        store
            .queue_write(FallbackWrite::delete(FallbackTable::Notifications, "n-1"))
            .await
            .unwrap();

        let visible = store
            .get_records(&RecordSelector::table(FallbackTable::Notifications), 10)
            .await
            .unwrap();
        assert!(visible.is_empty());
        let all = store
            .get_records(
                &RecordSelector::table(FallbackTable::Notifications).including_deleted(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted);

        store.mark_synced(FallbackTable::Notifications, "n-1").await.unwrap();
        assert!(store
            .get_record(FallbackTable::Notifications, "n-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_export_import_into_fresh_store() {
        let source = FallbackStore::in_memory(&config()).await.unwrap();
        source
            .add_record(FallbackTable::Tasks, params(json!({"id": "t-1", "n": 1})))
            .await
            .unwrap();
        source
            .add_record(FallbackTable::AgentState, params(json!({"id": "main", "last_heartbeat": 10})))
            .await
            .unwrap();

        let export = source.export().await.unwrap();
        assert_eq!(export.records.len(), 2);
        assert_eq!(export.sync_queue.len(), 2);

        let encoded = serde_json::to_string(&export).unwrap();
        let decoded: FallbackExport = serde_json::from_str(&encoded).unwrap();

        let target = FallbackStore::in_memory(&config()).await.unwrap();
        let summary = target.import(&decoded).await.unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.queue_entries, 2);

        let again = target.import(&decoded).await.unwrap();
        assert_eq!(again.queue_entries, 0);
        assert_eq!(again.skipped_queue_entries, 2);

        let record = target.get_record(FallbackTable::Tasks, "t-1").await.unwrap().unwrap();
        assert_eq!(record.payload["n"], 1);
        assert_eq!(target.get_pending_sync(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = FallbackConfig {
            database_path: dir.path().join("nested").join("fallback.db"),
            ..FallbackConfig::default()
        };

        let store = FallbackStore::open(&config).await.unwrap();
        store
            .add_record(FallbackTable::Tasks, params(json!({"id": "t-1"})))
            .await
            .unwrap();
        store.close().await;
        assert!(store.is_closed());

        let reopened = FallbackStore::open(&config).await.unwrap();
        assert_eq!(reopened.get_pending_sync(10).await.unwrap().len(), 1);
        reopened.close().await;
    }
}
