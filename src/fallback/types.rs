//! Records, queue entries and selectors of the fallback store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::KurultaiError;
use crate::store::{NodeLabel, Params};

/// Mirrored tables of the fallback store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTable {
    AgentMemories,
    Tasks,
    AgentState,
    Notifications,
    FailoverEvents,
}

impl FallbackTable {
    pub const ALL: [FallbackTable; 5] = [
        FallbackTable::AgentMemories,
        FallbackTable::Tasks,
        FallbackTable::AgentState,
        FallbackTable::Notifications,
        FallbackTable::FailoverEvents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FallbackTable::AgentMemories => "agent_memories",
            FallbackTable::Tasks => "tasks",
            FallbackTable::AgentState => "agent_state",
            FallbackTable::Notifications => "notifications",
            FallbackTable::FailoverEvents => "failover_events",
        }
    }

    /// Primary-store label that records of this table replay onto
    pub fn label(self) -> NodeLabel {
        match self {
            FallbackTable::AgentMemories => NodeLabel::AgentMemory,
            FallbackTable::Tasks => NodeLabel::Task,
            FallbackTable::AgentState => NodeLabel::Agent,
            FallbackTable::Notifications => NodeLabel::Notification,
            FallbackTable::FailoverEvents => NodeLabel::FailoverEvent,
        }
    }

    /// Merge an incoming payload into the stored one.
    ///
    /// Later writes win per key, except counters that only ever move forward:
    /// an agent's `last_heartbeat` and a failover event's `messages_routed`.
    pub fn merge(self, existing: &mut Params, incoming: &Params) {
        for (key, value) in incoming {
            if self.monotonic_key() == Some(key.as_str()) {
                let current = existing.get(key).and_then(Value::as_i64);
                let candidate = value.as_i64();
                if let (Some(current), Some(candidate)) = (current, candidate) {
                    if candidate < current {
                        continue;
                    }
                }
            }
            existing.insert(key.clone(), value.clone());
        }
    }

    /// Property of this table that never decreases
    pub fn monotonic_key(self) -> Option<&'static str> {
        match self {
            FallbackTable::AgentState => Some("last_heartbeat"),
            FallbackTable::FailoverEvents => Some("messages_routed"),
            _ => None,
        }
    }
}

impl std::fmt::Display for FallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackTable {
    type Err = KurultaiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FallbackTable::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| KurultaiError::InvalidInput(format!("unknown fallback table '{s}'")))
    }
}

/// Mutation recorded in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = KurultaiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(KurultaiError::InvalidInput(format!(
                "unknown sync operation '{other}'"
            ))),
        }
    }
}

/// A record mirrored locally because the primary store could not take it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub id: String,
    pub table: FallbackTable,
    pub payload: Params,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_to_primary: bool,
    pub sync_attempts: u32,
    /// Tombstone for a queued delete
    pub deleted: bool,
}

/// One pending mutation in the append-only sync ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub table: FallbackTable,
    pub record_id: String,
    pub operation: SyncOperation,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// A write to apply locally and queue for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackWrite {
    pub table: FallbackTable,
    pub record_id: String,
    pub payload: Params,
    pub operation: SyncOperation,
}

impl FallbackWrite {
    /// Create-or-update; the store picks `Create` or `Update` by local presence
    pub fn upsert(table: FallbackTable, record_id: impl Into<String>, payload: Params) -> Self {
        Self {
            table,
            record_id: record_id.into(),
            payload,
            operation: SyncOperation::Update,
        }
    }

    pub fn delete(table: FallbackTable, record_id: impl Into<String>) -> Self {
        Self {
            table,
            record_id: record_id.into(),
            payload: Params::new(),
            operation: SyncOperation::Delete,
        }
    }
}

/// Which records [`get_records`](super::FallbackStore::get_records) returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSelector {
    pub table: FallbackTable,
    pub record_id: Option<String>,
    pub unsynced_only: bool,
    pub include_deleted: bool,
}

impl RecordSelector {
    pub fn table(table: FallbackTable) -> Self {
        Self {
            table,
            record_id: None,
            unsynced_only: false,
            include_deleted: false,
        }
    }

    pub fn with_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn unsynced(mut self) -> Self {
        self.unsynced_only = true;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub total: u64,
    pub unsynced: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub total: u64,
    pub unsynced: u64,
    /// Queue entries still eligible for automatic replay
    pub pending_sync_count: u64,
    /// Queue entries at or above the attempt limit
    pub stuck_count: u64,
    pub by_table: BTreeMap<String, TableStats>,
}

/// Portable dump of the fallback store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub records: Vec<FallbackRecord>,
    pub sync_queue: Vec<SyncQueueEntry>,
}

impl FallbackExport {
    pub const VERSION: u32 = 1;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub records: u64,
    pub queue_entries: u64,
    pub skipped_queue_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_heartbeat_merge_keeps_maximum() {
        let mut existing = params(json!({"id": "main", "last_heartbeat": 500, "status": "up"}));
        FallbackTable::AgentState.merge(
            &mut existing,
            &params(json!({"last_heartbeat": 300, "status": "busy"})),
        );
        assert_eq!(existing["last_heartbeat"], 500);
        assert_eq!(existing["status"], "busy");

        FallbackTable::AgentState.merge(&mut existing, &params(json!({"last_heartbeat": 900})));
        assert_eq!(existing["last_heartbeat"], 900);
    }

    #[test]
    fn test_routed_count_merge_keeps_maximum() {
        let mut existing = params(json!({"is_active": true, "messages_routed": 4}));
        FallbackTable::FailoverEvents.merge(
            &mut existing,
            &params(json!({"is_active": false, "messages_routed": 3})),
        );
        assert_eq!(existing["messages_routed"], 4);
        assert_eq!(existing["is_active"], false);
    }

    #[test]
    fn test_other_tables_overwrite() {
        let mut existing = params(json!({"last_heartbeat": 500}));
        FallbackTable::Tasks.merge(&mut existing, &params(json!({"last_heartbeat": 1})));
        assert_eq!(existing["last_heartbeat"], 1);
    }

    #[test]
    fn test_table_round_trips_through_str() {
        for table in FallbackTable::ALL {
            assert_eq!(table.as_str().parse::<FallbackTable>().unwrap(), table);
        }
        assert!("users".parse::<FallbackTable>().is_err());
        assert_eq!(FallbackTable::AgentState.label(), NodeLabel::Agent);
    }
}
