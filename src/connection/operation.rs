//! Operations submitted to the resilient connection and their tagged outcomes.

use serde::{Deserialize, Serialize};

use crate::fallback::{FallbackRecord, FallbackTable, FallbackWrite, RecordSelector};
use crate::store::{Params, Row, Statement};

/// What to do locally when the primary store cannot serve an operation
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackAction {
    /// Apply the write locally and queue it for replay
    Queue(FallbackWrite),
    /// Serve the read from the mirrored tables
    Read { selector: RecordSelector, limit: u32 },
    /// Nothing to do locally (probes, raw queries)
    None,
}

/// One primary-store statement plus its fallback behavior
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Short name for logs
    pub name: String,
    pub statement: Statement,
    pub fallback: FallbackAction,
    /// Added to the breaker's daily cost on success
    pub cost: f64,
}

impl Operation {
    pub fn new(name: impl Into<String>, statement: Statement) -> Self {
        Self {
            name: name.into(),
            statement,
            fallback: FallbackAction::None,
            cost: 0.0,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackAction) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Upsert-by-id into the table's label, queued locally on failure
    pub fn upsert(table: FallbackTable, id: impl Into<String>, payload: Params) -> Self {
        let id = id.into();
        Self::new(
            format!("upsert_{table}"),
            Statement::upsert(table.label(), id.clone(), payload.clone()),
        )
        .with_fallback(FallbackAction::Queue(FallbackWrite::upsert(table, id, payload)))
    }

    pub fn delete(table: FallbackTable, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            format!("delete_{table}"),
            Statement::DeleteNode {
                label: table.label(),
                id: id.clone(),
            },
        )
        .with_fallback(FallbackAction::Queue(FallbackWrite::delete(table, id)))
    }

    /// Read served from the mirrored table when the primary store is out
    pub fn read(
        name: impl Into<String>,
        statement: Statement,
        selector: RecordSelector,
        limit: u32,
    ) -> Self {
        Self::new(name, statement).with_fallback(FallbackAction::Read { selector, limit })
    }

    pub fn ping() -> Self {
        Self::new("ping", Statement::Ping)
    }
}

/// Result of a locally served operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackResult {
    Queued {
        table: FallbackTable,
        record_id: String,
        queue_id: i64,
    },
    Records { records: Vec<FallbackRecord> },
    Skipped { reason: String },
}

/// Tagged result of [`ResilientConnection::execute`](super::ResilientConnection::execute)
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    /// Rows returned by the primary store
    Primary(Vec<Row>),
    /// The primary store was bypassed or failed; the fallback tier answered
    Fallback(FallbackResult),
}

impl ExecuteOutcome {
    pub fn is_primary(&self) -> bool {
        matches!(self, ExecuteOutcome::Primary(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ExecuteOutcome::Fallback(_))
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            ExecuteOutcome::Primary(rows) => Some(rows),
            ExecuteOutcome::Fallback(_) => None,
        }
    }

    pub fn fallback_result(&self) -> Option<&FallbackResult> {
        match self {
            ExecuteOutcome::Fallback(result) => Some(result),
            ExecuteOutcome::Primary(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::SyncOperation;
    use crate::store::NodeLabel;
    use serde_json::json;

    #[test]
    fn test_upsert_targets_table_label_and_queues() {
        let payload = json!({"status": "pending"}).as_object().cloned().unwrap();
        let operation = Operation::upsert(FallbackTable::Tasks, "t-1", payload.clone());

        assert_eq!(operation.name, "upsert_tasks");
        assert_eq!(
            operation.statement,
            Statement::upsert(NodeLabel::Task, "t-1", payload.clone())
        );
        match operation.fallback {
            FallbackAction::Queue(write) => {
                assert_eq!(write.table, FallbackTable::Tasks);
                assert_eq!(write.record_id, "t-1");
                assert_eq!(write.payload, payload);
            }
            other => panic!("unexpected fallback action: {other:?}"),
        }
    }

    #[test]
    fn test_delete_queues_tombstone() {
        let operation = Operation::delete(FallbackTable::Notifications, "n-1");
        match operation.fallback {
            FallbackAction::Queue(write) => assert_eq!(write.operation, SyncOperation::Delete),
            other => panic!("unexpected fallback action: {other:?}"),
        }
    }

    #[test]
    fn test_outcome_accessors() {
        let primary = ExecuteOutcome::Primary(Vec::new());
        assert!(primary.is_primary());
        assert!(primary.rows().is_some());

        let fallback = ExecuteOutcome::Fallback(FallbackResult::Skipped {
            reason: "circuit open".to_string(),
        });
        assert!(fallback.is_fallback());
        assert!(fallback.rows().is_none());
        assert!(fallback.fallback_result().is_some());
    }
}
