//! In-process graph store.
//!
//! Interprets the typed [`Statement`]s against a node map and supports fault
//! injection (outages, queued failures, latency), so the resilient connection
//! and failover protocol can be exercised without a running database.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use super::{GraphSession, GraphStore, NodeLabel, Row, Statement};
use crate::error::{ErrorKind, StoreError};

#[derive(Debug, Default)]
struct FaultPlan {
    unavailable: bool,
    fail_next: VecDeque<ErrorKind>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemoryGraphInner {
    nodes: Mutex<HashMap<(NodeLabel, String), Row>>,
    faults: Mutex<FaultPlan>,
    session_attempts: AtomicU64,
    statements_run: AtomicU64,
    open_sessions: AtomicI64,
}

/// Cloneable handle; clones share the same graph
#[derive(Debug, Default, Clone)]
pub struct MemoryGraphStore {
    inner: Arc<MemoryGraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new sessions and fail running statements with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    /// Fail the next `count` statements with `kind`
    pub fn fail_next(&self, count: usize, kind: ErrorKind) {
        let mut faults = self.inner.faults.lock();
        faults.fail_next.extend(std::iter::repeat(kind).take(count));
    }

    /// Delay every statement
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.faults.lock().latency = latency;
    }

    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = FaultPlan::default();
    }

    pub fn session_attempts(&self) -> u64 {
        self.inner.session_attempts.load(AtomicOrdering::SeqCst)
    }

    pub fn statements_run(&self) -> u64 {
        self.inner.statements_run.load(AtomicOrdering::SeqCst)
    }

    /// Sessions acquired and not yet closed
    pub fn open_sessions(&self) -> i64 {
        self.inner.open_sessions.load(AtomicOrdering::SeqCst)
    }

    pub fn node(&self, label: NodeLabel, id: &str) -> Option<Row> {
        self.inner
            .nodes
            .lock()
            .get(&(label, id.to_string()))
            .cloned()
    }

    pub fn nodes(&self, label: NodeLabel) -> Vec<Row> {
        self.inner
            .nodes
            .lock()
            .iter()
            .filter(|((node_label, _), _)| *node_label == label)
            .map(|(_, props)| props.clone())
            .collect()
    }

    pub fn node_count(&self, label: NodeLabel) -> usize {
        self.inner
            .nodes
            .lock()
            .keys()
            .filter(|(node_label, _)| *node_label == label)
            .count()
    }

    fn execute(&self, statement: &Statement) -> Vec<Row> {
        let mut nodes = self.inner.nodes.lock();
        match statement {
            Statement::Ping => vec![row([("ok", json!(1))])],
            Statement::UpsertNode {
                label,
                id,
                properties,
            } => {
                let node = nodes
                    .entry((*label, id.clone()))
                    .or_insert_with(|| row([("id", json!(id))]));
                for (key, value) in properties {
                    if key != "id" {
                        node.insert(key.clone(), value.clone());
                    }
                }
                vec![row([("id", json!(id))])]
            }
            Statement::DeleteNode { label, id } => {
                nodes.remove(&(*label, id.clone()));
                Vec::new()
            }
            Statement::TouchHeartbeat {
                agent_id,
                at_millis,
            } => {
                let node = nodes
                    .entry((NodeLabel::Agent, agent_id.clone()))
                    .or_insert_with(|| row([("id", json!(agent_id))]));
                let current = node.get("last_heartbeat").and_then(Value::as_i64);
                let latest = current.map_or(*at_millis, |current| current.max(*at_millis));
                node.insert("last_heartbeat".to_string(), json!(latest));
                vec![row([("last_heartbeat", json!(latest))])]
            }
            Statement::RaiseRoutedCount { event_id, count } => {
                let node = nodes
                    .entry((NodeLabel::FailoverEvent, event_id.clone()))
                    .or_insert_with(|| row([("id", json!(event_id))]));
                let current = node.get("messages_routed").and_then(Value::as_u64);
                let highest = current.map_or(*count, |current| current.max(*count));
                node.insert("messages_routed".to_string(), json!(highest));
                vec![row([("messages_routed", json!(highest))])]
            }
            Statement::ReadHeartbeat { agent_id } => nodes
                .get(&(NodeLabel::Agent, agent_id.clone()))
                .map(|node| {
                    vec![row([(
                        "last_heartbeat",
                        node.get("last_heartbeat").cloned().unwrap_or(Value::Null),
                    )])]
                })
                .unwrap_or_default(),
            Statement::ListNodes {
                label,
                order_by,
                descending,
                limit,
            } => {
                let mut matching: Vec<Row> = nodes
                    .iter()
                    .filter(|((node_label, _), _)| node_label == label)
                    .map(|(_, props)| props.clone())
                    .collect();
                if let Some(property) = order_by {
                    matching.sort_by(|a, b| {
                        let ordering = compare_values(a.get(property), b.get(property));
                        if *descending {
                            ordering.reverse()
                        } else {
                            ordering
                        }
                    });
                }
                matching
                    .into_iter()
                    .take(*limit as usize)
                    .map(|props| row([("node", Value::Object(props))]))
                    .collect()
            }
            Statement::Cypher { .. } => Vec::new(),
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn session(&self) -> Result<Box<dyn GraphSession>, StoreError> {
        self.inner
            .session_attempts
            .fetch_add(1, AtomicOrdering::SeqCst);
        if self.inner.faults.lock().unavailable {
            return Err(StoreError::unavailable("connection refused"));
        }
        self.inner.open_sessions.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemorySession {
            store: self.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemorySession {
    store: MemoryGraphStore,
    closed: bool,
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn run(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        if self.closed {
            return Err(StoreError::fatal("session already closed"));
        }

        let latency = self.store.inner.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let injected = {
            let mut faults = self.store.inner.faults.lock();
            if faults.unavailable {
                Some(ErrorKind::Unavailable)
            } else {
                faults.fail_next.pop_front()
            }
        };
        if let Some(kind) = injected {
            return Err(StoreError::new(kind, format!("injected {kind} failure")));
        }

        self.store
            .inner
            .statements_run
            .fetch_add(1, AtomicOrdering::SeqCst);
        Ok(self.store.execute(statement))
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if !self.closed {
            self.closed = true;
            self.store
                .inner
                .open_sessions
                .fetch_sub(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

fn row<const N: usize>(entries: [(&str, Value); N]) -> Row {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Params;

    #[tokio::test]
    async fn test_upsert_merges_properties() {
        let store = MemoryGraphStore::new();
        let mut session = store.session().await.unwrap();

        let mut props = Params::new();
        props.insert("status".to_string(), json!("pending"));
        props.insert("owner".to_string(), json!("writer"));
        session
            .run(&Statement::upsert(NodeLabel::Task, "t-1", props))
            .await
            .unwrap();

        let mut update = Params::new();
        update.insert("status".to_string(), json!("done"));
        session
            .run(&Statement::upsert(NodeLabel::Task, "t-1", update))
            .await
            .unwrap();
        session.close().await.unwrap();

        let node = store.node(NodeLabel::Task, "t-1").unwrap();
        assert_eq!(node["status"], "done");
        assert_eq!(node["owner"], "writer");
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_never_moves_backwards() {
        let store = MemoryGraphStore::new();
        let mut session = store.session().await.unwrap();
        for at_millis in [200, 100, 300] {
            session
                .run(&Statement::TouchHeartbeat {
                    agent_id: "main".to_string(),
                    at_millis,
                })
                .await
                .unwrap();
        }
        let rows = session
            .run(&Statement::ReadHeartbeat {
                agent_id: "main".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rows[0]["last_heartbeat"], 300);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryGraphStore::new();
        store.fail_next(1, ErrorKind::Transient);

        let mut session = store.session().await.unwrap();
        let err = session.run(&Statement::Ping).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(session.run(&Statement::Ping).await.is_ok());
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(store.open_sessions(), 0);

        store.set_unavailable(true);
        assert!(store.session().await.is_err());
        assert_eq!(store.session_attempts(), 2);
    }

    #[tokio::test]
    async fn test_list_nodes_orders_and_limits() {
        let store = MemoryGraphStore::new();
        let mut session = store.session().await.unwrap();
        for (id, at) in [("a", 1), ("b", 3), ("c", 2)] {
            let mut props = Params::new();
            props.insert("activated_at".to_string(), json!(at));
            session
                .run(&Statement::upsert(NodeLabel::FailoverEvent, id, props))
                .await
                .unwrap();
        }
        let rows = session
            .run(&Statement::ListNodes {
                label: NodeLabel::FailoverEvent,
                order_by: Some("activated_at".to_string()),
                descending: true,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["node"]["id"], "b");
        assert_eq!(rows[1]["node"]["id"], "c");
        session.close().await.unwrap();
    }
}
