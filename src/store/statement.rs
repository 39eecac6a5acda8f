//! Typed, parameterized statements and their Cypher rendering.
//!
//! Labels come from the closed [`NodeLabel`] enum and every value travels as a
//! parameter, so no caller-supplied text is ever spliced into a query.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Statement parameters
pub type Params = serde_json::Map<String, Value>;

/// Node labels the resilience core reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLabel {
    Agent,
    AgentMemory,
    Task,
    Notification,
    FailoverEvent,
}

impl NodeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeLabel::Agent => "Agent",
            NodeLabel::AgentMemory => "AgentMemory",
            NodeLabel::Task => "Task",
            NodeLabel::Notification => "Notification",
            NodeLabel::FailoverEvent => "FailoverEvent",
        }
    }
}

impl std::fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement the resilient connection can send to the primary store
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Liveness probe
    Ping,
    /// Create-or-update a node by id, merging properties
    UpsertNode {
        label: NodeLabel,
        id: String,
        properties: Params,
    },
    /// Remove a node and its relationships
    DeleteNode { label: NodeLabel, id: String },
    /// Raise an agent's `last_heartbeat` (epoch millis) without ever lowering it
    TouchHeartbeat { agent_id: String, at_millis: i64 },
    /// Read an agent's `last_heartbeat`
    ReadHeartbeat { agent_id: String },
    /// Raise a failover event's `messages_routed` without ever lowering it
    RaiseRoutedCount { event_id: String, count: u64 },
    /// List nodes of a label, optionally ordered by one property
    ListNodes {
        label: NodeLabel,
        order_by: Option<String>,
        descending: bool,
        limit: u32,
    },
    /// Caller-provided Cypher with parameters
    Cypher { text: String, params: Params },
}

/// Query text plus parameters, ready for a driver
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub text: String,
    pub params: Params,
}

impl Statement {
    pub fn upsert(label: NodeLabel, id: impl Into<String>, properties: Params) -> Self {
        Statement::UpsertNode {
            label,
            id: id.into(),
            properties,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Ping => "ping",
            Statement::UpsertNode { .. } => "upsert_node",
            Statement::DeleteNode { .. } => "delete_node",
            Statement::TouchHeartbeat { .. } => "touch_heartbeat",
            Statement::ReadHeartbeat { .. } => "read_heartbeat",
            Statement::RaiseRoutedCount { .. } => "raise_routed_count",
            Statement::ListNodes { .. } => "list_nodes",
            Statement::Cypher { .. } => "cypher",
        }
    }

    pub fn render(&self) -> RenderedQuery {
        match self {
            Statement::Ping => RenderedQuery {
                text: "RETURN 1 AS ok".to_string(),
                params: Params::new(),
            },
            Statement::UpsertNode {
                label,
                id,
                properties,
            } => {
                let props: Params = properties
                    .iter()
                    .filter(|(key, _)| key.as_str() != "id")
                    .map(|(key, value)| (key.clone(), to_property_value(value)))
                    .collect();
                RenderedQuery {
                    text: format!(
                        "MERGE (n:{label} {{id: $id}}) SET n += $props RETURN n.id AS id"
                    ),
                    params: params([("id", json!(id)), ("props", Value::Object(props))]),
                }
            }
            Statement::DeleteNode { label, id } => RenderedQuery {
                text: format!("MATCH (n:{label} {{id: $id}}) DETACH DELETE n"),
                params: params([("id", json!(id))]),
            },
            Statement::TouchHeartbeat {
                agent_id,
                at_millis,
            } => RenderedQuery {
                text: "MERGE (a:Agent {id: $agent_id}) \
                       SET a.last_heartbeat = CASE \
                       WHEN a.last_heartbeat IS NULL OR a.last_heartbeat < $at THEN $at \
                       ELSE a.last_heartbeat END \
                       RETURN a.last_heartbeat AS last_heartbeat"
                    .to_string(),
                params: params([("agent_id", json!(agent_id)), ("at", json!(at_millis))]),
            },
            Statement::ReadHeartbeat { agent_id } => RenderedQuery {
                text: "MATCH (a:Agent {id: $agent_id}) RETURN a.last_heartbeat AS last_heartbeat"
                    .to_string(),
                params: params([("agent_id", json!(agent_id))]),
            },
            Statement::RaiseRoutedCount { event_id, count } => RenderedQuery {
                text: "MERGE (e:FailoverEvent {id: $event_id}) \
                       SET e.messages_routed = CASE \
                       WHEN e.messages_routed IS NULL OR e.messages_routed < $count THEN $count \
                       ELSE e.messages_routed END \
                       RETURN e.messages_routed AS messages_routed"
                    .to_string(),
                params: params([("event_id", json!(event_id)), ("count", json!(count))]),
            },
            Statement::ListNodes {
                label,
                order_by,
                descending,
                limit,
            } => {
                let ordering = order_by
                    .as_deref()
                    .filter(|property| is_safe_identifier(property))
                    .map(|property| {
                        format!(
                            " ORDER BY n.{property}{}",
                            if *descending { " DESC" } else { "" }
                        )
                    })
                    .unwrap_or_default();
                RenderedQuery {
                    text: format!(
                        "MATCH (n:{label}) RETURN properties(n) AS node{ordering} LIMIT $limit"
                    ),
                    params: params([("limit", json!(limit))]),
                }
            }
            Statement::Cypher { text, params } => RenderedQuery {
                text: text.clone(),
                params: params.clone(),
            },
        }
    }
}

fn params<const N: usize>(entries: [(&str, Value); N]) -> Params {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Graph properties hold primitives or homogeneous primitive lists; nested
/// structures are stored as JSON text.
fn to_property_value(value: &Value) -> Value {
    match value {
        Value::Object(_) => Value::String(value.to_string()),
        Value::Array(items) if items.iter().any(|v| v.is_object() || v.is_array()) => {
            Value::String(value.to_string())
        }
        _ => value.clone(),
    }
}

fn is_safe_identifier(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !candidate.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_renders_merge_by_id() {
        let mut props = Params::new();
        props.insert("id".to_string(), json!("t-1"));
        props.insert("status".to_string(), json!("pending"));
        props.insert("meta".to_string(), json!({"priority": 2}));

        let rendered = Statement::upsert(NodeLabel::Task, "t-1", props).render();
        assert_eq!(
            rendered.text,
            "MERGE (n:Task {id: $id}) SET n += $props RETURN n.id AS id"
        );
        assert_eq!(rendered.params["id"], "t-1");
        let props = rendered.params["props"].as_object().unwrap();
        assert!(!props.contains_key("id"));
        assert_eq!(props["status"], "pending");
        assert_eq!(props["meta"], json!("{\"priority\":2}"));
    }

    #[test]
    fn test_list_nodes_ignores_unsafe_order_property() {
        let statement = Statement::ListNodes {
            label: NodeLabel::FailoverEvent,
            order_by: Some("activated_at) DETACH DELETE n //".to_string()),
            descending: true,
            limit: 10,
        };
        let rendered = statement.render();
        assert!(!rendered.text.contains("DELETE"));
        assert!(!rendered.text.contains("ORDER BY"));

        let statement = Statement::ListNodes {
            label: NodeLabel::FailoverEvent,
            order_by: Some("activated_at".to_string()),
            descending: true,
            limit: 10,
        };
        assert!(statement
            .render()
            .text
            .contains("ORDER BY n.activated_at DESC"));
    }

    #[test]
    fn test_routed_count_only_raises() {
        let rendered = Statement::RaiseRoutedCount {
            event_id: "e-1".to_string(),
            count: 4,
        }
        .render();
        assert!(rendered.text.contains("e.messages_routed < $count"));
        assert_eq!(rendered.params["event_id"], "e-1");
        assert_eq!(rendered.params["count"], 4);
    }
}
