//! Failover episodes, inter-agent notifications and held messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KurultaiError, KurultaiResult};
use crate::store::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverTrigger {
    Auto,
    Manual,
}

impl std::fmt::Display for FailoverTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverTrigger::Auto => write!(f, "auto"),
            FailoverTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// One period during which the standby coordinator routed messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: Uuid,
    pub triggered_by: FailoverTrigger,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    /// Sort key for history queries
    pub activated_at_ms: i64,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(default)]
    pub messages_routed: u64,
    #[serde(default)]
    pub primary_status_at_trigger: Option<String>,
}

impl FailoverEvent {
    pub fn new(
        triggered_by: FailoverTrigger,
        reason: impl Into<String>,
        primary_status_at_trigger: Option<String>,
    ) -> Self {
        let activated_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            triggered_by,
            reason: reason.into(),
            activated_at,
            activated_at_ms: activated_at.timestamp_millis(),
            deactivated_at: None,
            is_active: true,
            messages_routed: 0,
            primary_status_at_trigger,
        }
    }

    pub fn close(&mut self) {
        self.is_active = false;
        self.deactivated_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.deactivated_at.map(|end| end - self.activated_at)
    }

    pub fn to_properties(&self) -> KurultaiResult<Params> {
        to_params(self)
    }

    pub fn from_properties(properties: &Params) -> KurultaiResult<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            properties.clone(),
        ))?)
    }
}

/// Notification written for an agent when failover starts or ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub agent: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub summary: String,
    #[serde(default)]
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        agent: impl Into<String>,
        notification_type: impl Into<String>,
        summary: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent: agent.into(),
            notification_type: notification_type.into(),
            summary: summary.into(),
            task_id,
            created_at: Utc::now(),
        }
    }

    pub fn to_properties(&self) -> KurultaiResult<Params> {
        to_params(self)
    }
}

/// Non-critical message held while failover is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub sender: String,
    pub content: String,
    pub queued_at: DateTime<Utc>,
    pub event_id: Uuid,
}

fn to_params<T: Serialize>(value: &T) -> KurultaiResult<Params> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(KurultaiError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}
