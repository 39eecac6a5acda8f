//! # Failover Protocol
//!
//! Process-wide failover state machine: `Normal` (primary coordinator routes)
//! and `Active` (standby coordinator routes).
//!
//! Transitions are serialized by an async mutex; the flag itself lives under a
//! short synchronous lock so routing never waits on transition I/O. Activation
//! and deactivation flip the in-memory state first and then persist the event,
//! agent roles and notifications best-effort: a store failure is logged and never
//! blocks the transition.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::{FailoverEvent, FailoverTrigger, NotificationRecord, QueuedMessage};
use super::heartbeat::{DegradedReadPolicy, HeartbeatReading, HeartbeatTracker};
use super::router::{MessageRouter, RouteTarget};
use crate::config::FailoverConfig;
use crate::connection::{
    ConnectionState, ExecuteOutcome, FallbackAction, FallbackResult, Operation,
    ResilientConnection,
};
use crate::fallback::{FallbackTable, FallbackWrite, RecordSelector};
use crate::logging::{log_error, log_failover_event};
use crate::store::{NodeLabel, Params, Statement};

/// Transition performed by a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", content = "event_id", rename_all = "snake_case")]
pub enum FailoverTransition {
    Activated(Uuid),
    Deactivated(Uuid),
}

/// Outcome of one health check of the primary coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverCheck {
    pub healthy: bool,
    pub failover_active: bool,
    pub consecutive_failures: u32,
    pub consecutive_healthy: u32,
    pub transition: Option<FailoverTransition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub failover_active: bool,
    pub event_id: Option<Uuid>,
    /// Messages routed or queued in the current failover window
    pub messages_routed: u64,
}

/// Snapshot of the failover state for operators and dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverStatus {
    pub failover_active: bool,
    pub primary_agent: String,
    pub standby_agent: String,
    pub current_router: String,
    pub event_id: Option<Uuid>,
    pub triggered_by: Option<FailoverTrigger>,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    pub messages_routed: u64,
    pub queued_messages: usize,
    pub consecutive_failures: u32,
    pub consecutive_healthy: u32,
    pub max_consecutive_failures: u32,
    pub recovery_heartbeats_required: u32,
    pub rate_limit_count: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub connection_state: ConnectionState,
}

#[derive(Debug, Default)]
struct ProtocolState {
    active_event: Option<FailoverEvent>,
    consecutive_failures: u32,
    consecutive_healthy: u32,
    rate_limit_count: u32,
    queued_messages: Vec<QueuedMessage>,
    last_check_at: Option<DateTime<Utc>>,
}

enum PendingTransition {
    Activate(String),
    Deactivate(String),
}

#[derive(Debug)]
pub struct FailoverProtocol {
    connection: ResilientConnection,
    heartbeats: HeartbeatTracker,
    router: MessageRouter,
    config: FailoverConfig,
    transition: tokio::sync::Mutex<()>,
    state: Mutex<ProtocolState>,
}

impl FailoverProtocol {
    pub fn new(
        connection: ResilientConnection,
        heartbeats: HeartbeatTracker,
        config: FailoverConfig,
    ) -> Self {
        let router = MessageRouter::new(&config.routes, config.standby_agent_id.clone());
        Self {
            connection,
            heartbeats,
            router,
            config,
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(ProtocolState::default()),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn is_failover_active(&self) -> bool {
        self.state.lock().active_event.is_some()
    }

    pub fn active_event(&self) -> Option<FailoverEvent> {
        self.state.lock().active_event.clone()
    }

    /// Hand routing to the standby coordinator.
    ///
    /// Concurrent callers all receive the id of the single event created; a call
    /// while failover is already active returns the existing id.
    pub async fn activate_failover(&self, trigger: FailoverTrigger, reason: &str) -> Uuid {
        if let Some(event) = self.active_event() {
            return event.id;
        }
        let _transition = self.transition.lock().await;
        if let Some(event) = self.active_event() {
            return event.id;
        }

        let primary = &self.config.primary_agent_id;
        let standby = &self.config.standby_agent_id;
        let primary_status = match self.heartbeats.cached(primary) {
            Some(at) => format!("last heartbeat {at}"),
            None => "no heartbeat observed".to_string(),
        };
        let event = FailoverEvent::new(trigger, reason, Some(primary_status));
        {
            let mut state = self.state.lock();
            state.active_event = Some(event.clone());
            state.consecutive_failures = 0;
            state.consecutive_healthy = 0;
            state.rate_limit_count = 0;
        }

        log_failover_event(
            "activated",
            &event.id.to_string(),
            primary,
            standby,
            reason,
            0,
        );

        self.persist_event(&event).await;
        self.set_agent_role(primary, "coordinator", "failed_over").await;
        self.set_agent_role(standby, "acting_coordinator", "active").await;
        self.broadcast(
            "failover_activated",
            &format!("{standby} is routing messages while {primary} is unavailable: {reason}"),
        )
        .await;

        event.id
    }

    /// Return routing to the primary coordinator. Returns `false` when failover
    /// was not active.
    pub async fn deactivate_failover(&self, reason: &str) -> bool {
        let _transition = self.transition.lock().await;
        let event = {
            let mut state = self.state.lock();
            let Some(mut event) = state.active_event.take() else {
                return false;
            };
            event.close();
            state.consecutive_failures = 0;
            state.consecutive_healthy = 0;
            state.rate_limit_count = 0;
            event
        };

        let primary = &self.config.primary_agent_id;
        let standby = &self.config.standby_agent_id;
        log_failover_event(
            "deactivated",
            &event.id.to_string(),
            primary,
            standby,
            reason,
            event.messages_routed,
        );

        self.persist_event(&event).await;
        self.set_agent_role(primary, "coordinator", "active").await;
        self.set_agent_role(standby, "specialist", "active").await;
        self.broadcast(
            "failover_deactivated",
            &format!(
                "{primary} resumed routing after {} messages handled by {standby}: {reason}",
                event.messages_routed
            ),
        )
        .await;

        true
    }

    /// Feed one health observation of the primary into the state machine
    pub async fn record_health_check(&self, healthy: bool) -> FailoverCheck {
        let max_failures = self.config.max_consecutive_failures.max(1);
        let required = self.config.recovery_heartbeats_required.max(1);

        let (mut check, pending) = {
            let mut state = self.state.lock();
            state.last_check_at = Some(Utc::now());
            let active = state.active_event.is_some();

            let pending = if healthy {
                state.consecutive_failures = 0;
                if active {
                    state.consecutive_healthy += 1;
                    (state.consecutive_healthy >= required).then(|| {
                        PendingTransition::Deactivate(format!(
                            "{} consecutive healthy checks",
                            state.consecutive_healthy
                        ))
                    })
                } else {
                    None
                }
            } else {
                state.consecutive_healthy = 0;
                state.consecutive_failures += 1;
                (!active && state.consecutive_failures >= max_failures).then(|| {
                    PendingTransition::Activate(format!(
                        "{} missed {} consecutive health checks",
                        self.config.primary_agent_id, state.consecutive_failures
                    ))
                })
            };

            let check = FailoverCheck {
                healthy,
                failover_active: active,
                consecutive_failures: state.consecutive_failures,
                consecutive_healthy: state.consecutive_healthy,
                transition: None,
            };
            (check, pending)
        };

        match pending {
            Some(PendingTransition::Activate(reason)) => {
                let event_id = self.activate_failover(FailoverTrigger::Auto, &reason).await;
                check.failover_active = true;
                check.transition = Some(FailoverTransition::Activated(event_id));
            }
            Some(PendingTransition::Deactivate(reason)) => {
                let event_id = self.active_event().map(|event| event.id);
                if self.deactivate_failover(&reason).await {
                    check.failover_active = false;
                    check.transition = event_id.map(FailoverTransition::Deactivated);
                }
            }
            None => {}
        }

        debug!(
            healthy = check.healthy,
            failover_active = check.failover_active,
            consecutive_failures = check.consecutive_failures,
            consecutive_healthy = check.consecutive_healthy,
            "Primary health check recorded"
        );
        check
    }

    /// Check the primary's heartbeat and record the result.
    ///
    /// Only a fresh heartbeat read from the primary store counts towards
    /// recovery. A degraded read under `FailOpen` keeps failover from
    /// activating, but while failover is active it is no evidence of health and
    /// restarts the recovery count.
    pub async fn run_health_check(&self, policy: DegradedReadPolicy) -> FailoverCheck {
        let primary = &self.config.primary_agent_id;
        match self.heartbeats.last_seen(primary).await {
            HeartbeatReading::Seen { at } => {
                let fresh = self.heartbeats.is_fresh(at);
                self.record_health_check(fresh).await
            }
            HeartbeatReading::Never => self.record_health_check(false).await,
            HeartbeatReading::Degraded { .. } => match policy {
                DegradedReadPolicy::FailClosed => self.record_health_check(false).await,
                DegradedReadPolicy::FailOpen => self.record_unreadable_check().await,
            },
        }
    }

    async fn record_unreadable_check(&self) -> FailoverCheck {
        let held = {
            let mut state = self.state.lock();
            state.active_event.is_some().then(|| {
                state.last_check_at = Some(Utc::now());
                state.consecutive_healthy = 0;
                FailoverCheck {
                    healthy: false,
                    failover_active: true,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_healthy: 0,
                    transition: None,
                }
            })
        };
        match held {
            Some(check) => {
                debug!(
                    primary_agent = %self.config.primary_agent_id,
                    "Heartbeat unreadable during failover; recovery count restarted"
                );
                check
            }
            None => self.record_health_check(true).await,
        }
    }

    /// Health check that treats an unreadable heartbeat as a failure
    pub async fn check_primary_health(&self) -> FailoverCheck {
        self.run_health_check(DegradedReadPolicy::FailClosed).await
    }

    /// Count a rate-limit signal from an agent. Reports about the primary
    /// coordinator activate failover once they reach the threshold.
    pub async fn report_rate_limit(&self, agent_id: &str) -> Option<Uuid> {
        if agent_id != self.config.primary_agent_id {
            debug!(agent_id = agent_id, "Rate limit reported for a non-primary agent");
            return None;
        }
        let count = {
            let mut state = self.state.lock();
            state.rate_limit_count += 1;
            state.rate_limit_count
        };
        warn!(
            agent_id = agent_id,
            count = count,
            threshold = self.config.rate_limit_threshold,
            "Primary coordinator reported rate limited"
        );

        if count >= self.config.rate_limit_threshold.max(1) {
            let reason = format!("{agent_id} rate limited {count} consecutive times");
            Some(self.activate_failover(FailoverTrigger::Auto, &reason).await)
        } else {
            None
        }
    }

    pub fn clear_rate_limit(&self, agent_id: &str) {
        if agent_id == self.config.primary_agent_id {
            self.state.lock().rate_limit_count = 0;
        }
    }

    /// Pick the agent that handles a message.
    ///
    /// Without failover every message goes to the primary coordinator. During
    /// failover critical messages are classified by keyword and everything else
    /// is held for the primary; both count towards `messages_routed`.
    pub async fn route_message(&self, sender: &str, content: &str, is_critical: bool) -> RoutingDecision {
        let (decision, event_id) = {
            let mut state = self.state.lock();
            let Some(event) = state.active_event.as_mut() else {
                return RoutingDecision {
                    target: RouteTarget::Agent(self.config.primary_agent_id.clone()),
                    failover_active: false,
                    event_id: None,
                    messages_routed: 0,
                };
            };

            let target = if is_critical {
                self.router.route_critical(content)
            } else {
                RouteTarget::Queued
            };
            event.messages_routed += 1;
            let event_id = event.id;
            let decision = RoutingDecision {
                target,
                failover_active: true,
                event_id: Some(event_id),
                messages_routed: event.messages_routed,
            };
            if decision.target == RouteTarget::Queued {
                state.queued_messages.push(QueuedMessage {
                    sender: sender.to_string(),
                    content: content.to_string(),
                    queued_at: Utc::now(),
                    event_id,
                });
            }
            (decision, event_id)
        };

        debug!(
            sender = sender,
            target = %decision.target,
            critical = is_critical,
            messages_routed = decision.messages_routed,
            "Message routed during failover"
        );
        self.persist_routed_count(event_id, decision.messages_routed)
            .await;
        decision
    }

    pub fn get_failover_status(&self) -> FailoverStatus {
        let state = self.state.lock();
        let event = state.active_event.as_ref();
        FailoverStatus {
            failover_active: event.is_some(),
            primary_agent: self.config.primary_agent_id.clone(),
            standby_agent: self.config.standby_agent_id.clone(),
            current_router: if event.is_some() {
                self.config.standby_agent_id.clone()
            } else {
                self.config.primary_agent_id.clone()
            },
            event_id: event.map(|e| e.id),
            triggered_by: event.map(|e| e.triggered_by),
            reason: event.map(|e| e.reason.clone()),
            activated_at: event.map(|e| e.activated_at),
            messages_routed: event.map_or(0, |e| e.messages_routed),
            queued_messages: state.queued_messages.len(),
            consecutive_failures: state.consecutive_failures,
            consecutive_healthy: state.consecutive_healthy,
            max_consecutive_failures: self.config.max_consecutive_failures,
            recovery_heartbeats_required: self.config.recovery_heartbeats_required,
            rate_limit_count: state.rate_limit_count,
            last_check_at: state.last_check_at,
            connection_state: self.connection.state(),
        }
    }

    /// Most recent failover events, newest first. Empty when neither tier can answer.
    pub async fn get_failover_history(&self, limit: u32) -> Vec<FailoverEvent> {
        let operation = Operation::read(
            "failover_history",
            Statement::ListNodes {
                label: NodeLabel::FailoverEvent,
                order_by: Some("activated_at_ms".to_string()),
                descending: true,
                limit,
            },
            RecordSelector::table(FallbackTable::FailoverEvents),
            limit,
        );

        let mut events: Vec<FailoverEvent> = match self.connection.execute(operation).await {
            Ok(ExecuteOutcome::Primary(rows)) => rows
                .iter()
                .filter_map(|row| row.get("node").and_then(|node| node.as_object()))
                .filter_map(|properties| FailoverEvent::from_properties(properties).ok())
                .collect(),
            Ok(ExecuteOutcome::Fallback(FallbackResult::Records { records })) => records
                .iter()
                .filter_map(|record| FailoverEvent::from_properties(&record.payload).ok())
                .collect(),
            Ok(ExecuteOutcome::Fallback(_)) => Vec::new(),
            Err(e) => {
                log_error("failover_protocol", "get_failover_history", &e.to_string(), None);
                Vec::new()
            }
        };
        events.sort_by(|a, b| b.activated_at_ms.cmp(&a.activated_at_ms));
        events.truncate(limit as usize);
        events
    }

    /// Take the non-critical messages held during failover
    pub fn drain_queued_messages(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.state.lock().queued_messages)
    }

    async fn persist_event(&self, event: &FailoverEvent) {
        let properties = match event.to_properties() {
            // routing may already have raised the count of a fresh event
            Ok(mut properties) if event.is_active => {
                properties.remove("messages_routed");
                properties
            }
            Ok(properties) => properties,
            Err(e) => {
                log_error("failover_protocol", "persist_event", &e.to_string(), None);
                return;
            }
        };
        let operation = Operation::upsert(
            FallbackTable::FailoverEvents,
            event.id.to_string(),
            properties,
        );
        if let Err(e) = self.connection.execute(operation).await {
            log_error(
                "failover_protocol",
                "persist_event",
                &e.to_string(),
                Some(&event.id.to_string()),
            );
        }
    }

    /// Writes land in any order; the stored count only ever rises
    async fn persist_routed_count(&self, event_id: Uuid, messages_routed: u64) {
        let mut properties = Params::new();
        properties.insert("messages_routed".to_string(), json!(messages_routed));
        let operation = Operation::new(
            "persist_routed_count",
            Statement::RaiseRoutedCount {
                event_id: event_id.to_string(),
                count: messages_routed,
            },
        )
        .with_fallback(FallbackAction::Queue(FallbackWrite::upsert(
            FallbackTable::FailoverEvents,
            event_id.to_string(),
            properties,
        )));
        if let Err(e) = self.connection.execute(operation).await {
            log_error(
                "failover_protocol",
                "persist_routed_count",
                &e.to_string(),
                Some(&event_id.to_string()),
            );
        }
    }

    async fn set_agent_role(&self, agent_id: &str, role: &str, status: &str) {
        let mut properties = Params::new();
        properties.insert("id".to_string(), json!(agent_id));
        properties.insert("role".to_string(), json!(role));
        properties.insert("status".to_string(), json!(status));
        properties.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));

        let operation = Operation::upsert(FallbackTable::AgentState, agent_id, properties);
        if let Err(e) = self.connection.execute(operation).await {
            log_error(
                "failover_protocol",
                "set_agent_role",
                &e.to_string(),
                Some(agent_id),
            );
        }
    }

    /// Notify every known agent except the standby coordinator
    async fn broadcast(&self, notification_type: &str, summary: &str) {
        let standby = &self.config.standby_agent_id;
        let writes = self
            .config
            .known_agents
            .iter()
            .filter(|agent| *agent != standby)
            .map(|agent| self.notify(agent, notification_type, summary));
        let delivered = join_all(writes).await.into_iter().filter(|ok| *ok).count();
        info!(
            notification_type = notification_type,
            delivered = delivered,
            "Failover notifications written"
        );
    }

    async fn notify(&self, agent: &str, notification_type: &str, summary: &str) -> bool {
        let notification = NotificationRecord::new(agent, notification_type, summary, None);
        let properties = match notification.to_properties() {
            Ok(properties) => properties,
            Err(e) => {
                log_error("failover_protocol", "notify", &e.to_string(), Some(agent));
                return false;
            }
        };
        let operation = Operation::upsert(
            FallbackTable::Notifications,
            notification.id.clone(),
            properties,
        );
        match self.connection.execute(operation).await {
            Ok(_) => true,
            Err(e) => {
                log_error("failover_protocol", "notify", &e.to_string(), Some(agent));
                false
            }
        }
    }
}
