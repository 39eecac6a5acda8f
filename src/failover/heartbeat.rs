//! Per-agent liveness timestamps, read and written through the resilient connection.

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::{ExecuteOutcome, FallbackAction, FallbackResult, Operation, ResilientConnection};
use crate::error::KurultaiResult;
use crate::fallback::{FallbackTable, FallbackWrite, RecordSelector};
use crate::store::{Params, Statement};

/// How an availability check treats a heartbeat read the primary store could not serve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReadPolicy {
    /// Assume the agent is up; a store outage alone never triggers failover
    #[default]
    FailOpen,
    /// Assume the agent is down
    FailClosed,
}

/// Result of reading an agent's heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reading", rename_all = "snake_case")]
pub enum HeartbeatReading {
    Seen { at: DateTime<Utc> },
    /// The primary store answered and has no heartbeat for the agent
    Never,
    /// The primary store could not answer; `last_known` is the best local value
    Degraded { last_known: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    connection: ResilientConnection,
    /// Highest heartbeat written or observed per agent, epoch millis
    cache: Arc<DashMap<String, i64>>,
    stale_threshold: Duration,
}

impl HeartbeatTracker {
    pub fn new(connection: ResilientConnection, stale_threshold: Duration) -> Self {
        Self {
            connection,
            cache: Arc::new(DashMap::new()),
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub async fn update_heartbeat(&self, agent_id: &str) -> KurultaiResult<DateTime<Utc>> {
        self.record_heartbeat_at(agent_id, Utc::now()).await
    }

    /// Record a heartbeat observed at `at`.
    ///
    /// Heartbeats never move backwards: an older `at` leaves the stored value
    /// alone and the newer one is returned. Fails only if the fallback tier does.
    pub async fn record_heartbeat_at(
        &self,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> KurultaiResult<DateTime<Utc>> {
        let latest = self.remember(agent_id, at.timestamp_millis());

        let mut payload = Params::new();
        payload.insert("id".to_string(), json!(agent_id));
        payload.insert("last_heartbeat".to_string(), json!(latest));

        let operation = Operation::new(
            "update_heartbeat",
            Statement::TouchHeartbeat {
                agent_id: agent_id.to_string(),
                at_millis: latest,
            },
        )
        .with_fallback(FallbackAction::Queue(FallbackWrite::upsert(
            FallbackTable::AgentState,
            agent_id,
            payload,
        )));

        let outcome = self.connection.execute(operation).await?;
        debug!(
            agent_id = agent_id,
            last_heartbeat = latest,
            fallback = outcome.is_fallback(),
            "Heartbeat recorded"
        );
        Ok(from_millis(latest))
    }

    /// Latest heartbeat this process wrote or observed for the agent
    pub fn cached(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.cache.get(agent_id).map(|millis| from_millis(*millis))
    }

    pub async fn last_seen(&self, agent_id: &str) -> HeartbeatReading {
        let cached = self.cache.get(agent_id).map(|millis| *millis);
        let operation = Operation::read(
            "read_heartbeat",
            Statement::ReadHeartbeat {
                agent_id: agent_id.to_string(),
            },
            RecordSelector::table(FallbackTable::AgentState).with_id(agent_id),
            1,
        );

        match self.connection.execute(operation).await {
            Ok(ExecuteOutcome::Primary(rows)) => {
                let stored = rows
                    .first()
                    .and_then(|row| row.get("last_heartbeat"))
                    .and_then(Value::as_i64);
                match stored.max(cached) {
                    Some(millis) => HeartbeatReading::Seen {
                        at: from_millis(self.remember(agent_id, millis)),
                    },
                    None => HeartbeatReading::Never,
                }
            }
            Ok(ExecuteOutcome::Fallback(result)) => {
                let local = match result {
                    FallbackResult::Records { records } => records
                        .first()
                        .and_then(|record| record.payload.get("last_heartbeat"))
                        .and_then(Value::as_i64),
                    _ => None,
                };
                HeartbeatReading::Degraded {
                    last_known: local.max(cached).map(from_millis),
                }
            }
            Err(e) => {
                warn!(agent_id = agent_id, error = %e, "Heartbeat read failed on both tiers");
                HeartbeatReading::Degraded {
                    last_known: cached.map(from_millis),
                }
            }
        }
    }

    pub async fn is_agent_available(&self, agent_id: &str, policy: DegradedReadPolicy) -> bool {
        match self.last_seen(agent_id).await {
            HeartbeatReading::Seen { at } => self.is_fresh(at),
            HeartbeatReading::Never => false,
            HeartbeatReading::Degraded { .. } => {
                debug!(agent_id = agent_id, policy = ?policy, "Heartbeat read degraded");
                policy == DegradedReadPolicy::FailOpen
            }
        }
    }

    /// Whether a heartbeat at `at` is within the stale threshold
    pub fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        // a timestamp from the future counts as fresh
        (Utc::now() - at)
            .to_std()
            .map_or(true, |elapsed| elapsed < self.stale_threshold)
    }

    fn remember(&self, agent_id: &str, millis: i64) -> i64 {
        let mut entry = self.cache.entry(agent_id.to_string()).or_insert(millis);
        if *entry < millis {
            *entry = millis;
        }
        *entry
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
