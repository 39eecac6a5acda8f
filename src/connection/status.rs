//! Connection state and the operator-facing status report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SyncReport;
use crate::error::ErrorKind;
use crate::fallback::FallbackStats;
use crate::resilience::CircuitBreakerMetrics;

/// Reachability of the primary store as seen by the resilient connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Healthy,
    /// Recovering or intermittently failing; calls still go to the primary store
    Degraded,
    /// No driver, no credentials, or the store refused connections
    Unavailable,
    /// Breaker is open; calls go straight to the fallback store
    CircuitOpen,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Healthy => write!(f, "healthy"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::Unavailable => write!(f, "unavailable"),
            ConnectionState::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Best-known state of both tiers. Building it never fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Name of the primary store driver, if one is configured
    pub primary_store: Option<String>,
    pub forced_fallback: bool,
    pub consecutive_successes: u32,
    pub successes_required: u32,
    pub primary_calls: u64,
    pub fallback_calls: u64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub circuit: CircuitBreakerMetrics,
    pub fallback: Option<FallbackStats>,
    /// Why fallback statistics are missing
    pub fallback_error: Option<String>,
    pub sync_running: bool,
    pub last_sync: Option<SyncReport>,
    pub checked_at: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Healthy && !self.forced_fallback
    }
}
