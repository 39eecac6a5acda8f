//! # Kurultai Configuration System
//!
//! Layered configuration for the resilience core: built-in defaults, an optional
//! configuration file (YAML, TOML or JSON) and environment overrides. Every value
//! can be changed without a code change, and a missing primary-store credential
//! never fails loading; the connection simply starts in fallback mode.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kurultai_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let retry = &manager.config().retry;
//! println!("max retries: {}", retry.max_retries);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::failover::DegradedReadPolicy;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct KurultaiConfig {
    /// Graph database connection settings
    pub primary_store: PrimaryStoreConfig,

    /// Retry and backoff behaviour for primary-store operations
    pub retry: RetrySettings,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerSettings,

    /// Local fallback store settings
    pub fallback: FallbackConfig,

    /// Coordinator failover settings
    pub failover: FailoverConfig,
}

/// Graph database connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrimaryStoreConfig {
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub connection_timeout_ms: u64,
    pub max_connection_pool_size: usize,
}

impl Default for PrimaryStoreConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            username: None,
            password: None,
            database: "neo4j".to_string(),
            connection_timeout_ms: 10_000,
            max_connection_pool_size: 50,
        }
    }
}

impl PrimaryStoreConfig {
    /// Credentials are present and non-empty
    pub fn has_credentials(&self) -> bool {
        matches!(
            (&self.username, &self.password),
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty()
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per operation, including the first
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Multiply each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Consecutive successes required before a degraded connection is healthy again
    pub half_open_max_calls: u32,
    /// Hard daily spend ceiling; `None` disables the cost gate
    pub daily_cost_limit: Option<f64>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 3,
            daily_cost_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    /// Entries at or above this retry count are stuck and skipped by sync passes
    pub max_sync_attempts: u32,
    pub sync_batch_size: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/kurultai-fallback.db"),
            max_connections: 4,
            busy_timeout_ms: 5_000,
            max_sync_attempts: 5,
            sync_batch_size: 100,
        }
    }
}

/// One keyword route used by the failover message router
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeywordRoute {
    pub keyword: String,
    pub agent: String,
}

impl KeywordRoute {
    pub fn new(keyword: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            agent: agent.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub primary_agent_id: String,
    pub standby_agent_id: String,
    pub known_agents: Vec<String>,
    pub check_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub max_consecutive_failures: u32,
    pub recovery_heartbeats_required: u32,
    pub rate_limit_threshold: u32,
    pub monitor_stop_timeout_ms: u64,
    /// How the background monitor treats a heartbeat read served by the fallback tier
    pub monitor_read_policy: DegradedReadPolicy,
    pub routes: Vec<KeywordRoute>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary_agent_id: "main".to_string(),
            standby_agent_id: "ops".to_string(),
            known_agents: ["main", "researcher", "writer", "developer", "analyst", "ops"]
                .iter()
                .map(|agent| agent.to_string())
                .collect(),
            check_interval_ms: 30_000,
            stale_threshold_ms: 90_000,
            max_consecutive_failures: 3,
            recovery_heartbeats_required: 3,
            rate_limit_threshold: 3,
            monitor_stop_timeout_ms: 5_000,
            monitor_read_policy: DegradedReadPolicy::FailOpen,
            routes: default_routes(),
        }
    }
}

impl FailoverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn monitor_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_stop_timeout_ms)
    }
}

fn default_routes() -> Vec<KeywordRoute> {
    [
        ("research", "researcher"),
        ("investigate", "researcher"),
        ("source", "researcher"),
        ("write", "writer"),
        ("draft", "writer"),
        ("document", "writer"),
        ("code", "developer"),
        ("bug", "developer"),
        ("deploy", "developer"),
        ("api", "developer"),
        ("security", "analyst"),
        ("vulnerab", "analyst"),
        ("audit", "analyst"),
        ("analy", "analyst"),
        ("outage", "ops"),
        ("incident", "ops"),
    ]
    .iter()
    .map(|(keyword, agent)| KeywordRoute::new(*keyword, *agent))
    .collect()
}

impl KurultaiConfig {
    /// Validate cross-field invariants
    pub fn validate(&self) -> ConfigResult<()> {
        if self.retry.max_retries == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_retries",
                "0",
                "at least one attempt is required",
            ));
        }

        if self.retry.exponential_base < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.exponential_base",
                self.retry.exponential_base.to_string(),
                "must be >= 1.0",
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "retry.base_delay_ms",
                self.retry.base_delay_ms.to_string(),
                "must not exceed retry.max_delay_ms",
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.failure_threshold",
                "0",
                "must be greater than 0",
            ));
        }

        if self.circuit_breaker.recovery_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "circuit_breaker.recovery_timeout_ms",
                "0",
                "must be greater than 0",
            ));
        }

        if let Some(limit) = self.circuit_breaker.daily_cost_limit {
            if !limit.is_finite() || limit < 0.0 {
                return Err(ConfigurationError::invalid_value(
                    "circuit_breaker.daily_cost_limit",
                    limit.to_string(),
                    "must be a finite, non-negative amount",
                ));
            }
        }

        if self.fallback.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "fallback.max_connections",
                "0",
                "must be greater than 0",
            ));
        }

        if self.fallback.max_sync_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "fallback.max_sync_attempts",
                "0",
                "must be greater than 0",
            ));
        }

        let failover = &self.failover;
        if failover.primary_agent_id.is_empty() || failover.standby_agent_id.is_empty() {
            return Err(ConfigurationError::validation_error(
                "failover.primary_agent_id and failover.standby_agent_id are required",
            ));
        }

        if failover.primary_agent_id == failover.standby_agent_id {
            return Err(ConfigurationError::invalid_value(
                "failover.standby_agent_id",
                failover.standby_agent_id.clone(),
                "standby must differ from the primary coordinator",
            ));
        }

        if failover.check_interval_ms == 0
            || failover.max_consecutive_failures == 0
            || failover.recovery_heartbeats_required == 0
            || failover.rate_limit_threshold == 0
        {
            return Err(ConfigurationError::validation_error(
                "failover intervals and thresholds must be greater than 0",
            ));
        }

        if let Some(route) = failover
            .routes
            .iter()
            .find(|route| route.keyword.trim().is_empty())
        {
            return Err(ConfigurationError::invalid_value(
                "failover.routes",
                route.agent.clone(),
                "route keyword must not be empty",
            ));
        }

        Ok(())
    }
}
