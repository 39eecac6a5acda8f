//! Shared helpers for integration tests
#![allow(dead_code)]

pub mod strategies;

use kurultai_core::config::{FallbackConfig, KurultaiConfig};
use kurultai_core::connection::ResilientConnection;
use kurultai_core::failover::{FailoverProtocol, HeartbeatTracker};
use kurultai_core::fallback::FallbackStore;
use kurultai_core::store::{MemoryGraphStore, Params};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// Defaults with no retry delays and a short breaker recovery window
pub fn test_config() -> KurultaiConfig {
    let mut config = KurultaiConfig::default();
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.retry.jitter = false;
    config.circuit_breaker.recovery_timeout_ms = 200;
    config
}

pub async fn fallback_store(config: &FallbackConfig) -> FallbackStore {
    FallbackStore::in_memory(config)
        .await
        .expect("in-memory fallback store")
}

pub async fn connection(store: &MemoryGraphStore, config: &KurultaiConfig) -> ResilientConnection {
    let fallback = fallback_store(&config.fallback).await;
    ResilientConnection::new(Some(Arc::new(store.clone())), fallback, config)
}

pub async fn protocol(
    store: &MemoryGraphStore,
    config: &KurultaiConfig,
) -> (Arc<FailoverProtocol>, ResilientConnection) {
    let connection = connection(store, config).await;
    let heartbeats = HeartbeatTracker::new(connection.clone(), config.failover.stale_threshold());
    let protocol = Arc::new(FailoverProtocol::new(
        connection.clone(),
        heartbeats,
        config.failover.clone(),
    ));
    (protocol, connection)
}

pub fn payload(value: serde_json::Value) -> Params {
    value.as_object().cloned().expect("object payload")
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
