//! # Kurultai System
//!
//! Explicitly constructed owner of every resilience component. Build one per
//! process with [`KurultaiSystem::init`] (or [`KurultaiSystem::with_store`] to
//! inject a primary store), hand out the component handles, and call
//! [`KurultaiSystem::close`] at shutdown.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::KurultaiConfig;
use crate::connection::{ConnectionState, ResilientConnection};
use crate::error::KurultaiResult;
use crate::failover::{FailoverMonitor, FailoverProtocol, HeartbeatTracker};
use crate::fallback::FallbackStore;
use crate::store::{GraphStore, Neo4jHttpStore};

/// Lifecycle handle for the resilience core
#[derive(Debug)]
pub struct KurultaiSystem {
    config: KurultaiConfig,
    connection: ResilientConnection,
    heartbeats: HeartbeatTracker,
    protocol: Arc<FailoverProtocol>,
    monitor: FailoverMonitor,
}

impl KurultaiSystem {
    /// Open the fallback store and connect to the configured primary store.
    ///
    /// Missing credentials or an unusable URI do not fail initialization; the
    /// system starts in fallback mode instead.
    pub async fn init(config: KurultaiConfig) -> KurultaiResult<Self> {
        config.validate()?;
        let fallback = FallbackStore::open(&config.fallback).await?;

        let store: Option<Arc<dyn GraphStore>> = if config.primary_store.has_credentials() {
            match Neo4jHttpStore::new(&config.primary_store) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, "Primary store client could not be built; starting in fallback mode");
                    None
                }
            }
        } else {
            warn!("Primary store credentials missing; starting in fallback mode");
            None
        };

        Self::with_store(config, store, fallback).await
    }

    /// Wire the components around an already built primary store and fallback store
    pub async fn with_store(
        config: KurultaiConfig,
        store: Option<Arc<dyn GraphStore>>,
        fallback: FallbackStore,
    ) -> KurultaiResult<Self> {
        let connection = ResilientConnection::new(store, fallback, &config);
        let initial_state = connection.probe().await;

        let heartbeats = HeartbeatTracker::new(connection.clone(), config.failover.stale_threshold());
        let protocol = Arc::new(FailoverProtocol::new(
            connection.clone(),
            heartbeats.clone(),
            config.failover.clone(),
        ));
        let monitor = FailoverMonitor::new(
            Arc::clone(&protocol),
            connection.clone(),
            config.failover.check_interval(),
            config.failover.monitor_stop_timeout(),
            config.failover.monitor_read_policy,
        );

        info!(
            connection_state = %initial_state,
            primary_agent = %config.failover.primary_agent_id,
            standby_agent = %config.failover.standby_agent_id,
            "Kurultai resilience core initialized"
        );

        Ok(Self {
            config,
            connection,
            heartbeats,
            protocol,
            monitor,
        })
    }

    /// Start background failover monitoring. Returns `false` if already running.
    pub fn start(&self) -> bool {
        self.monitor.start()
    }

    /// Stop monitoring, let an in-flight sync pass finish, then release both tiers
    pub async fn close(&self) {
        self.monitor.stop().await;
        self.connection
            .close(self.config.failover.monitor_stop_timeout().max(Duration::from_secs(1)))
            .await;
        info!("Kurultai resilience core closed");
    }

    pub fn config(&self) -> &KurultaiConfig {
        &self.config
    }

    pub fn connection(&self) -> &ResilientConnection {
        &self.connection
    }

    pub fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    pub fn protocol(&self) -> &Arc<FailoverProtocol> {
        &self.protocol
    }

    pub fn monitor(&self) -> &FailoverMonitor {
        &self.monitor
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }
}
