#![allow(clippy::doc_markdown)] // Allow technical terms like Neo4j, SQLite in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Kurultai Core
//!
//! Resilience substrate for a multi-agent orchestration platform whose system
//! of record is a graph database that can become unreachable.
//!
//! ## Overview
//!
//! Three coupled failure-handling subsystems keep the platform operating:
//!
//! - a **resilient connection** that retries, circuit-breaks, and falls back to a
//!   durable local store when the primary store is unavailable
//! - a **sync pass** that replays locally buffered writes once the primary store
//!   recovers
//! - a **failover protocol** that hands routing to a standby coordinator while
//!   the primary coordinator's heartbeat is stale
//!
//! ## Module Organization
//!
//! - [`store`] - Primary graph store seam, HTTP driver and in-process store
//! - [`resilience`] - Circuit breaker, retry policy and error classification
//! - [`fallback`] - SQLite fallback store and sync queue
//! - [`connection`] - Resilient connection, scoped sessions and replay sync
//! - [`failover`] - Heartbeats, failover protocol, monitor and message router
//! - [`system`] - Explicit lifecycle owner for all of the above
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup and helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kurultai_core::config::ConfigManager;
//! use kurultai_core::system::KurultaiSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let system = KurultaiSystem::init(manager.config().clone()).await?;
//! system.start();
//!
//! let decision = system
//!     .protocol()
//!     .route_message("user", "deploy is failing", true)
//!     .await;
//! println!("routed to {}", decision.target);
//!
//! system.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod failover;
pub mod fallback;
pub mod logging;
pub mod resilience;
pub mod store;
pub mod system;

pub use config::{ConfigManager, KurultaiConfig};
pub use connection::{
    ConnectionState, ConnectionStatus, ExecuteOutcome, FallbackAction, FallbackResult, Operation,
    ResilientConnection, SyncReport,
};
pub use error::{ErrorKind, KurultaiError, KurultaiResult, StoreError};
pub use failover::{
    DegradedReadPolicy, FailoverEvent, FailoverMonitor, FailoverProtocol, FailoverStatus,
    FailoverTrigger, HeartbeatTracker, MessageRouter, RouteTarget, RoutingDecision,
};
pub use fallback::{FallbackStore, FallbackTable, RecordSelector, SyncQueueEntry};
pub use resilience::{CircuitBreaker, CircuitState};
pub use store::{GraphSession, GraphStore, MemoryGraphStore, Neo4jHttpStore, Statement};
pub use system::KurultaiSystem;
