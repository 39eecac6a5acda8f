//! # Primary Store Seam
//!
//! The graph database is reached only through two narrow traits:
//!
//! - [`GraphStore`] hands out sessions (the shared driver/pool)
//! - [`GraphSession`] runs parameterized [`Statement`]s and is closed when done
//!
//! Sessions are never shared across tasks; every call into the resilient
//! connection acquires and releases its own. Both the production HTTP client
//! ([`Neo4jHttpStore`]) and the in-process store ([`MemoryGraphStore`]) implement
//! the same traits.

pub mod memory;
pub mod neo4j_http;
pub mod statement;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryGraphStore;
pub use neo4j_http::Neo4jHttpStore;
pub use statement::{NodeLabel, Params, RenderedQuery, Statement};

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A single-owner unit of work against the primary store
#[async_trait]
pub trait GraphSession: Send {
    /// Run one statement and collect its rows
    async fn run(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError>;

    /// Release the session. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// Shared driver capable of opening sessions
#[async_trait]
pub trait GraphStore: Send + Sync + std::fmt::Debug {
    /// Acquire a new session
    async fn session(&self) -> Result<Box<dyn GraphSession>, StoreError>;

    /// Human-readable store name for logs and status reports
    fn name(&self) -> &str;

    /// Release driver-level resources at shutdown
    async fn shutdown(&self) {}
}
