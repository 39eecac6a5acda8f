//! # Coordinator Failover
//!
//! When the primary coordinator's heartbeat goes stale (or it keeps reporting
//! rate limits) the standby coordinator takes over routing until the primary
//! passes enough consecutive health checks.
//!
//! - [`HeartbeatTracker`]: per-agent liveness through the resilient connection
//! - [`FailoverProtocol`]: the single failover state machine
//! - [`FailoverMonitor`]: periodic scheduler for the protocol's health check
//! - [`MessageRouter`]: keyword routing while failover is active

pub mod event;
pub mod heartbeat;
pub mod monitor;
pub mod protocol;
pub mod router;

pub use event::{FailoverEvent, FailoverTrigger, NotificationRecord, QueuedMessage};
pub use heartbeat::{DegradedReadPolicy, HeartbeatReading, HeartbeatTracker};
pub use monitor::FailoverMonitor;
pub use protocol::{
    FailoverCheck, FailoverProtocol, FailoverStatus, FailoverTransition, RoutingDecision,
};
pub use router::{MessageRouter, RouteTarget};
