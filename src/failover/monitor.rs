//! Background scheduler for failover health checks.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::heartbeat::DegradedReadPolicy;
use super::protocol::FailoverProtocol;
use crate::connection::{ConnectionState, ResilientConnection};

/// Periodically runs the failover health check and probes a non-healthy
/// primary store so recovery is noticed without caller traffic.
#[derive(Debug)]
pub struct FailoverMonitor {
    protocol: Arc<FailoverProtocol>,
    connection: ResilientConnection,
    interval: Duration,
    stop_timeout: Duration,
    policy: DegradedReadPolicy,
    /// Loop handle plus the stop signal belonging to that run
    task: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl FailoverMonitor {
    pub fn new(
        protocol: Arc<FailoverProtocol>,
        connection: ResilientConnection,
        interval: Duration,
        stop_timeout: Duration,
        policy: DegradedReadPolicy,
    ) -> Self {
        Self {
            protocol,
            connection,
            interval,
            stop_timeout,
            policy,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// Start the loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            debug!("Failover monitor already running");
            return false;
        }

        let protocol = Arc::clone(&self.protocol);
        let connection = self.connection.clone();
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let period = self.interval.max(Duration::from_millis(1));
        let policy = self.policy;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let check = protocol.run_health_check(policy).await;
                        if let Some(transition) = check.transition {
                            info!(transition = ?transition, "Failover monitor changed routing");
                        }
                        if connection.state() != ConnectionState::Healthy {
                            connection.probe().await;
                        }
                    }
                    _ = signal.notified() => {
                        debug!("Failover monitor received stop signal");
                        break;
                    }
                }
            }
        });
        *task = Some((handle, shutdown));

        info!(
            interval_ms = period.as_millis() as u64,
            policy = ?policy,
            "Failover monitor started"
        );
        true
    }

    /// Signal the loop and wait up to the stop timeout; an unresponsive loop is
    /// aborted. Returns `false` if the monitor was not running.
    pub async fn stop(&self) -> bool {
        let task = self.task.lock().take();
        let Some((mut handle, shutdown)) = task else {
            return false;
        };
        shutdown.notify_one();

        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(_) => info!("Failover monitor stopped"),
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Failover monitor did not stop in time; aborting"
                );
                handle.abort();
            }
        }
        true
    }
}
