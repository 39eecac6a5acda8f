//! Scoped primary-store sessions.
//!
//! A [`ScopedSession`] is closed explicitly on the normal path. If it is dropped
//! while still open (the attempt timed out, the caller's future was cancelled,
//! or a panic unwound through it) the close runs on a spawned task instead.

use tracing::debug;

use crate::error::StoreError;
use crate::store::{GraphSession, GraphStore, Row, Statement};

pub struct ScopedSession {
    session: Option<Box<dyn GraphSession>>,
}

impl ScopedSession {
    pub async fn acquire(store: &dyn GraphStore) -> Result<Self, StoreError> {
        let session = store.session().await?;
        Ok(Self {
            session: Some(session),
        })
    }

    pub async fn run(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        match self.session.as_mut() {
            Some(session) => session.run(statement).await,
            None => Err(StoreError::fatal("session already released")),
        }
    }

    /// Run statements in order, returning the rows of the last one
    pub async fn run_all(&mut self, statements: &[Statement]) -> Result<Vec<Row>, StoreError> {
        let mut rows = Vec::new();
        for statement in statements {
            rows = self.run(statement).await?;
        }
        Ok(rows)
    }

    pub async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Session close reported an error");
            }
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = session.close().await {
                            debug!(error = %e, "Deferred session close reported an error");
                        }
                    });
                }
                Err(_) => debug!("No runtime available; session dropped without close"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_explicit_close_releases_session() {
        let store = MemoryGraphStore::new();
        let mut session = ScopedSession::acquire(&store).await.unwrap();
        session.run(&Statement::Ping).await.unwrap();
        assert_eq!(store.open_sessions(), 1);
        session.close().await;
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_closed_on_drop() {
        let store = MemoryGraphStore::new();
        store.set_latency(Some(Duration::from_secs(5)));

        let attempt = async {
            let mut session = ScopedSession::acquire(&store).await?;
            let rows = session.run(&Statement::Ping).await;
            session.close().await;
            rows
        };
        let result = tokio::time::timeout(Duration::from_millis(20), attempt).await;
        assert!(result.is_err());

        // the deferred close runs on the runtime
        for _ in 0..50 {
            if store.open_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.open_sessions(), 0);
    }
}
