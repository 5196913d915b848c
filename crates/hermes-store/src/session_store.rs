//! Session store with per-session serialisation.
//!
//! The store is the only shared mutable resource in a gateway. Callers take
//! a [`SessionGuard`] for a session id before a read-modify-write cycle;
//! guards for different ids never contend.

use std::collections::HashMap;
use std::sync::Arc;

use hermes_types::{GatewayError, Result, SessionData, SessionId};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{Instrument, Span, debug};

use crate::SessionRepository;

/// Exclusive right to mutate one session. Released on drop.
pub type SessionGuard = OwnedMutexGuard<()>;

pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    span: Span,
}

impl SessionStore {
    #[must_use]
    pub fn new(repo: Arc<dyn SessionRepository>, span: Span) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
            span,
        }
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: SessionId) -> SessionGuard {
        let slot = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(id).or_default())
        };
        slot.lock_owned().await
    }

    /// Load a session, failing if it does not exist.
    pub async fn get(&self, id: &SessionId) -> Result<SessionData> {
        self.find(id).await?.ok_or(GatewayError::SessionNotFound(*id))
    }

    pub async fn find(&self, id: &SessionId) -> Result<Option<SessionData>> {
        self.repo.get(id).instrument(self.span.clone()).await
    }

    /// Persist `session`, stamping its update time.
    pub async fn save(&self, session: &mut SessionData) -> Result<()> {
        session.touch();
        self.repo.set(session).instrument(self.span.clone()).await?;
        debug!(
            parent: &self.span,
            session = %session.id,
            state = %session.state,
            step = session.step,
            seq = session.last_sequence_number,
            "Session persisted"
        );
        Ok(())
    }

    pub async fn list_ids(&self) -> Result<Vec<SessionId>> {
        self.repo.list_ids().instrument(self.span.clone()).await
    }

    /// Every session that has not reached a terminal state.
    pub async fn open_sessions(&self) -> Result<Vec<SessionData>> {
        let mut open = Vec::new();
        for id in self.list_ids().await? {
            if let Some(session) = self.find(&id).await? {
                if !session.is_terminal() {
                    open.push(session);
                }
            }
        }
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::MemoryRepository;
    use hermes_types::{GatewayRole, RetryPolicy, SessionState};

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Arc::new(MemoryRepository::new()), Span::none()))
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = store();
        let id = SessionId::new();
        assert!(matches!(store.get(&id).await.unwrap_err(), GatewayError::SessionNotFound(x) if x == id));
    }

    #[tokio::test]
    async fn open_sessions_skip_terminal() {
        let store = store();
        let mut live = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        let mut done = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        done.state = SessionState::Committed;
        store.save(&mut live).await.unwrap();
        store.save(&mut done).await.unwrap();

        let open = store.open_sessions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, live.id);
    }

    #[tokio::test]
    async fn same_session_is_serialised() {
        let store = store();
        let id = SessionId::new();
        let guard = store.lock(id).await;

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _g = store.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn distinct_sessions_do_not_contend() {
        let store = store();
        let _a = store.lock(SessionId::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), store.lock(SessionId::new())).await;
        assert!(b.is_ok());
    }
}
