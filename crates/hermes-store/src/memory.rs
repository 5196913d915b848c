//! In-process repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_types::{GatewayError, LocalLogEntry, Result, SessionData, SessionId};
use parking_lot::RwLock;

use crate::{LogRepository, SessionRepository};

/// Volatile repository for tests and gateways that need no durability.
#[derive(Default)]
pub struct MemoryRepository {
    sessions: RwLock<HashMap<SessionId, SessionData>>,
    logs: RwLock<Vec<LocalLogEntry>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn get(&self, id: &SessionId) -> Result<Option<SessionData>> {
        Ok(self.sessions.read().get(id).cloned())
    }

    async fn set(&self, session: &SessionData) -> Result<()> {
        self.sessions.write().insert(session.id, session.clone());
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl LogRepository for MemoryRepository {
    async fn create(&self, entry: &LocalLogEntry) -> Result<()> {
        let mut logs = self.logs.write();
        if let Some(last) = logs.last().map(|e| e.sequence).filter(|last| entry.sequence <= *last) {
            return Err(GatewayError::Storage(format!(
                "audit sequence {} is not after {last}",
                entry.sequence
            )));
        }
        logs.push(entry.clone());
        Ok(())
    }

    async fn last_sequence(&self) -> Result<Option<u64>> {
        Ok(self.logs.read().last().map(|e| e.sequence))
    }

    async fn read_by_key(&self, key: &str) -> Result<Option<LocalLogEntry>> {
        Ok(self.logs.read().iter().rev().find(|e| e.key == key).cloned())
    }

    async fn read_by_time_interval(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LocalLogEntry>> {
        let mut out: Vec<LocalLogEntry> = self
            .logs
            .read()
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.timestamp, e.sequence));
        Ok(out)
    }

    async fn read_last_for_session(&self, id: &SessionId) -> Result<Option<LocalLogEntry>> {
        Ok(self.logs.read().iter().rev().find(|e| e.session_id == *id).cloned())
    }
}
