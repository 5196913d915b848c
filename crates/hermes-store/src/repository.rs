//! Persistence capabilities.
//!
//! Any durable key-value store satisfying these two traits can back a
//! gateway. Implementations must be safe to share across tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_types::{LocalLogEntry, Result, SessionData, SessionId};

/// Keyed session records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get(&self, id: &SessionId) -> Result<Option<SessionData>>;

    /// Insert or replace the record stored under `session.id`.
    async fn set(&self, session: &SessionData) -> Result<()>;

    async fn list_ids(&self) -> Result<Vec<SessionId>>;
}

/// Append-only audit entries.
///
/// Several entries may share a key; none is ever replaced. `create` refuses
/// an entry whose sequence is not above every sequence already stored.
#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn create(&self, entry: &LocalLogEntry) -> Result<()>;

    /// Highest sequence stored so far.
    async fn last_sequence(&self) -> Result<Option<u64>>;

    /// Latest entry written under `key`.
    async fn read_by_key(&self, key: &str) -> Result<Option<LocalLogEntry>>;

    /// Entries with `from <= timestamp <= to`, oldest first.
    async fn read_by_time_interval(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LocalLogEntry>>;

    /// Newest entry recorded for `id`.
    async fn read_last_for_session(&self, id: &SessionId) -> Result<Option<LocalLogEntry>>;
}
