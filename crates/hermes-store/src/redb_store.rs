//! Embedded on-disk repository backed by `redb`.
//!
//! ## Tables
//!
//! | Table          | Key                       | Value                 |
//! |----------------|---------------------------|-----------------------|
//! | `sessions`     | session id (string)       | `SessionData` JSON    |
//! | `logs`         | log key                   | latest entry JSON     |
//! | `log_timeline` | `(timestamp_ms, sequence)`| entry JSON            |
//! | `log_meta`     | `"last_sequence"`         | highest sequence      |
//!
//! `logs` is an index onto the newest entry per key; the timeline holds
//! every entry ever written.
//!
//! Every write commits its own transaction, so a crash never leaves a
//! half-written session record. redb calls block; they run on the tokio
//! blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_types::{GatewayError, LocalLogEntry, Result, SessionData, SessionId};
use redb::{Database, ReadableTable, TableDefinition};

use crate::{LogRepository, SessionRepository};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");
const LOG_TIMELINE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("log_timeline");
const LOG_META: TableDefinition<&str, u64> = TableDefinition::new("log_meta");
const LAST_SEQUENCE: &str = "last_sequence";

/// Durable repository in a single redb file.
#[derive(Clone)]
pub struct RedbRepository {
    db: Arc<Database>,
}

impl RedbRepository {
    /// Open (or create) the database at `path` and make sure all tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        {
            txn.open_table(SESSIONS).map_err(storage)?;
            txn.open_table(LOGS).map_err(storage)?;
            txn.open_table(LOG_TIMELINE).map_err(storage)?;
            txn.open_table(LOG_META).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| GatewayError::Internal(format!("storage task panicked: {e}")))?
    }
}

fn storage(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(err.to_string())
}

fn timeline_ms(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

#[async_trait]
impl SessionRepository for RedbRepository {
    async fn get(&self, id: &SessionId) -> Result<Option<SessionData>> {
        let key = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(SESSIONS).map_err(storage)?;
            let raw = table.get(key.as_str()).map_err(storage)?;
            raw.map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(GatewayError::from)
        })
        .await
    }

    async fn set(&self, session: &SessionData) -> Result<()> {
        let key = session.id.to_string();
        let bytes = serde_json::to_vec(session)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(storage)?;
            {
                let mut table = txn.open_table(SESSIONS).map_err(storage)?;
                table.insert(key.as_str(), bytes.as_slice()).map_err(storage)?;
            }
            txn.commit().map_err(storage)
        })
        .await
    }

    async fn list_ids(&self) -> Result<Vec<SessionId>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(SESSIONS).map_err(storage)?;
            let mut ids = Vec::new();
            for row in table.iter().map_err(storage)? {
                let (key, _) = row.map_err(storage)?;
                ids.push(key.value().parse()?);
            }
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl LogRepository for RedbRepository {
    async fn create(&self, entry: &LocalLogEntry) -> Result<()> {
        let key = entry.key.clone();
        let position = (timeline_ms(entry.timestamp), entry.sequence);
        let sequence = entry.sequence;
        let bytes = serde_json::to_vec(entry)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(storage)?;
            {
                let mut meta = txn.open_table(LOG_META).map_err(storage)?;
                let last = meta.get(LAST_SEQUENCE).map_err(storage)?.map(|guard| guard.value());
                if let Some(last) = last.filter(|last| sequence <= *last) {
                    return Err(GatewayError::Storage(format!(
                        "audit sequence {sequence} is not after {last}"
                    )));
                }
                meta.insert(LAST_SEQUENCE, sequence).map_err(storage)?;
                let mut logs = txn.open_table(LOGS).map_err(storage)?;
                logs.insert(key.as_str(), bytes.as_slice()).map_err(storage)?;
                let mut timeline = txn.open_table(LOG_TIMELINE).map_err(storage)?;
                timeline.insert(position, bytes.as_slice()).map_err(storage)?;
            }
            txn.commit().map_err(storage)
        })
        .await
    }

    async fn last_sequence(&self) -> Result<Option<u64>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(LOG_META).map_err(storage)?;
            Ok(table.get(LAST_SEQUENCE).map_err(storage)?.map(|guard| guard.value()))
        })
        .await
    }

    async fn read_by_key(&self, key: &str) -> Result<Option<LocalLogEntry>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(LOGS).map_err(storage)?;
            let raw = table.get(key.as_str()).map_err(storage)?;
            raw.map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(GatewayError::from)
        })
        .await
    }

    async fn read_by_time_interval(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LocalLogEntry>> {
        let (lo, hi) = ((timeline_ms(from), 0), (timeline_ms(to), u64::MAX));
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(LOG_TIMELINE).map_err(storage)?;
            let mut out = Vec::new();
            for row in table.range(lo..=hi).map_err(storage)? {
                let (_, raw) = row.map_err(storage)?;
                let entry: LocalLogEntry = serde_json::from_slice(raw.value())?;
                if entry.timestamp >= from && entry.timestamp <= to {
                    out.push(entry);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn read_last_for_session(&self, id: &SessionId) -> Result<Option<LocalLogEntry>> {
        let id = *id;
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(LOG_TIMELINE).map_err(storage)?;
            for row in table.iter().map_err(storage)?.rev() {
                let (_, raw) = row.map_err(storage)?;
                let entry: LocalLogEntry = serde_json::from_slice(raw.value())?;
                if entry.session_id == id {
                    return Ok(Some(entry));
                }
            }
            Ok(None)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_types::{GatewayId, GatewayRole, LogStatus, RetryPolicy, RollbackAction, SessionState, log_key};

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.redb");

        let mut s = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        s.state = SessionState::Locked;
        s.record_action(RollbackAction::Lock, "lock-A1-ok");
        {
            let repo = RedbRepository::open(&path).unwrap();
            repo.set(&s).await.unwrap();
        }

        let repo = RedbRepository::open(&path).unwrap();
        let back = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(back, s);
        assert_eq!(back.rollback_proofs(), &["lock-A1-ok".to_string()]);
        assert_eq!(repo.list_ids().await.unwrap(), vec![s.id]);
    }

    #[tokio::test]
    async fn timeline_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("logs.redb")).unwrap();
        let id = SessionId::new();
        let t0 = Utc::now();
        for (i, status) in [LogStatus::Init, LogStatus::Proof, LogStatus::Done].into_iter().enumerate() {
            let entry = LocalLogEntry {
                key: log_key(&id, "lock-assertion", status),
                session_id: id,
                phase: "lock-assertion".into(),
                status,
                operation: "LOCK".into(),
                data: String::new(),
                timestamp: t0 + chrono::Duration::seconds(i64::try_from(i).unwrap() * 5),
                sequence: i as u64,
                signer_pubkey: GatewayId([3; 32]),
                signature: String::new(),
            };
            repo.create(&entry).await.unwrap();
        }

        let all = repo
            .read_by_time_interval(t0, t0 + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(all.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);

        let first = repo.read_by_time_interval(t0, t0 + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(first.len(), 1);

        let last = repo.read_last_for_session(&id).await.unwrap().unwrap();
        assert_eq!(last.status, LogStatus::Done);
        assert!(repo.read_last_for_session(&SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_sequence_is_refused_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.redb");
        let id = SessionId::new();
        let at = Utc::now();
        let entry = |sequence: u64| LocalLogEntry {
            key: log_key(&id, "commit", LogStatus::Proof),
            session_id: id,
            phase: "commit".into(),
            status: LogStatus::Proof,
            operation: "CREATE".into(),
            data: format!("proof-{sequence}"),
            timestamp: at,
            sequence,
            signer_pubkey: GatewayId([3; 32]),
            signature: String::new(),
        };
        {
            let repo = RedbRepository::open(&path).unwrap();
            assert_eq!(repo.last_sequence().await.unwrap(), None);
            repo.create(&entry(0)).await.unwrap();
            repo.create(&entry(1)).await.unwrap();
        }

        let repo = RedbRepository::open(&path).unwrap();
        assert_eq!(repo.last_sequence().await.unwrap(), Some(1));
        assert!(matches!(repo.create(&entry(0)).await, Err(GatewayError::Storage(_))));

        let kept = repo.read_by_time_interval(at, at).await.unwrap();
        assert_eq!(kept.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(), vec!["proof-0", "proof-1"]);
    }
}
