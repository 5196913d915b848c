//! Signed audit logging.
//!
//! One entry per phase transition. The local write always happens first;
//! the remote mirror is attempted afterwards and a rejection fails the
//! call. Callers on the protocol path report audit failures and carry on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_crypto::GatewayKeyPair;
use hermes_types::{
    GatewayError, GatewayId, LocalLogEntry, LogStatus, RemoteLogEntry, Result, SessionData, SessionId, log_key,
};
use tokio::sync::Mutex;
use tracing::{Instrument, Span, debug, warn};

use crate::LogRepository;

/// Remote tamper-evident store for `{key, hash, signature, signer}` tuples.
#[async_trait]
pub trait RemoteLogSink: Send + Sync {
    async fn publish(&self, entry: &RemoteLogEntry) -> Result<()>;
}

/// Mirrors entries with `POST <url>` as JSON. Any non-2xx status is an error.
pub struct HttpRemoteLog {
    client: reqwest::Client,
    url: String,
}

impl HttpRemoteLog {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl RemoteLogSink for HttpRemoteLog {
    async fn publish(&self, entry: &RemoteLogEntry) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(entry)
            .send()
            .await
            .map_err(|e| GatewayError::Audit(format!("remote log unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::RemoteLogRejected {
                key: entry.key.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Appends signed entries for one gateway.
///
/// The sequence counter resumes from the repository on first use, so a
/// reopened store keeps counting where it stopped.
pub struct AuditLogger {
    repo: Arc<dyn LogRepository>,
    key: Arc<GatewayKeyPair>,
    remote: Option<Arc<dyn RemoteLogSink>>,
    next_sequence: Mutex<Option<u64>>,
    span: Span,
}

impl AuditLogger {
    #[must_use]
    pub fn new(
        repo: Arc<dyn LogRepository>,
        key: Arc<GatewayKeyPair>,
        remote: Option<Arc<dyn RemoteLogSink>>,
        span: Span,
    ) -> Self {
        Self {
            repo,
            key,
            remote,
            next_sequence: Mutex::new(None),
            span,
        }
    }

    /// Record a phase transition with a snapshot of the session.
    pub async fn log_transition(
        &self,
        session: &SessionData,
        phase: &str,
        status: LogStatus,
        operation: &str,
    ) -> Result<LocalLogEntry> {
        let data = serde_json::to_string(session)?;
        self.append(session.id, phase, status, operation, data).await
    }

    /// Record a ledger proof as its own entry.
    pub async fn log_proof(
        &self,
        session_id: SessionId,
        phase: &str,
        operation: &str,
        proof: &str,
    ) -> Result<LocalLogEntry> {
        self.append(session_id, phase, LogStatus::Proof, operation, proof.to_string())
            .await
    }

    /// Record the proof of a compensating ledger call.
    pub async fn log_compensation(
        &self,
        session_id: SessionId,
        phase: &str,
        operation: &str,
        proof: &str,
    ) -> Result<LocalLogEntry> {
        self.append(session_id, phase, LogStatus::ProofRollback, operation, proof.to_string())
            .await
    }

    pub async fn read_by_key(&self, key: &str) -> Result<Option<LocalLogEntry>> {
        self.repo.read_by_key(key).await
    }

    pub async fn read_by_time_interval(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LocalLogEntry>> {
        self.repo.read_by_time_interval(from, to).await
    }

    pub async fn read_last_for_session(&self, id: &SessionId) -> Result<Option<LocalLogEntry>> {
        self.repo.read_last_for_session(id).await
    }

    /// Entries for `id` written strictly after `after` (all of them when
    /// `None`), in sequence order.
    pub async fn read_session_since(&self, id: &SessionId, after: Option<DateTime<Utc>>) -> Result<Vec<LocalLogEntry>> {
        let from = after.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut entries: Vec<LocalLogEntry> = self
            .repo
            .read_by_time_interval(from, Utc::now())
            .await?
            .into_iter()
            .filter(|e| e.session_id == *id && after.is_none_or(|at| e.timestamp > at))
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn append(
        &self,
        session_id: SessionId,
        phase: &str,
        status: LogStatus,
        operation: &str,
        data: String,
    ) -> Result<LocalLogEntry> {
        let entry = {
            let mut next = self.next_sequence.lock().await;
            let sequence = match *next {
                Some(sequence) => sequence,
                None => self.repo.last_sequence().await?.map_or(0, |last| last + 1),
            };
            let entry = LocalLogEntry {
                key: log_key(&session_id, phase, status),
                session_id,
                phase: phase.to_string(),
                status,
                operation: operation.to_string(),
                data,
                timestamp: Utc::now(),
                sequence,
                signer_pubkey: GatewayId(self.key.public_key()),
                signature: String::new(),
            }
            .sign(&self.key)?;
            self.repo.create(&entry).instrument(self.span.clone()).await?;
            *next = Some(sequence + 1);
            entry
        };
        debug!(parent: &self.span, key = %entry.key, seq = entry.sequence, "Audit entry written");

        if let Some(remote) = &self.remote {
            let mirrored = RemoteLogEntry::from_local(&entry, &self.key)?;
            if let Err(err) = remote.publish(&mirrored).instrument(self.span.clone()).await {
                warn!(parent: &self.span, key = %entry.key, error = %err, "Remote audit mirror failed");
                return Err(err);
            }
        }
        Ok(entry)
    }
}

/// Remote sink that keeps entries in memory and can be told to reject.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Default)]
pub struct MemoryRemoteLog {
    entries: parking_lot::Mutex<Vec<RemoteLogEntry>>,
    reject_with: parking_lot::Mutex<Option<u16>>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl MemoryRemoteLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every publish with `status` (`None` to accept again).
    pub fn reject_with(&self, status: Option<u16>) {
        *self.reject_with.lock() = status;
    }

    #[must_use]
    pub fn entries(&self) -> Vec<RemoteLogEntry> {
        self.entries.lock().clone()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl RemoteLogSink for MemoryRemoteLog {
    async fn publish(&self, entry: &RemoteLogEntry) -> Result<()> {
        if let Some(status) = *self.reject_with.lock() {
            return Err(GatewayError::RemoteLogRejected {
                key: entry.key.clone(),
                status,
            });
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepository;
    use hermes_types::{GatewayRole, RetryPolicy};

    fn logger(remote: Option<Arc<MemoryRemoteLog>>) -> (AuditLogger, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        let remote = remote.map(|r| r as Arc<dyn RemoteLogSink>);
        let logger = AuditLogger::new(repo.clone(), Arc::new(GatewayKeyPair::generate()), remote, Span::none());
        (logger, repo)
    }

    #[tokio::test]
    async fn entries_are_signed_and_sequenced() {
        let (logger, _) = logger(None);
        let s = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        let a = logger.log_transition(&s, "initialization", LogStatus::Init, "INITIALIZATION_REQUEST").await.unwrap();
        let b = logger.log_transition(&s, "initialization", LogStatus::Done, "INITIALIZATION_RESPONSE").await.unwrap();
        assert!(a.verify());
        assert_eq!(b.sequence, a.sequence + 1);
        assert_eq!(a.key, format!("{}-initialization-init", s.id));

        let snapshot: SessionData = serde_json::from_str(&a.data).unwrap();
        assert_eq!(snapshot.id, s.id);
        assert_eq!(logger.read_by_key(&b.key).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn remote_mirror_matches_local() {
        let remote = Arc::new(MemoryRemoteLog::new());
        let (logger, _) = logger(Some(remote.clone()));
        let entry = logger.log_proof(SessionId::new(), "lock-assertion", "LOCK", "lock-A1-ok").await.unwrap();
        let mirrored = remote.entries();
        assert_eq!(mirrored.len(), 1);
        assert!(mirrored[0].verify());
        assert!(mirrored[0].matches(&entry));
    }

    #[tokio::test]
    async fn remote_rejection_fails_loudly_after_local_write() {
        let remote = Arc::new(MemoryRemoteLog::new());
        remote.reject_with(Some(500));
        let (logger, repo) = logger(Some(remote));
        let err = logger.log_proof(SessionId::new(), "commit", "CREATE", "p").await.unwrap_err();
        assert!(matches!(err, GatewayError::RemoteLogRejected { status: 500, .. }));
        assert_eq!(repo.log_count(), 1);
    }

    #[tokio::test]
    async fn session_entries_since_a_timestamp() {
        let (logger, _) = logger(None);
        let s = SessionData::new(SessionId::new(), GatewayRole::Server, RetryPolicy::default());
        let other = SessionId::new();
        let first = logger.log_transition(&s, "commence", LogStatus::Done, "COMMENCE_RESPONSE").await.unwrap();
        logger.log_proof(other, "commit", "CREATE", "elsewhere").await.unwrap();
        let second = logger.log_proof(s.id, "commit", "CREATE", "create-1").await.unwrap();

        let all = logger.read_session_since(&s.id, None).await.unwrap();
        assert_eq!(all, vec![first.clone(), second.clone()]);
        let later = logger.read_session_since(&s.id, Some(first.timestamp)).await.unwrap();
        assert!(later.iter().all(|e| e.timestamp > first.timestamp));
        assert!(later.len() <= 1);
    }

    #[tokio::test]
    async fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.redb");
        let key = Arc::new(GatewayKeyPair::generate());
        let s = SessionData::new(SessionId::new(), GatewayRole::Server, RetryPolicy::default());

        let first = {
            let repo = Arc::new(crate::RedbRepository::open(&path).unwrap());
            let logger = AuditLogger::new(repo, key.clone(), None, Span::none());
            logger.log_proof(s.id, "commit", "CREATE", "create-1").await.unwrap();
            logger.log_proof(s.id, "commit", "CREATE", "create-2").await.unwrap()
        };

        let repo = Arc::new(crate::RedbRepository::open(&path).unwrap());
        let logger = AuditLogger::new(repo, key, None, Span::none());
        let after = logger.log_transition(&s, "commit", LogStatus::Done, "COMMIT_RESPONSE").await.unwrap();
        assert_eq!(after.sequence, first.sequence + 1);

        let all = logger
            .read_by_time_interval(first.timestamp - chrono::Duration::seconds(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }
}
