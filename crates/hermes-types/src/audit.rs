//! Audit-log records.
//!
//! Every phase transition produces a signed [`LocalLogEntry`]. Optionally a
//! compact [`RemoteLogEntry`] (key, content hash, signature, signer) is
//! mirrored to a tamper-evident store so a third party can later check that
//! the local log was not rewritten.

use std::fmt;

use chrono::{DateTime, Utc};
use hermes_crypto::GatewayKeyPair;
use serde::{Deserialize, Serialize};

use crate::{GatewayError, GatewayId, Result, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Operation started.
    Init,
    /// Operation finished successfully.
    Done,
    /// Operation failed.
    Failed,
    /// A ledger proof was captured.
    Proof,
    /// A compensating ledger proof was captured during rollback.
    #[serde(rename = "proof-rollback")]
    ProofRollback,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Proof => write!(f, "proof"),
            Self::ProofRollback => write!(f, "proof-rollback"),
        }
    }
}

/// Deterministic retrieval key: `{session}-{phase}-{status}`.
#[must_use]
pub fn log_key(session_id: &SessionId, phase: &str, status: LogStatus) -> String {
    format!("{session_id}-{phase}-{status}")
}

/// One signed entry in the local audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalLogEntry {
    pub key: String,
    pub session_id: SessionId,
    pub phase: String,
    pub status: LogStatus,
    /// What happened (message type or ledger call).
    pub operation: String,
    /// Serialized session snapshot or ledger proof.
    pub data: String,
    pub timestamp: DateTime<Utc>,
    /// Gateway-wide monotonic counter.
    pub sequence: u64,
    pub signer_pubkey: GatewayId,
    pub signature: String,
}

impl LocalLogEntry {
    /// Digest of the signed entry; the value mirrored remotely.
    pub fn content_hash(&self) -> Result<String> {
        hermes_crypto::hash_object(self).map_err(GatewayError::from)
    }

    pub fn sign(mut self, key: &GatewayKeyPair) -> Result<Self> {
        self.signature = String::new();
        self.signature = key.sign_object(&self)?;
        Ok(self)
    }

    #[must_use]
    pub fn verify(&self) -> bool {
        hermes_crypto::verify_object(&self.signer_pubkey.to_hex(), self, &self.signature)
    }
}

/// The tuple mirrored to the remote log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLogEntry {
    pub key: String,
    pub content_hash: String,
    /// Signature over the bytes of `content_hash`.
    pub signature: String,
    pub signer_pubkey: GatewayId,
}

impl RemoteLogEntry {
    pub fn from_local(entry: &LocalLogEntry, key: &GatewayKeyPair) -> Result<Self> {
        let content_hash = entry.content_hash()?;
        let signature = hermes_crypto::to_hex(&key.sign_bytes(content_hash.as_bytes()));
        Ok(Self {
            key: entry.key.clone(),
            content_hash,
            signature,
            signer_pubkey: GatewayId(key.public_key()),
        })
    }

    /// Check the mirrored signature against its declared signer.
    #[must_use]
    pub fn verify(&self) -> bool {
        let Ok(sig) = hermes_crypto::from_hex(&self.signature) else {
            return false;
        };
        hermes_crypto::verify_bytes(self.signer_pubkey.as_bytes(), self.content_hash.as_bytes(), &sig)
    }

    /// Does `entry` still hash to the mirrored value?
    #[must_use]
    pub fn matches(&self, entry: &LocalLogEntry) -> bool {
        entry.key == self.key && entry.content_hash().is_ok_and(|h| h == self.content_hash)
    }
}
