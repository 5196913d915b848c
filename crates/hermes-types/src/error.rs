//! Error types for the Hermes gateway.
//!
//! All errors use the `HG_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Message validation
//! - 2xx: Signatures
//! - 3xx: Ledger operations
//! - 4xx: Message delivery
//! - 5xx: Session state
//! - 6xx: Persistence
//! - 7xx: Audit logging
//! - 9xx: General / internal

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DltSystem, SessionId, SessionState};

/// The server-side check that rejected a message, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationCheck {
    MessageType,
    SequenceNumber,
    PreviousHash,
    PublicKeys,
    Payload,
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageType => write!(f, "message-type"),
            Self::SequenceNumber => write!(f, "sequence-number"),
            Self::PreviousHash => write!(f, "previous-hash"),
            Self::PublicKeys => write!(f, "public-keys"),
            Self::Payload => write!(f, "payload"),
        }
    }
}

/// Ledger adapter call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerCall {
    Lock,
    Unlock,
    Create,
    Delete,
    Exists,
    IsLocked,
}

impl fmt::Display for LedgerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "lock"),
            Self::Unlock => write!(f, "unlock"),
            Self::Create => write!(f, "create"),
            Self::Delete => write!(f, "delete"),
            Self::Exists => write!(f, "exists"),
            Self::IsLocked => write!(f, "is-locked"),
        }
    }
}

/// Coarse error taxonomy surfaced to operators and recorded on sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    SignatureVerification,
    LedgerOperation,
    MessageDelivery,
    SessionState,
    Persistence,
    Audit,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "ValidationError"),
            Self::SignatureVerification => write!(f, "SignatureVerificationError"),
            Self::LedgerOperation => write!(f, "LedgerOperationError"),
            Self::MessageDelivery => write!(f, "MessageDeliveryError"),
            Self::SessionState => write!(f, "SessionStateError"),
            Self::Persistence => write!(f, "PersistenceError"),
            Self::Audit => write!(f, "AuditError"),
            Self::Internal => write!(f, "InternalError"),
        }
    }
}

/// Central error enum for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// A received message failed one of the ordered server-side checks.
    #[error("HG_ERR_100: Validation failed at {check}: {reason}")]
    Validation { check: ValidationCheck, reason: String },

    /// The body could not be decoded into a protocol message.
    #[error("HG_ERR_101: Malformed message: {0}")]
    MalformedMessage(String),

    // =================================================================
    // Signature Errors (2xx)
    // =================================================================
    /// The sender's signature did not verify against its declared key.
    #[error("HG_ERR_200: Signature verification failed for {message_type} from {signer}")]
    SignatureVerification { message_type: String, signer: String },

    // =================================================================
    // Ledger Errors (3xx)
    // =================================================================
    /// A ledger adapter call failed.
    #[error("HG_ERR_300: Ledger {operation} failed for asset {asset_id}: {reason}")]
    Ledger {
        operation: LedgerCall,
        asset_id: String,
        reason: String,
    },

    /// No adapter is registered for the requested ledger.
    #[error("HG_ERR_301: No ledger adapter registered for {0}")]
    LedgerNotRegistered(DltSystem),

    // =================================================================
    // Delivery Errors (4xx)
    // =================================================================
    /// The counterpart could not be reached.
    #[error("HG_ERR_400: Delivery to {target} failed: {reason}")]
    DeliveryFailed { target: String, reason: String },

    /// A single delivery attempt exceeded the session's `max_timeout`.
    #[error("HG_ERR_401: Delivery to {target} timed out after {timeout_ms}ms")]
    DeliveryTimeout { target: String, timeout_ms: u64 },

    /// The counterpart answered with a non-success status.
    #[error("HG_ERR_402: Counterpart rejected message with status {status}: {reason}")]
    CounterpartRejected { status: u16, reason: String },

    /// Every attempt allowed by the retry policy failed.
    #[error("HG_ERR_403: Delivery gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    // =================================================================
    // Session State Errors (5xx)
    // =================================================================
    /// A field required by the current operation has not been set yet.
    #[error("HG_ERR_500: Session not initialized: missing {field}")]
    SessionNotInitialized { field: &'static str },

    #[error("HG_ERR_501: Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("HG_ERR_502: Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// A write-once session field was set to a different value.
    #[error("HG_ERR_503: Immutable session field changed: {field}")]
    ImmutableField { field: &'static str },

    /// The operation is not valid for this session's role.
    #[error("HG_ERR_504: Wrong role for operation: {reason}")]
    WrongRole { reason: String },

    /// The two gateways' views of a session can no longer be reconciled.
    #[error("HG_ERR_505: Session diverged from counterpart: {reason}")]
    Diverged { reason: String },

    // =================================================================
    // Persistence Errors (6xx)
    // =================================================================
    #[error("HG_ERR_600: Storage error: {0}")]
    Storage(String),

    // =================================================================
    // Audit Errors (7xx)
    // =================================================================
    #[error("HG_ERR_700: Audit log error: {0}")]
    Audit(String),

    /// The remote log store answered with a non-2xx status.
    #[error("HG_ERR_701: Remote log rejected entry {key} with status {status}")]
    RemoteLogRejected { key: String, status: u16 },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    #[error("HG_ERR_900: Internal error: {0}")]
    Internal(String),

    #[error("HG_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Invalid gateway configuration.
    #[error("HG_ERR_902: Configuration error: {0}")]
    Configuration(String),

    #[error("HG_ERR_903: Crypto error: {0}")]
    Crypto(String),
}

impl GatewayError {
    /// Map onto the operator-facing taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::MalformedMessage(_) => ErrorKind::Validation,
            Self::SignatureVerification { .. } => ErrorKind::SignatureVerification,
            Self::Ledger { .. } | Self::LedgerNotRegistered(_) => ErrorKind::LedgerOperation,
            Self::DeliveryFailed { .. }
            | Self::DeliveryTimeout { .. }
            | Self::CounterpartRejected { .. }
            | Self::RetriesExhausted { .. } => ErrorKind::MessageDelivery,
            Self::SessionNotInitialized { .. }
            | Self::SessionNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::ImmutableField { .. }
            | Self::WrongRole { .. }
            | Self::Diverged { .. } => ErrorKind::SessionState,
            Self::Storage(_) => ErrorKind::Persistence,
            Self::Audit(_) | Self::RemoteLogRejected { .. } => ErrorKind::Audit,
            Self::Internal(_) | Self::Serialization(_) | Self::Configuration(_) | Self::Crypto(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Transport failures worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeliveryFailed { .. } | Self::DeliveryTimeout { .. } => true,
            Self::CounterpartRejected { status, .. } => *status == 503,
            _ => false,
        }
    }

    /// Status a server-role gateway answers with when this error rejects a request.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SessionNotFound(_) => 404,
            Self::CounterpartRejected { status, .. } => *status,
            _ => match self.kind() {
                ErrorKind::Validation => 400,
                ErrorKind::SignatureVerification => 401,
                ErrorKind::SessionState => 409,
                ErrorKind::LedgerOperation => 502,
                ErrorKind::MessageDelivery => 504,
                ErrorKind::Persistence | ErrorKind::Audit | ErrorKind::Internal => 500,
            },
        }
    }

    /// Shorthand for a payload-check validation failure.
    pub fn payload(reason: impl Into<String>) -> Self {
        Self::Validation {
            check: ValidationCheck::Payload,
            reason: reason.into(),
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<hermes_crypto::CryptoError> for GatewayError {
    fn from(err: hermes_crypto::CryptoError) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_prefix_display() {
        let err = GatewayError::Validation {
            check: ValidationCheck::Payload,
            reason: "asset has expired".into(),
        };
        assert_eq!(
            err.to_string(),
            "HG_ERR_100: Validation failed at payload: asset has expired"
        );
        assert!(GatewayError::Internal("x".into()).to_string().starts_with("HG_ERR_900"));
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(GatewayError::MalformedMessage("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(
            GatewayError::SessionNotInitialized { field: "asset_profile" }.kind(),
            ErrorKind::SessionState
        );
        assert_eq!(
            GatewayError::DeliveryTimeout { target: "t".into(), timeout_ms: 1 }.kind(),
            ErrorKind::MessageDelivery
        );
        assert_eq!(ErrorKind::LedgerOperation.to_string(), "LedgerOperationError");
    }

    #[test]
    fn only_transport_failures_retry() {
        assert!(GatewayError::DeliveryFailed { target: "t".into(), reason: "r".into() }.is_retryable());
        assert!(!GatewayError::CounterpartRejected { status: 400, reason: "r".into() }.is_retryable());
        assert!(GatewayError::CounterpartRejected { status: 503, reason: "r".into() }.is_retryable());
        assert!(!GatewayError::payload("bad").is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(GatewayError::payload("bad").http_status(), 400);
        assert_eq!(
            GatewayError::SignatureVerification { message_type: "m".into(), signer: "s".into() }.http_status(),
            401
        );
        assert_eq!(GatewayError::SessionNotFound(SessionId::new()).http_status(), 404);
        assert_eq!(GatewayError::Storage("disk".into()).http_status(), 500);
    }
}
