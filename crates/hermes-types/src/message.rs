//! Protocol messages exchanged between a client-role and a server-role
//! gateway.
//!
//! Every message travels in the same signed [`Message`] envelope. The
//! envelope's `message_type` tag names the phase and direction; the typed
//! [`Payload`] carries the phase-specific body.
//!
//! ## Phase flow
//!
//! ```text
//!  client (source ledger)                         server (recipient ledger)
//!  ──────────────────────                         ─────────────────────────
//!  INITIALIZATION_REQUEST    ───────────────────▶  validate, pin keys
//!                            ◀───────────────────  INITIALIZATION_RESPONSE
//!  COMMENCE_REQUEST          ───────────────────▶  bind identities
//!                            ◀───────────────────  COMMENCE_RESPONSE
//!  lock(source)
//!  LOCK_ASSERTION_REQUEST    ───────────────────▶  record lock claim
//!                            ◀───────────────────  LOCK_ASSERTION_RESPONSE
//!  COMMIT_REQUEST            ───────────────────▶  create(recipient)
//!                            ◀───────────────────  COMMIT_RESPONSE
//!  delete(source)
//!  TRANSFER_COMPLETE_REQUEST ───────────────────▶  mark committed
//!                            ◀───────────────────  TRANSFER_COMPLETE_RESPONSE
//! ```
//!
//! The messages above are *chained*: each carries the next sequence number
//! and the hash of the message before it. `ROLLBACK_*` and `RECOVER_*`
//! are out-of-band control messages and are not chained.
//!
//! ## Recovery exchange
//!
//! ```text
//!  recovering gateway                             counterpart
//!  RECOVER_REQUEST (last log time)  ────────────▶  collect newer log entries
//!                                   ◀────────────  RECOVER_UPDATE (snapshot, entries)
//!  replay entries into session
//!  RECOVER_SUCCESS                  ────────────▶  note recovery
//!                                   ◀────────────  RECOVER_SUCCESS_ACK
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AssetProfile, DltSystem, GatewayError, GatewayId, LocalLogEntry, Result, RetryPolicy, RollbackAction,
    SessionId, SessionState,
};

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    InitializationRequest,
    InitializationResponse,
    CommenceRequest,
    CommenceResponse,
    LockAssertionRequest,
    LockAssertionResponse,
    CommitRequest,
    CommitResponse,
    TransferCompleteRequest,
    TransferCompleteResponse,
    RollbackRequest,
    RollbackAck,
    RecoverRequest,
    RecoverUpdate,
    RecoverSuccess,
    RecoverSuccessAck,
}

impl MessageType {
    /// Phase label used in audit-log keys and HTTP routes.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::InitializationRequest | Self::InitializationResponse => "initialization",
            Self::CommenceRequest | Self::CommenceResponse => "commence",
            Self::LockAssertionRequest | Self::LockAssertionResponse => "lock-assertion",
            Self::CommitRequest | Self::CommitResponse => "commit",
            Self::TransferCompleteRequest | Self::TransferCompleteResponse => "transfer-complete",
            Self::RollbackRequest | Self::RollbackAck => "rollback",
            Self::RecoverRequest | Self::RecoverUpdate => "recover",
            Self::RecoverSuccess | Self::RecoverSuccessAck => "recover-success",
        }
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::InitializationRequest
                | Self::CommenceRequest
                | Self::LockAssertionRequest
                | Self::CommitRequest
                | Self::TransferCompleteRequest
                | Self::RollbackRequest
                | Self::RecoverRequest
                | Self::RecoverSuccess
        )
    }

    /// Does this message take part in the sequence-number / hash chain?
    #[must_use]
    pub fn is_chained(&self) -> bool {
        !matches!(
            self,
            Self::RollbackRequest
                | Self::RollbackAck
                | Self::RecoverRequest
                | Self::RecoverUpdate
                | Self::RecoverSuccess
                | Self::RecoverSuccessAck
        )
    }

    /// The response type that answers this request.
    #[must_use]
    pub fn response_type(&self) -> Option<Self> {
        match self {
            Self::InitializationRequest => Some(Self::InitializationResponse),
            Self::CommenceRequest => Some(Self::CommenceResponse),
            Self::LockAssertionRequest => Some(Self::LockAssertionResponse),
            Self::CommitRequest => Some(Self::CommitResponse),
            Self::TransferCompleteRequest => Some(Self::TransferCompleteResponse),
            Self::RollbackRequest => Some(Self::RollbackAck),
            Self::RecoverRequest => Some(Self::RecoverUpdate),
            Self::RecoverSuccess => Some(Self::RecoverSuccessAck),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InitializationRequest => "INITIALIZATION_REQUEST",
            Self::InitializationResponse => "INITIALIZATION_RESPONSE",
            Self::CommenceRequest => "COMMENCE_REQUEST",
            Self::CommenceResponse => "COMMENCE_RESPONSE",
            Self::LockAssertionRequest => "LOCK_ASSERTION_REQUEST",
            Self::LockAssertionResponse => "LOCK_ASSERTION_RESPONSE",
            Self::CommitRequest => "COMMIT_REQUEST",
            Self::CommitResponse => "COMMIT_RESPONSE",
            Self::TransferCompleteRequest => "TRANSFER_COMPLETE_REQUEST",
            Self::TransferCompleteResponse => "TRANSFER_COMPLETE_RESPONSE",
            Self::RollbackRequest => "ROLLBACK_REQUEST",
            Self::RollbackAck => "ROLLBACK_ACK",
            Self::RecoverRequest => "RECOVER_REQUEST",
            Self::RecoverUpdate => "RECOVER_UPDATE",
            Self::RecoverSuccess => "RECOVER_SUCCESS",
            Self::RecoverSuccessAck => "RECOVER_SUCCESS_ACK",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Phase bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationRequest {
    pub version: String,
    pub asset_profile: AssetProfile,
    pub source_dlt_system: DltSystem,
    pub recipient_dlt_system: DltSystem,
    pub source_base_path: String,
    pub recipient_base_path: String,
    pub source_ledger_asset_id: String,
    pub recipient_ledger_asset_id: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializationResponse {
    /// Server's digest of the accepted asset profile.
    pub asset_profile_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommenceRequest {
    pub asset_profile_hash: String,
    pub originator_pubkey: String,
    pub beneficiary_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommenceResponse {
    pub asset_profile_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAssertionRequest {
    pub asset_profile_hash: String,
    /// Proof returned by the source ledger's lock call.
    pub lock_proof: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAssertionResponse {
    /// Digest of the lock proof the server recorded.
    pub lock_proof_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub asset_profile_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    /// Proof returned by the recipient ledger's create call.
    pub create_proof: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompleteRequest {
    /// Proof returned by the source ledger's delete call.
    pub extinguish_proof: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompleteResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAck {
    pub state: SessionState,
    pub compensated: Vec<RollbackAction>,
}

/// One side's view of a session, exchanged during recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub state: SessionState,
    pub step: u32,
    pub last_sequence_number: u64,
    pub last_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub snapshot: RecoverySnapshot,
    /// Timestamp of the requester's newest audit entry for the session;
    /// `None` asks for every entry.
    pub last_log_at: Option<DateTime<Utc>>,
}

/// Counterpart's answer to a recover request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverUpdate {
    pub snapshot: RecoverySnapshot,
    /// The counterpart's signed audit entries for the session written after
    /// `last_log_at`, oldest first.
    pub recovered_logs: Vec<LocalLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverSuccess {
    pub snapshot: RecoverySnapshot,
    /// Number of counterpart messages replayed from the update.
    pub replayed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverSuccessAck {}

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    InitializationRequest(InitializationRequest),
    InitializationResponse(InitializationResponse),
    CommenceRequest(CommenceRequest),
    CommenceResponse(CommenceResponse),
    LockAssertionRequest(LockAssertionRequest),
    LockAssertionResponse(LockAssertionResponse),
    CommitRequest(CommitRequest),
    CommitResponse(CommitResponse),
    TransferCompleteRequest(TransferCompleteRequest),
    TransferCompleteResponse(TransferCompleteResponse),
    RollbackRequest(RollbackRequest),
    RollbackAck(RollbackAck),
    RecoverRequest(RecoverRequest),
    RecoverUpdate(RecoverUpdate),
    RecoverSuccess(RecoverSuccess),
    RecoverSuccessAck(RecoverSuccessAck),
}

impl Payload {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::InitializationRequest(_) => MessageType::InitializationRequest,
            Self::InitializationResponse(_) => MessageType::InitializationResponse,
            Self::CommenceRequest(_) => MessageType::CommenceRequest,
            Self::CommenceResponse(_) => MessageType::CommenceResponse,
            Self::LockAssertionRequest(_) => MessageType::LockAssertionRequest,
            Self::LockAssertionResponse(_) => MessageType::LockAssertionResponse,
            Self::CommitRequest(_) => MessageType::CommitRequest,
            Self::CommitResponse(_) => MessageType::CommitResponse,
            Self::TransferCompleteRequest(_) => MessageType::TransferCompleteRequest,
            Self::TransferCompleteResponse(_) => MessageType::TransferCompleteResponse,
            Self::RollbackRequest(_) => MessageType::RollbackRequest,
            Self::RollbackAck(_) => MessageType::RollbackAck,
            Self::RecoverRequest(_) => MessageType::RecoverRequest,
            Self::RecoverUpdate(_) => MessageType::RecoverUpdate,
            Self::RecoverSuccess(_) => MessageType::RecoverSuccess,
            Self::RecoverSuccessAck(_) => MessageType::RecoverSuccessAck,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Signed protocol message.
///
/// `source_gateway_pubkey` is always the client-role gateway and
/// `recipient_gateway_pubkey` the server-role gateway, whichever direction
/// the message travels. `signature` covers the canonical encoding of the
/// whole envelope with `signature` itself blanked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub session_id: SessionId,
    pub sequence_number: u64,
    pub hash_prev_message: Option<String>,
    pub source_gateway_pubkey: GatewayId,
    pub recipient_gateway_pubkey: GatewayId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    pub signature: String,
}

impl Message {
    /// Digest of the full signed envelope; the value recorded in hash chains.
    pub fn hash(&self) -> Result<String> {
        hermes_crypto::hash_object(self).map_err(GatewayError::from)
    }

    /// Sign with `key`, replacing any existing signature.
    pub fn sign(mut self, key: &hermes_crypto::GatewayKeyPair) -> Result<Self> {
        self.signature = String::new();
        self.signature = key.sign_object(&self)?;
        Ok(self)
    }

    /// Does `signature` verify against `signer`?
    #[must_use]
    pub fn verify_signature(&self, signer: &GatewayId) -> bool {
        hermes_crypto::verify_object(&signer.to_hex(), self, &self.signature)
    }

    /// Does the payload variant agree with the envelope tag?
    #[must_use]
    pub fn payload_matches_type(&self) -> bool {
        self.payload.message_type() == self.message_type
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| GatewayError::MalformedMessage(e.to_string()))
    }
}

macro_rules! payload_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        impl Message {
            /// Borrow the typed body, or fail with a payload validation error.
            pub fn $fn_name(&self) -> Result<&$ty> {
                match &self.payload {
                    Payload::$variant(body) => Ok(body),
                    other => Err(GatewayError::payload(format!(
                        "expected {} body, got {}",
                        MessageType::$variant,
                        other.message_type()
                    ))),
                }
            }
        }
    };
}

payload_accessor!(initialization_request, InitializationRequest, InitializationRequest);
payload_accessor!(initialization_response, InitializationResponse, InitializationResponse);
payload_accessor!(commence_request, CommenceRequest, CommenceRequest);
payload_accessor!(commence_response, CommenceResponse, CommenceResponse);
payload_accessor!(lock_assertion_request, LockAssertionRequest, LockAssertionRequest);
payload_accessor!(lock_assertion_response, LockAssertionResponse, LockAssertionResponse);
payload_accessor!(commit_request, CommitRequest, CommitRequest);
payload_accessor!(commit_response, CommitResponse, CommitResponse);
payload_accessor!(transfer_complete_request, TransferCompleteRequest, TransferCompleteRequest);
payload_accessor!(rollback_request, RollbackRequest, RollbackRequest);
payload_accessor!(rollback_ack, RollbackAck, RollbackAck);
payload_accessor!(recover_request, RecoverRequest, RecoverRequest);
payload_accessor!(recover_update, RecoverUpdate, RecoverUpdate);
payload_accessor!(recover_success, RecoverSuccess, RecoverSuccess);

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_crypto::GatewayKeyPair;

    fn commit_request(key: &GatewayKeyPair) -> Message {
        Message {
            message_type: MessageType::CommitRequest,
            session_id: SessionId::new(),
            sequence_number: 7,
            hash_prev_message: Some("ab".repeat(32)),
            source_gateway_pubkey: GatewayId(key.public_key()),
            recipient_gateway_pubkey: GatewayId([2; 32]),
            timestamp: Utc::now(),
            payload: Payload::CommitRequest(CommitRequest { asset_profile_hash: "h".into() }),
            signature: String::new(),
        }
        .sign(key)
        .unwrap()
    }

    #[test]
    fn signed_message_verifies_against_signer_only() {
        let key = GatewayKeyPair::generate();
        let msg = commit_request(&key);
        assert!(msg.verify_signature(&GatewayId(key.public_key())));
        assert!(!msg.verify_signature(&GatewayId(GatewayKeyPair::generate().public_key())));
    }

    #[test]
    fn tampering_breaks_signature() {
        let key = GatewayKeyPair::generate();
        let mut msg = commit_request(&key);
        msg.sequence_number += 1;
        assert!(!msg.verify_signature(&GatewayId(key.public_key())));
    }

    #[test]
    fn hash_survives_wire_roundtrip() {
        let key = GatewayKeyPair::generate();
        let msg = commit_request(&key);
        let wire = serde_json::to_vec(&msg).unwrap();
        let back = Message::from_json(&wire).unwrap();
        assert_eq!(msg.hash().unwrap(), back.hash().unwrap());
        assert!(back.verify_signature(&GatewayId(key.public_key())));
    }

    #[test]
    fn accessor_rejects_wrong_body() {
        let key = GatewayKeyPair::generate();
        let msg = commit_request(&key);
        assert!(msg.commit_request().is_ok());
        assert!(matches!(
            msg.commence_request().unwrap_err(),
            GatewayError::Validation { check: crate::ValidationCheck::Payload, .. }
        ));
        assert!(msg.payload_matches_type());
    }

    #[test]
    fn control_messages_are_not_chained() {
        assert!(MessageType::CommitRequest.is_chained());
        assert!(!MessageType::RollbackRequest.is_chained());
        assert!(!MessageType::RecoverUpdate.is_chained());
        assert!(!MessageType::RecoverSuccess.is_chained());
        assert!(MessageType::RecoverSuccess.is_request());
        assert_eq!(MessageType::RecoverRequest.response_type(), Some(MessageType::RecoverUpdate));
        assert_eq!(
            MessageType::LockAssertionRequest.response_type(),
            Some(MessageType::LockAssertionResponse)
        );
        assert_eq!(MessageType::CommitResponse.response_type(), None);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = Message::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedMessage(_)));
    }
}
