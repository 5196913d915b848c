//! # Session: one attempted asset transfer
//!
//! A `SessionData` record is the single source of truth for a transfer on
//! one gateway. Both gateways keep their own copy; they agree on the
//! session id, the pinned keys and ledgers, and the hash chain.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐   ┌─────────────┐   ┌───────────┐   ┌────────┐   ┌───────────┐
//!   │ CREATED ├──▶│ INITIALIZED ├──▶│ COMMENCED ├──▶│ LOCKED ├──▶│ COMMITTED │
//!   └────┬────┘   └──────┬──────┘   └─────┬─────┘   └───┬────┘   └───────────┘
//!        │               │                │   ┌─────────┘
//!        │               │                ▼   ▼
//!        │               │          ┌──────────────┐   ┌─────────────┐
//!        │               │          │ ROLLING_BACK ├──▶│ ROLLED_BACK │
//!        │               │          └──────────────┘   └─────────────┘
//!        ▼               ▼                │
//!   ┌──────────────────────────────────────┐
//!   │ FAILED  (no ledger mutation yet)     │◀─ COMMENCED
//!   └──────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - `last_sequence_number` moves by exactly +1 per accepted chained message.
//! - The rollback journal (`actions performed` + `proofs`) is private and
//!   only grows through [`SessionData::record_action`], so both lists always
//!   have equal length.
//! - Public keys and DLT systems are write-once ([`SessionData::pin_parties`]).
//! - Terminal sessions are never deleted; they stay readable for audit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AssetProfile, DltSystem, ErrorKind, GatewayError, GatewayId, Message, MessageType, RecoverySnapshot,
    Result, RetryPolicy, SessionId, constants,
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Initialized,
    Commenced,
    Locked,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Created, Self::Initialized | Self::Failed)
                | (Self::Initialized, Self::Commenced | Self::Failed)
                | (Self::Commenced, Self::Locked | Self::Failed | Self::RollingBack)
                | (Self::Locked, Self::Committed | Self::RollingBack)
                | (Self::RollingBack, Self::RolledBack)
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Initialized => "INITIALIZED",
            Self::Commenced => "COMMENCED",
            Self::Locked => "LOCKED",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Which side of the exchange this gateway plays for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRole {
    /// Owns the source ledger and drives the phases.
    Client,
    /// Owns the recipient ledger and answers.
    Server,
}

impl fmt::Display for GatewayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Ledger-mutating action tag recorded in the rollback journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackAction {
    Lock,
    Unlock,
    Create,
    Delete,
}

impl RollbackAction {
    /// The action that undoes this one.
    #[must_use]
    pub fn compensation(&self) -> Self {
        match self {
            Self::Lock => Self::Unlock,
            Self::Unlock => Self::Lock,
            Self::Create => Self::Delete,
            Self::Delete => Self::Create,
        }
    }
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "LOCK"),
            Self::Unlock => write!(f, "UNLOCK"),
            Self::Create => write!(f, "CREATE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Chain-of-custody record for one accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub message_type: MessageType,
    pub sequence_number: u64,
    pub hash: String,
    pub signature: String,
    /// Set for inbound messages.
    pub received_at: Option<DateTime<Utc>>,
    pub processed_at: DateTime<Utc>,
}

/// A compensation issued by the rollback coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub action: RollbackAction,
    pub proof: String,
}

/// Last error recorded against a session, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Borrow a required session field or fail with `SessionNotInitialized`.
pub fn require<'a, T>(value: &'a Option<T>, field: &'static str) -> Result<&'a T> {
    value.as_ref().ok_or(GatewayError::SessionNotInitialized { field })
}

/// Persistent per-session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: SessionId,
    pub role: GatewayRole,
    pub state: SessionState,
    /// Last completed phase: 0 none, 1 initialization .. 4 commit.
    pub step: u32,
    pub version: String,
    pub last_sequence_number: u64,

    pub source_gateway_pubkey: Option<GatewayId>,
    pub recipient_gateway_pubkey: Option<GatewayId>,
    pub source_gateway_dlt_system: Option<DltSystem>,
    pub recipient_gateway_dlt_system: Option<DltSystem>,
    pub source_base_path: Option<String>,
    pub recipient_base_path: Option<String>,

    pub asset_profile: Option<AssetProfile>,
    pub asset_profile_hash: Option<String>,
    pub originator_pubkey: Option<String>,
    pub beneficiary_pubkey: Option<String>,
    pub source_ledger_asset_id: Option<String>,
    pub recipient_ledger_asset_id: Option<String>,

    /// Append-only hash chain over every chained message sent or accepted.
    pub chain: Vec<ChainLink>,
    /// Last message this gateway sent, kept for re-sends and duplicate replies.
    pub last_outbound: Option<Message>,

    pub lock_proof: Option<String>,
    pub create_proof: Option<String>,
    pub extinguish_proof: Option<String>,

    rollback_actions_performed: Vec<RollbackAction>,
    rollback_proofs: Vec<String>,
    compensations: Vec<Compensation>,
    pub rollback: bool,

    pub retry: RetryPolicy,
    pub last_error: Option<SessionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionData {
    /// Blank session at step 0.
    #[must_use]
    pub fn new(id: SessionId, role: GatewayRole, retry: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            state: SessionState::Created,
            step: 0,
            version: constants::PROTOCOL_VERSION.to_string(),
            last_sequence_number: 0,
            source_gateway_pubkey: None,
            recipient_gateway_pubkey: None,
            source_gateway_dlt_system: None,
            recipient_gateway_dlt_system: None,
            source_base_path: None,
            recipient_base_path: None,
            asset_profile: None,
            asset_profile_hash: None,
            originator_pubkey: None,
            beneficiary_pubkey: None,
            source_ledger_asset_id: None,
            recipient_ledger_asset_id: None,
            chain: Vec::new(),
            last_outbound: None,
            lock_proof: None,
            create_proof: None,
            extinguish_proof: None,
            rollback_actions_performed: Vec::new(),
            rollback_proofs: Vec::new(),
            compensations: Vec::new(),
            rollback: false,
            retry,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    // -----------------------------------------------------------------
    // State
    // -----------------------------------------------------------------

    /// Move to `target`, enforcing the state machine.
    pub fn transition(&mut self, target: SessionState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(GatewayError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.touch();
        Ok(())
    }

    /// Record completion of phase `step`. Steps only move forward.
    pub fn complete_step(&mut self, step: u32) {
        self.step = self.step.max(step);
        self.touch();
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn record_error(&mut self, err: &GatewayError) {
        self.last_error = Some(SessionError {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // -----------------------------------------------------------------
    // Parties
    // -----------------------------------------------------------------

    /// Set keys and ledgers once. Re-pinning the same values is a no-op;
    /// pinning different values fails.
    pub fn pin_parties(
        &mut self,
        source_pubkey: GatewayId,
        recipient_pubkey: GatewayId,
        source_dlt: DltSystem,
        recipient_dlt: DltSystem,
    ) -> Result<()> {
        check_write_once(&self.source_gateway_pubkey, &source_pubkey, "source_gateway_pubkey")?;
        check_write_once(&self.recipient_gateway_pubkey, &recipient_pubkey, "recipient_gateway_pubkey")?;
        check_write_once(&self.source_gateway_dlt_system, &source_dlt, "source_gateway_dlt_system")?;
        check_write_once(
            &self.recipient_gateway_dlt_system,
            &recipient_dlt,
            "recipient_gateway_dlt_system",
        )?;
        self.source_gateway_pubkey = Some(source_pubkey);
        self.recipient_gateway_pubkey = Some(recipient_pubkey);
        self.source_gateway_dlt_system = Some(source_dlt);
        self.recipient_gateway_dlt_system = Some(recipient_dlt);
        Ok(())
    }

    /// Public key of the other gateway in this session.
    pub fn counterpart_pubkey(&self) -> Result<&GatewayId> {
        match self.role {
            GatewayRole::Client => require(&self.recipient_gateway_pubkey, "recipient_gateway_pubkey"),
            GatewayRole::Server => require(&self.source_gateway_pubkey, "source_gateway_pubkey"),
        }
    }

    /// Base path of the other gateway in this session.
    pub fn counterpart_base_path(&self) -> Result<&str> {
        match self.role {
            GatewayRole::Client => require(&self.recipient_base_path, "recipient_base_path"),
            GatewayRole::Server => require(&self.source_base_path, "source_base_path"),
        }
        .map(String::as_str)
    }

    /// Ledger this gateway operates on for this session.
    pub fn local_dlt(&self) -> Result<DltSystem> {
        match self.role {
            GatewayRole::Client => require(&self.source_gateway_dlt_system, "source_gateway_dlt_system"),
            GatewayRole::Server => require(&self.recipient_gateway_dlt_system, "recipient_gateway_dlt_system"),
        }
        .copied()
    }

    /// Asset id on the ledger this gateway operates on.
    pub fn local_asset_id(&self) -> Result<&str> {
        match self.role {
            GatewayRole::Client => require(&self.source_ledger_asset_id, "source_ledger_asset_id"),
            GatewayRole::Server => require(&self.recipient_ledger_asset_id, "recipient_ledger_asset_id"),
        }
        .map(String::as_str)
    }

    // -----------------------------------------------------------------
    // Hash chain
    // -----------------------------------------------------------------

    #[must_use]
    pub fn chain(&self) -> &[ChainLink] {
        &self.chain
    }

    /// Hash the next chained message must reference.
    #[must_use]
    pub fn last_hash(&self) -> Option<&str> {
        self.chain.last().map(|l| l.hash.as_str())
    }

    /// Most recent link recorded for `message_type`.
    #[must_use]
    pub fn link_for(&self, message_type: MessageType) -> Option<&ChainLink> {
        self.chain.iter().rev().find(|l| l.message_type == message_type)
    }

    /// Record an accepted or sent chained message and advance the sequence number.
    pub fn append_link(&mut self, message: &Message, received_at: Option<DateTime<Utc>>) -> Result<()> {
        let hash = message.hash()?;
        self.chain.push(ChainLink {
            message_type: message.message_type,
            sequence_number: message.sequence_number,
            hash,
            signature: message.signature.clone(),
            received_at,
            processed_at: Utc::now(),
        });
        self.last_sequence_number = message.sequence_number;
        self.touch();
        Ok(())
    }

    /// A request this gateway sent whose response has not been accepted yet.
    #[must_use]
    pub fn pending_request(&self) -> Option<&Message> {
        let outbound = self.last_outbound.as_ref()?;
        if !outbound.message_type.is_request() || !outbound.message_type.is_chained() {
            return None;
        }
        let last = self.chain.last()?;
        (last.message_type == outbound.message_type && last.sequence_number == outbound.sequence_number)
            .then_some(outbound)
    }

    #[must_use]
    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            state: self.state,
            step: self.step,
            last_sequence_number: self.last_sequence_number,
            last_hash: self.last_hash().map(str::to_string),
        }
    }

    // -----------------------------------------------------------------
    // Rollback journal
    // -----------------------------------------------------------------

    /// Journal a ledger mutation that has succeeded, together with its proof.
    pub fn record_action(&mut self, action: RollbackAction, proof: impl Into<String>) {
        self.rollback_actions_performed.push(action);
        self.rollback_proofs.push(proof.into());
        self.touch();
    }

    #[must_use]
    pub fn rollback_actions_performed(&self) -> &[RollbackAction] {
        &self.rollback_actions_performed
    }

    #[must_use]
    pub fn rollback_proofs(&self) -> &[String] {
        &self.rollback_proofs
    }

    /// Journal entries paired with their proofs, oldest first.
    pub fn journal(&self) -> impl DoubleEndedIterator<Item = (RollbackAction, &str)> {
        self.rollback_actions_performed
            .iter()
            .copied()
            .zip(self.rollback_proofs.iter().map(String::as_str))
    }

    #[must_use]
    pub fn has_performed(&self, action: RollbackAction) -> bool {
        self.rollback_actions_performed.contains(&action)
    }

    #[must_use]
    pub fn proof_for(&self, action: RollbackAction) -> Option<&str> {
        self.journal().rev().find(|(a, _)| *a == action).map(|(_, p)| p)
    }

    /// Forget journaled actions once the transfer is final.
    pub fn clear_journal(&mut self) {
        self.rollback_actions_performed.clear();
        self.rollback_proofs.clear();
        self.touch();
    }

    pub fn record_compensation(&mut self, action: RollbackAction, proof: impl Into<String>) {
        self.compensations.push(Compensation {
            action,
            proof: proof.into(),
        });
        self.touch();
    }

    #[must_use]
    pub fn compensations(&self) -> &[Compensation] {
        &self.compensations
    }
}

fn check_write_once<T: PartialEq>(current: &Option<T>, new: &T, field: &'static str) -> Result<()> {
    match current {
        Some(existing) if existing != new => Err(GatewayError::ImmutableField { field }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionData {
        SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default())
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session();
        for target in [
            SessionState::Initialized,
            SessionState::Commenced,
            SessionState::Locked,
            SessionState::Committed,
        ] {
            s.transition(target).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn locked_cannot_fail_directly() {
        assert!(!SessionState::Locked.can_transition_to(SessionState::Failed));
        assert!(SessionState::Locked.can_transition_to(SessionState::RollingBack));
        assert!(SessionState::Commenced.can_transition_to(SessionState::RollingBack));
        assert!(!SessionState::Initialized.can_transition_to(SessionState::RollingBack));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [SessionState::Committed, SessionState::RolledBack, SessionState::Failed] {
            for target in [SessionState::Created, SessionState::Locked, SessionState::RollingBack] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let mut s = session();
        let err = s.transition(SessionState::Locked).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
        assert_eq!(s.state, SessionState::Created);
    }

    #[test]
    fn journal_lists_stay_parallel() {
        let mut s = session();
        s.record_action(RollbackAction::Lock, "lock-A1-ok");
        s.record_action(RollbackAction::Delete, "delete-A1-ok");
        assert_eq!(s.rollback_actions_performed().len(), s.rollback_proofs().len());
        let reversed: Vec<_> = s.journal().rev().map(|(a, _)| a).collect();
        assert_eq!(reversed, vec![RollbackAction::Delete, RollbackAction::Lock]);
        assert_eq!(s.proof_for(RollbackAction::Lock), Some("lock-A1-ok"));
        s.clear_journal();
        assert!(s.rollback_actions_performed().is_empty());
        assert!(s.rollback_proofs().is_empty());
    }

    #[test]
    fn parties_are_write_once() {
        let mut s = session();
        let a = GatewayId([1; 32]);
        let b = GatewayId([2; 32]);
        s.pin_parties(a, b, DltSystem::Fabric, DltSystem::Besu).unwrap();
        s.pin_parties(a, b, DltSystem::Fabric, DltSystem::Besu).unwrap();
        let err = s.pin_parties(b, a, DltSystem::Fabric, DltSystem::Besu).unwrap_err();
        assert!(matches!(err, GatewayError::ImmutableField { field: "source_gateway_pubkey" }));
        assert_eq!(s.source_gateway_pubkey, Some(a));
    }

    #[test]
    fn missing_field_is_session_state_error() {
        let s = session();
        let err = s.local_asset_id().unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotInitialized { field: "source_ledger_asset_id" }));
        assert_eq!(err.kind(), ErrorKind::SessionState);
    }

    #[test]
    fn compensation_pairs() {
        assert_eq!(RollbackAction::Lock.compensation(), RollbackAction::Unlock);
        assert_eq!(RollbackAction::Create.compensation(), RollbackAction::Delete);
        assert_eq!(RollbackAction::Delete.compensation(), RollbackAction::Create);
    }

    #[test]
    fn journal_survives_serde() {
        let mut s = session();
        s.record_action(RollbackAction::Lock, "p");
        let json = serde_json::to_string(&s).unwrap();
        let back: SessionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rollback_actions_performed(), &[RollbackAction::Lock]);
        assert_eq!(back, s);
    }
}
