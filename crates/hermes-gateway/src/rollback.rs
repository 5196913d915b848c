//! Rollback coordinator.
//!
//! Walks a session's journal newest-first and issues the compensating ledger
//! call for each entry. Before every compensation the ledger is asked
//! whether the entry is still in effect, so a rollback interrupted by a
//! crash can simply be run again:
//!
//! | journaled | still in effect if | compensation |
//! |-----------|--------------------|--------------|
//! | `Lock`    | asset is locked    | `unlock`     |
//! | `Create`  | asset exists       | `delete`     |
//! | `Delete`  | asset is missing   | `create`     |
//! | `Unlock`  | asset is unlocked  | `lock`       |
//!
//! A server session past the lock assertion with no journaled create is
//! checked against the recipient ledger first: an asset found there was
//! created before the process could record it, and is journaled with
//! [`constants::RECOVERED_PROOF`] so the walk deletes it.

use std::sync::Arc;

use hermes_store::{AuditLogger, SessionStore};
use hermes_types::{
    GatewayError, GatewayRole, LogStatus, Result, RollbackAction, SessionData, SessionState, constants, require,
};
use tracing::{Span, debug, error, info, warn};

use crate::{LedgerAdapter, LedgerRegistry};

/// Where a rollback left the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub state: SessionState,
    /// Every compensation issued for the session so far, oldest first.
    pub compensated: Vec<RollbackAction>,
}

impl RollbackOutcome {
    fn of(session: &SessionData) -> Self {
        Self {
            state: session.state,
            compensated: session.compensations().iter().map(|c| c.action).collect(),
        }
    }
}

pub struct RollbackCoordinator {
    store: Arc<SessionStore>,
    ledgers: Arc<LedgerRegistry>,
    audit: Arc<AuditLogger>,
    span: Span,
}

impl RollbackCoordinator {
    #[must_use]
    pub fn new(store: Arc<SessionStore>, ledgers: Arc<LedgerRegistry>, audit: Arc<AuditLogger>, span: Span) -> Self {
        Self {
            store,
            ledgers,
            audit,
            span,
        }
    }

    /// Roll `session` back. The caller must hold the session lock.
    ///
    /// A session with nothing journaled that can still fail outright is
    /// marked `Failed`. A session already rolled back or failed is left
    /// alone. A committed session cannot be rolled back.
    ///
    /// On a ledger error the session is persisted in `RollingBack` with the
    /// error recorded, and the error is returned; running again resumes.
    pub async fn run(&self, session: &mut SessionData, reason: &str) -> Result<RollbackOutcome> {
        match session.state {
            SessionState::RolledBack | SessionState::Failed => return Ok(RollbackOutcome::of(session)),
            SessionState::Committed => {
                return Err(GatewayError::InvalidTransition {
                    from: SessionState::Committed,
                    to: SessionState::RollingBack,
                });
            }
            _ => {}
        }

        self.reconcile_unrecorded_create(session).await?;

        if session.rollback_actions_performed().is_empty() && session.state.can_transition_to(SessionState::Failed) {
            session.transition(SessionState::Failed)?;
            self.store.save(session).await?;
            self.audit_state(session, LogStatus::Failed, "FAILED").await;
            info!(parent: &self.span, session = %session.id, reason, "Session failed before any ledger change");
            return Ok(RollbackOutcome::of(session));
        }

        if session.state != SessionState::RollingBack {
            session.transition(SessionState::RollingBack)?;
            session.rollback = true;
            self.store.save(session).await?;
            self.audit_state(session, LogStatus::Init, "ROLLBACK").await;
            info!(
                parent: &self.span,
                session = %session.id,
                journal = session.rollback_actions_performed().len(),
                reason,
                "Rollback started"
            );
        }

        let adapter = self.ledgers.get(session.local_dlt()?)?;
        let asset_id = session.local_asset_id()?.to_string();
        let pending: Vec<RollbackAction> = session.journal().rev().map(|(action, _)| action).collect();

        for action in pending {
            match self.compensate(adapter.as_ref(), session, action, &asset_id).await {
                Ok(Some(proof)) => {
                    let compensation = action.compensation();
                    session.record_compensation(compensation, proof.clone());
                    self.store.save(session).await?;
                    let phase = format!("rollback-{}", compensation.to_string().to_lowercase());
                    if let Err(err) = self
                        .audit
                        .log_compensation(session.id, &phase, &compensation.to_string(), &proof)
                        .await
                    {
                        error!(parent: &self.span, session = %session.id, error = %err, "Audit proof write failed");
                    }
                    info!(
                        parent: &self.span,
                        session = %session.id,
                        undone = %action,
                        issued = %compensation,
                        asset = %asset_id,
                        "Compensation issued"
                    );
                }
                Ok(None) => debug!(
                    parent: &self.span,
                    session = %session.id,
                    undone = %action,
                    asset = %asset_id,
                    "Ledger already reflects compensation"
                ),
                Err(err) => {
                    warn!(
                        parent: &self.span,
                        session = %session.id,
                        undone = %action,
                        asset = %asset_id,
                        error = %err,
                        "Compensation failed; session stays rolling back"
                    );
                    session.record_error(&err);
                    self.store.save(session).await?;
                    return Err(err);
                }
            }
        }

        session.transition(SessionState::RolledBack)?;
        self.store.save(session).await?;
        self.audit_state(session, LogStatus::Done, "ROLLBACK").await;
        info!(parent: &self.span, session = %session.id, role = %session.role, "Rollback complete");
        Ok(RollbackOutcome::of(session))
    }

    /// Journal a recipient asset the server created but never recorded.
    /// Returns whether one was found.
    pub(crate) async fn reconcile_unrecorded_create(&self, session: &mut SessionData) -> Result<bool> {
        if session.role != GatewayRole::Server
            || session.step < constants::LOCKED_STEP
            || session.has_performed(RollbackAction::Create)
        {
            return Ok(false);
        }
        let adapter = self.ledgers.get(session.local_dlt()?)?;
        let asset_id = session.local_asset_id()?.to_string();
        if !adapter.exists(&asset_id).await? {
            return Ok(false);
        }

        session.record_action(RollbackAction::Create, constants::RECOVERED_PROOF);
        self.store.save(session).await?;
        if let Err(err) = self
            .audit
            .log_proof(session.id, "commit", "CREATE", constants::RECOVERED_PROOF)
            .await
        {
            error!(parent: &self.span, session = %session.id, error = %err, "Audit proof write failed");
        }
        warn!(
            parent: &self.span,
            session = %session.id,
            asset = %asset_id,
            "Recipient asset found on the ledger without a recorded create"
        );
        Ok(true)
    }

    /// Issue the compensation for `action` if the ledger still shows it.
    /// Returns the compensation proof, or `None` if nothing had to be done.
    async fn compensate(
        &self,
        adapter: &dyn LedgerAdapter,
        session: &SessionData,
        action: RollbackAction,
        asset_id: &str,
    ) -> Result<Option<String>> {
        match action {
            RollbackAction::Lock => {
                if adapter.is_locked(asset_id).await? {
                    return adapter.unlock(asset_id).await.map(Some);
                }
            }
            RollbackAction::Unlock => {
                if adapter.exists(asset_id).await? && !adapter.is_locked(asset_id).await? {
                    return adapter.lock(asset_id).await.map(Some);
                }
            }
            RollbackAction::Create => {
                if adapter.exists(asset_id).await? {
                    return adapter.delete(asset_id).await.map(Some);
                }
            }
            RollbackAction::Delete => {
                if !adapter.exists(asset_id).await? {
                    let profile = require(&session.asset_profile, "asset_profile")?;
                    let owner = match session.role {
                        GatewayRole::Client => profile.source_account()?,
                        GatewayRole::Server => profile.recipient_account()?,
                    };
                    return adapter.create(asset_id, profile.amount()?, owner).await.map(Some);
                }
            }
        }
        Ok(None)
    }

    async fn audit_state(&self, session: &SessionData, status: LogStatus, operation: &str) {
        if let Err(err) = self.audit.log_transition(session, "rollback", status, operation).await {
            error!(parent: &self.span, session = %session.id, error = %err, "Audit log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use hermes_crypto::GatewayKeyPair;
    use hermes_store::MemoryRepository;
    use hermes_types::{AssetProfile, DltSystem, GatewayId, LedgerCall, RetryPolicy, SessionId};
    use rust_decimal::Decimal;

    use super::*;
    use crate::InMemoryLedger;

    struct Fixture {
        coordinator: RollbackCoordinator,
        store: Arc<SessionStore>,
        ledger: Arc<InMemoryLedger>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(SessionStore::new(repo.clone(), Span::none()));
        let ledger = Arc::new(InMemoryLedger::new());
        let mut ledgers = LedgerRegistry::new();
        ledgers.register(ledger.clone());
        let audit = Arc::new(AuditLogger::new(
            repo,
            Arc::new(GatewayKeyPair::generate()),
            None,
            Span::none(),
        ));
        Fixture {
            coordinator: RollbackCoordinator::new(store.clone(), Arc::new(ledgers), audit, Span::none()),
            store,
            ledger,
        }
    }

    fn client_session(state: SessionState) -> SessionData {
        let mut s = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        s.pin_parties(
            GatewayId([1; 32]),
            GatewayId([2; 32]),
            DltSystem::InMemory,
            DltSystem::InMemory,
        )
        .unwrap();
        s.source_ledger_asset_id = Some("A1".into());
        s.recipient_ledger_asset_id = Some("B1".into());
        s.asset_profile = Some(AssetProfile::dummy("A1", Decimal::from(100)));
        s.state = state;
        s
    }

    #[tokio::test]
    async fn unlocks_journaled_lock() {
        let f = fixture();
        f.ledger.seed("A1", Decimal::from(100), "alice@source");
        let proof = f.ledger.lock("A1").await.unwrap();
        let mut s = client_session(SessionState::Locked);
        s.record_action(RollbackAction::Lock, proof);

        let outcome = f.coordinator.run(&mut s, "test").await.unwrap();
        assert_eq!(outcome.state, SessionState::RolledBack);
        assert_eq!(outcome.compensated, vec![RollbackAction::Unlock]);
        assert!(s.rollback);
        assert!(!f.ledger.asset("A1").unwrap().locked);

        let stored = f.store.get(&s.id).await.unwrap();
        assert_eq!(stored.state, SessionState::RolledBack);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let f = fixture();
        f.ledger.seed("A1", Decimal::from(100), "alice@source");
        let proof = f.ledger.lock("A1").await.unwrap();
        let mut s = client_session(SessionState::Locked);
        s.record_action(RollbackAction::Lock, proof);

        f.coordinator.run(&mut s, "first").await.unwrap();
        f.coordinator.run(&mut s, "second").await.unwrap();
        assert_eq!(f.ledger.call_count(LedgerCall::Unlock), 1);
    }

    #[tokio::test]
    async fn interrupted_rollback_resumes_without_repeating() {
        let f = fixture();
        f.ledger.seed("A1", Decimal::from(100), "alice@source");
        f.ledger.lock("A1").await.unwrap();
        f.ledger.delete("A1").await.unwrap();

        let mut s = client_session(SessionState::Locked);
        s.step = 4;
        s.record_action(RollbackAction::Lock, "lock-A1-ok");
        s.record_action(RollbackAction::Delete, "delete-A1-ok");

        // The re-create succeeds, then the process "crashes": the session is
        // left rolling back with the journal intact.
        f.ledger.fail(LedgerCall::IsLocked);
        let err = f.coordinator.run(&mut s, "first").await.unwrap_err();
        assert!(matches!(err, GatewayError::Ledger { .. }));
        assert_eq!(s.state, SessionState::RollingBack);
        assert!(f.ledger.asset("A1").is_some());

        f.ledger.heal(LedgerCall::IsLocked);
        let outcome = f.coordinator.run(&mut s, "resume").await.unwrap();
        assert_eq!(outcome.state, SessionState::RolledBack);
        assert_eq!(f.ledger.call_count(LedgerCall::Create), 1);
        // The re-created asset starts unlocked, so there is nothing to unlock.
        assert_eq!(f.ledger.call_count(LedgerCall::Unlock), 0);
        assert_eq!(outcome.compensated, vec![RollbackAction::Create]);
    }

    #[tokio::test]
    async fn empty_journal_fails_session() {
        let f = fixture();
        let mut s = client_session(SessionState::Commenced);
        let outcome = f.coordinator.run(&mut s, "test").await.unwrap();
        assert_eq!(outcome.state, SessionState::Failed);
        assert!(outcome.compensated.is_empty());
    }

    #[tokio::test]
    async fn committed_session_is_refused() {
        let f = fixture();
        let mut s = client_session(SessionState::Committed);
        let err = f.coordinator.run(&mut s, "test").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn server_create_is_deleted() {
        let f = fixture();
        let mut s = client_session(SessionState::Locked);
        s.role = GatewayRole::Server;
        let proof = f.ledger.create("B1", Decimal::from(100), "bob@recipient").await.unwrap();
        s.record_action(RollbackAction::Create, proof);

        let outcome = f.coordinator.run(&mut s, "test").await.unwrap();
        assert_eq!(outcome.compensated, vec![RollbackAction::Delete]);
        assert!(f.ledger.asset("B1").is_none());
    }

    #[tokio::test]
    async fn unrecorded_server_create_is_journaled_and_deleted() {
        let f = fixture();
        let mut s = client_session(SessionState::Locked);
        s.role = GatewayRole::Server;
        s.step = 3;
        f.ledger.create("B1", Decimal::from(100), "bob@recipient").await.unwrap();

        let outcome = f.coordinator.run(&mut s, "test").await.unwrap();
        assert_eq!(outcome.state, SessionState::RolledBack);
        assert_eq!(outcome.compensated, vec![RollbackAction::Delete]);
        assert_eq!(s.proof_for(RollbackAction::Create), Some(constants::RECOVERED_PROOF));
        assert!(f.ledger.asset("B1").is_none());
    }

    #[tokio::test]
    async fn server_before_lock_assertion_is_not_reconciled() {
        let f = fixture();
        let mut s = client_session(SessionState::Commenced);
        s.role = GatewayRole::Server;
        s.step = 2;
        f.ledger.create("B1", Decimal::from(100), "bob@recipient").await.unwrap();

        assert!(!f.coordinator.reconcile_unrecorded_create(&mut s).await.unwrap());
        let outcome = f.coordinator.run(&mut s, "test").await.unwrap();
        assert_eq!(outcome.state, SessionState::Failed);
        assert!(f.ledger.asset("B1").is_some());
    }
}
