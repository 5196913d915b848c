//! Recovery manager.
//!
//! Scans the store for sessions that never reached a terminal state and
//! decides, per session, whether to carry on or roll back. Decisions are
//! re-derived from the ledger and the counterpart every time, so recovery
//! can be interrupted and run again.
//!
//! Before deciding, a session catches up with the counterpart: the recover
//! request carries the time of this gateway's last log entry for the
//! session, the counterpart answers with every entry it logged since, and
//! any message in those entries that extends this side's chain is applied
//! through the normal checks. The exchange ends with a recover-success
//! message once the entries are applied.

use hermes_types::{
    GatewayError, GatewayRole, LedgerCall, LocalLogEntry, LogStatus, Message, MessageType, RecoverUpdate, Result,
    RollbackAction, SessionData, SessionId, SessionState, constants,
};
use tracing::{debug, info, warn};

use crate::engine::Gateway;
use crate::phases::{checks, control};

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: Vec<SessionId>,
    pub rolled_back: Vec<SessionId>,
    pub failed: Vec<SessionId>,
    /// Sessions left open, waiting on the counterpart.
    pub pending: Vec<SessionId>,
    pub errors: Vec<(SessionId, String)>,
}

impl RecoveryReport {
    fn record(&mut self, id: SessionId, state: SessionState) {
        match state {
            SessionState::Committed => self.committed.push(id),
            SessionState::RolledBack => self.rolled_back.push(id),
            SessionState::Failed => self.failed.push(id),
            _ => self.pending.push(id),
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.committed.len() + self.rolled_back.len() + self.failed.len() + self.pending.len() + self.errors.len()
    }
}

/// How the counterpart answered a recover request.
enum CounterpartView {
    Answered(RecoverUpdate),
    /// The counterpart has no record of the session.
    Unknown,
    Unreachable(GatewayError),
}

impl Gateway {
    /// Run recovery if the configuration asks for it at startup.
    pub async fn startup(&self) -> Result<Option<RecoveryReport>> {
        if !self.config.recover_on_startup {
            return Ok(None);
        }
        self.recover_open_sessions().await.map(Some)
    }

    /// Bring every open session to a decision.
    pub async fn recover_open_sessions(&self) -> Result<RecoveryReport> {
        let open = self.store.open_sessions().await?;
        info!(parent: &self.span, open = open.len(), "Recovery started");

        let mut report = RecoveryReport::default();
        for session in open {
            let id = session.id;
            match self.recover_session(id).await {
                Ok(state) => report.record(id, state),
                Err(err) => {
                    warn!(parent: &self.span, session = %id, error = %err, "Session recovery failed");
                    report.errors.push((id, err.to_string()));
                }
            }
        }

        info!(
            parent: &self.span,
            committed = report.committed.len(),
            rolled_back = report.rolled_back.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            errors = report.errors.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Recover one session and return the state it ends in.
    pub async fn recover_session(&self, id: SessionId) -> Result<SessionState> {
        self.with_session_lock(id, || async move {
            let session = self.store.get(&id).await?;
            if session.is_terminal() {
                return Ok(session.state);
            }
            info!(
                parent: &self.span,
                session = %id,
                role = %session.role,
                state = %session.state,
                step = session.step,
                "Recovering session"
            );
            match session.role {
                GatewayRole::Client => self.recover_client(session).await,
                GatewayRole::Server => self.recover_server(session).await,
            }
        })
        .await
    }

    async fn recover_client(&self, session: SessionData) -> Result<SessionState> {
        if session.state == SessionState::RollingBack || session.step >= constants::FINAL_STEP {
            return self.drive(session).await;
        }

        let mut session = session;
        let adapter = self.ledger_for(&session)?;
        let asset_id = session.local_asset_id()?.to_string();
        let locked = adapter.exists(&asset_id).await? && adapter.is_locked(&asset_id).await?;
        let journaled = session.has_performed(RollbackAction::Lock);

        if journaled && !locked {
            let err = ledger_drift(&asset_id, "journaled lock is no longer held on the ledger");
            return self.escalate(session, &err).await.map(|s| s.state);
        }
        if !journaled && locked && session.state == SessionState::Commenced {
            // Crashed between the ledger lock and persisting it.
            session.record_action(RollbackAction::Lock, constants::RECOVERED_PROOF);
            self.store.save(&mut session).await?;
            self.audit_proof(&session, "lock-assertion", "LOCK", constants::RECOVERED_PROOF)
                .await;
            let err = ledger_drift(&asset_id, "lock found on the ledger without a recorded proof");
            return self.escalate(session, &err).await.map(|s| s.state);
        }

        match self.ask_counterpart(&session).await {
            CounterpartView::Unreachable(err) => self.escalate(session, &err).await.map(|s| s.state),
            CounterpartView::Unknown if session.step == 0 => self.drive(session).await,
            CounterpartView::Unknown => {
                let err = diverged("server has no record of the session");
                self.escalate(session, &err).await.map(|s| s.state)
            }
            CounterpartView::Answered(update) => {
                let id = session.id;
                let session = match self.catch_up(session, &update.recovered_logs).await {
                    Ok(session) => session,
                    Err(err) => {
                        let current = self.store.get(&id).await?;
                        return self.escalate(current, &err).await.map(|s| s.state);
                    }
                };
                if session.step >= constants::FINAL_STEP {
                    return self.drive(session).await;
                }
                let theirs = update.snapshot;
                if matches!(
                    theirs.state,
                    SessionState::RolledBack | SessionState::RollingBack | SessionState::Failed
                ) {
                    let err = diverged(&format!("server abandoned the session in {}", theirs.state));
                    return self.escalate(session, &err).await.map(|s| s.state);
                }
                let ours = session.last_sequence_number;
                if theirs.last_sequence_number.abs_diff(ours) > 1 {
                    let err = diverged(&format!(
                        "server is at sequence {}, this gateway at {ours}",
                        theirs.last_sequence_number
                    ));
                    return self.escalate(session, &err).await.map(|s| s.state);
                }
                self.drive(session).await
            }
        }
    }

    /// A server session follows the client's outcome.
    async fn recover_server(&self, session: SessionData) -> Result<SessionState> {
        if session.state == SessionState::RollingBack {
            return self.drive(session).await;
        }
        let mut session = session;
        self.rollback.reconcile_unrecorded_create(&mut session).await?;

        let update = match self.ask_counterpart(&session).await {
            CounterpartView::Answered(update) => update,
            CounterpartView::Unknown => {
                let err = diverged("client has no record of the session");
                return self.escalate(session, &err).await.map(|s| s.state);
            }
            CounterpartView::Unreachable(err) => return self.escalate(session, &err).await.map(|s| s.state),
        };
        let id = session.id;
        let session = match self.catch_up(session, &update.recovered_logs).await {
            Ok(session) if session.is_terminal() => return Ok(session.state),
            Ok(session) => session,
            Err(err) => {
                let current = self.store.get(&id).await?;
                return self.escalate(current, &err).await.map(|s| s.state);
            }
        };

        let theirs = update.snapshot;
        match theirs.state {
            SessionState::Committed => {
                if session.step < constants::FINAL_STEP {
                    let err = diverged("client committed a transfer this gateway never created");
                    return self.escalate(session, &err).await.map(|s| s.state);
                }
                let mut session = session;
                session.transition(SessionState::Committed)?;
                session.clear_journal();
                self.store.save(&mut session).await?;
                self.audit_transition(&session, "session", LogStatus::Done, "COMMITTED").await;
                info!(parent: &self.span, session = %session.id, "Transfer committed from client state");
                Ok(session.state)
            }
            state if state.is_terminal() || state == SessionState::RollingBack => {
                let err = diverged(&format!("client abandoned the session in {state}"));
                self.escalate(session, &err).await.map(|s| s.state)
            }
            _ => Ok(session.state),
        }
    }

    /// Ask the counterpart for its view of the session and the log entries
    /// this side has not seen.
    async fn ask_counterpart(&self, session: &SessionData) -> CounterpartView {
        let last_log_at = match self.audit.read_last_for_session(&session.id).await {
            Ok(last) => last.map(|entry| entry.timestamp),
            Err(err) => return CounterpartView::Unreachable(err),
        };
        let ctx = self.ctx();
        let request = match control::recover_request(session, last_log_at, &ctx) {
            Ok(request) => request,
            Err(err) => return CounterpartView::Unreachable(err),
        };
        match self.deliver(session, &request).await {
            Ok(reply) => {
                let checked = checks::check_control(session, &reply, MessageType::RecoverUpdate)
                    .and_then(|()| reply.recover_update().cloned());
                match checked {
                    Ok(update) => CounterpartView::Answered(update),
                    Err(err) => {
                        self.log_rejection(&reply, &err);
                        CounterpartView::Unreachable(err)
                    }
                }
            }
            Err(GatewayError::CounterpartRejected { status: 404, .. }) => CounterpartView::Unknown,
            Err(err) => CounterpartView::Unreachable(err),
        }
    }

    /// Apply every message in the counterpart's entries that extends this
    /// side's chain, then confirm to the counterpart. Entries must be
    /// signed by the counterpart. Entries that hold no session record, or
    /// whose message is already applied or further ahead, are skipped; the
    /// first message that fails its checks ends the replay.
    async fn catch_up(&self, session: SessionData, entries: &[LocalLogEntry]) -> Result<SessionData> {
        let counterpart = *session.counterpart_pubkey()?;
        let mut session = session;
        let mut replayed = 0u32;

        for entry in entries {
            if entry.signer_pubkey != counterpart || !entry.verify() {
                return Err(GatewayError::SignatureVerification {
                    message_type: format!("log entry {}", entry.key),
                    signer: entry.signer_pubkey.to_string(),
                });
            }
            let Some(message) = logged_message(entry) else {
                continue;
            };
            if !message.message_type.is_chained()
                || Some(message.sequence_number) != session.last_sequence_number.checked_add(1)
            {
                continue;
            }
            let applied = match session.role {
                GatewayRole::Client if !message.message_type.is_request() => {
                    self.accept(&session, &message).await.map(Some)
                }
                GatewayRole::Server if message.message_type.is_request() => {
                    self.replay_request(&session, &message).await
                }
                _ => Ok(None),
            };
            match applied {
                Ok(Some(next)) => {
                    session = next;
                    replayed += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        parent: &self.span,
                        session = %session.id,
                        message_type = %message.message_type,
                        error = %err,
                        "Logged message not applied"
                    );
                    break;
                }
            }
        }

        if replayed > 0 {
            info!(
                parent: &self.span,
                session = %session.id,
                replayed,
                state = %session.state,
                step = session.step,
                "Caught up from counterpart log"
            );
        }
        self.confirm_recovery(&session, replayed).await;
        Ok(session)
    }

    /// Tell the counterpart this side has applied its entries. Best effort.
    async fn confirm_recovery(&self, session: &SessionData, replayed: u32) {
        let outcome = async {
            let message = control::recover_success(session, replayed, &self.ctx())?;
            let ack = self.deliver(session, &message).await?;
            checks::check_control(session, &ack, MessageType::RecoverSuccessAck)
        }
        .await;
        match outcome {
            Ok(()) => debug!(parent: &self.span, session = %session.id, "Counterpart acknowledged recovery"),
            Err(err) => warn!(parent: &self.span, session = %session.id, error = %err, "Recovery confirmation failed"),
        }
    }
}

/// The last message the counterpart sent, from an entry holding its
/// session record.
fn logged_message(entry: &LocalLogEntry) -> Option<Message> {
    serde_json::from_str::<SessionData>(&entry.data)
        .ok()
        .and_then(|record| record.last_outbound)
}

fn ledger_drift(asset_id: &str, reason: &str) -> GatewayError {
    GatewayError::Ledger {
        operation: LedgerCall::IsLocked,
        asset_id: asset_id.to_string(),
        reason: reason.to_string(),
    }
}

fn diverged(reason: &str) -> GatewayError {
    GatewayError::Diverged {
        reason: reason.to_string(),
    }
}
