//! Client-role operations: the gateway that owns the source asset drives
//! the transfer.
//!
//! Every `send_*` call takes the session lock, runs any ledger work that
//! must precede the message, persists the session with the outbound
//! message recorded, and then either returns the signed request
//! (`remote = false`) or delivers it and accepts the answer. Delivery
//! failures escalate the session; a bad answer is rejected and leaves the
//! session as it was.

use hermes_types::{
    GatewayError, LedgerCall, LogStatus, Message, MessageType, Result, SessionData, SessionId, SessionState,
    TransferRequest, ValidationCheck, constants,
};
use tracing::{info, warn};

use crate::engine::{Gateway, PhaseOutcome};
use crate::phases::{commence, commit, initialization, lock_assertion, transfer_complete};

impl Gateway {
    /// Open a client session for `request`. Nothing is sent yet.
    pub async fn start_transfer(&self, request: TransferRequest) -> Result<SessionId> {
        let mut session = request.into_session(self.id, &self.config.base_path, self.config.retry)?;
        let _guard = self.store.lock(session.id).await;
        self.store.save(&mut session).await?;
        info!(
            parent: &self.span,
            session = %session.id,
            asset = session.source_ledger_asset_id.as_deref().unwrap_or_default(),
            seq = session.last_sequence_number,
            "Transfer session created"
        );
        Ok(session.id)
    }

    pub async fn send_initialization_request(&self, id: SessionId, remote: bool) -> Result<PhaseOutcome> {
        self.send_phase(id, MessageType::InitializationRequest, remote).await
    }

    pub async fn send_commence_request(&self, id: SessionId, remote: bool) -> Result<PhaseOutcome> {
        self.send_phase(id, MessageType::CommenceRequest, remote).await
    }

    /// Locks the source asset first if that has not happened yet.
    pub async fn send_lock_assertion_request(&self, id: SessionId, remote: bool) -> Result<PhaseOutcome> {
        self.send_phase(id, MessageType::LockAssertionRequest, remote).await
    }

    /// With `remote = true`, a successful answer also extinguishes the
    /// source asset and commits the session.
    pub async fn send_commit_request(&self, id: SessionId, remote: bool) -> Result<PhaseOutcome> {
        self.send_phase(id, MessageType::CommitRequest, remote).await
    }

    pub async fn on_initialization_response(&self, response: Message) -> Result<SessionState> {
        self.on_response(response, MessageType::InitializationResponse).await
    }

    pub async fn on_commence_response(&self, response: Message) -> Result<SessionState> {
        self.on_response(response, MessageType::CommenceResponse).await
    }

    pub async fn on_lock_assertion_response(&self, response: Message) -> Result<SessionState> {
        self.on_response(response, MessageType::LockAssertionResponse).await
    }

    /// Accepts the create proof, extinguishes the source asset and commits.
    pub async fn on_commit_response(&self, response: Message) -> Result<SessionState> {
        self.on_response(response, MessageType::CommitResponse).await
    }

    /// Drive a client session to a terminal state.
    ///
    /// Resumes from wherever the session was persisted: a request that was
    /// sent but never answered is re-sent as-is. Any failure escalates the
    /// session; the returned state is then `Failed` or `RolledBack`. An
    /// error is returned only when the escalation itself could not finish.
    pub async fn run_transfer(&self, id: SessionId) -> Result<SessionState> {
        self.with_session_lock(id, || async move {
            let session = self.store.get(&id).await?;
            self.drive(session).await
        })
        .await
    }

    /// Roll a session back on operator request and notify the counterpart.
    pub async fn abort(&self, id: SessionId, reason: &str) -> Result<SessionState> {
        self.with_session_lock(id, || async move {
            let session = self.store.get(&id).await?;
            info!(parent: &self.span, session = %id, reason, "Abort requested");
            let session = self.resolve(session, &format!("aborted: {reason}")).await?;
            Ok(session.state)
        })
        .await
    }

    // -----------------------------------------------------------------
    // Internals; the session lock is held by the caller. Rollback notices
    // they queue go out once the lock is released.
    // -----------------------------------------------------------------

    pub(crate) async fn drive(&self, session: SessionData) -> Result<SessionState> {
        let id = session.id;
        let mut session = session;
        loop {
            if session.is_terminal() {
                return Ok(session.state);
            }
            if session.state == SessionState::RollingBack {
                let resumed = self.resolve(session, "resuming interrupted rollback").await?;
                return Ok(resumed.state);
            }
            match self.advance(&session).await {
                Ok(next) => session = next,
                Err(err) => {
                    // Steps persist as they go; escalate from what is stored.
                    let current = self.store.get(&id).await?;
                    let resolved = self.escalate(current, &err).await?;
                    return Ok(resolved.state);
                }
            }
        }
    }

    /// One forward step.
    async fn advance(&self, session: &SessionData) -> Result<SessionData> {
        if session.step >= constants::FINAL_STEP {
            return self.finalize_commit(session).await;
        }
        let (next, request) = match session.pending_request().cloned() {
            Some(pending) => {
                info!(
                    parent: &self.span,
                    session = %session.id,
                    message_type = %pending.message_type,
                    seq = pending.sequence_number,
                    "Re-sending unanswered request"
                );
                (session.clone(), pending)
            }
            None => self.begin(session).await?,
        };
        let response = self.deliver(&next, &request).await?;
        self.accept(&next, &response).await
    }

    async fn send_phase(&self, id: SessionId, phase: MessageType, remote: bool) -> Result<PhaseOutcome> {
        self.with_session_lock(id, || self.send_phase_locked(id, phase, remote))
            .await
    }

    async fn send_phase_locked(&self, id: SessionId, phase: MessageType, remote: bool) -> Result<PhaseOutcome> {
        let session = self.store.get(&id).await?;

        let (next, request) = match session.pending_request() {
            // Built earlier and never answered: send the same message again.
            Some(pending) if pending.message_type == phase => (session.clone(), pending.clone()),
            _ if next_request(&session) != Some(phase) => {
                return Err(GatewayError::InvalidTransition {
                    from: session.state,
                    to: target_state(phase),
                });
            }
            _ => match self.begin(&session).await {
                Ok(built) => built,
                Err(err @ GatewayError::Ledger { .. }) => {
                    let current = self.store.get(&id).await?;
                    self.escalate(current, &err).await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            },
        };
        if !remote {
            return Ok(PhaseOutcome::Built(request));
        }

        let response = match self.deliver(&next, &request).await {
            Ok(response) => response,
            Err(err) => {
                self.escalate(next, &err).await?;
                return Err(err);
            }
        };
        let accepted = self.accept(&next, &response).await?;
        let state = self.settle(accepted).await?;
        Ok(PhaseOutcome::Completed(state))
    }

    async fn on_response(&self, response: Message, expected: MessageType) -> Result<SessionState> {
        if response.message_type != expected {
            let err = GatewayError::Validation {
                check: ValidationCheck::MessageType,
                reason: format!("expected {expected}, got {}", response.message_type),
            };
            self.log_rejection(&response, &err);
            return Err(err);
        }
        let id = response.session_id;
        self.with_session_lock(id, move || async move {
            let session = self.store.get(&id).await?;
            let accepted = self.accept(&session, &response).await?;
            self.settle(accepted).await
        })
        .await
    }

    /// After an accepted commit answer, finish the commit; escalate if that
    /// fails.
    async fn settle(&self, session: SessionData) -> Result<SessionState> {
        if session.step < constants::FINAL_STEP {
            return Ok(session.state);
        }
        let id = session.id;
        match self.finalize_commit(&session).await {
            Ok(done) => Ok(done.state),
            Err(err) => {
                let current = self.store.get(&id).await?;
                self.escalate(current, &err).await?;
                Err(err)
            }
        }
    }

    /// Build and persist the next request, doing any ledger work it needs.
    async fn begin(&self, session: &SessionData) -> Result<(SessionData, Message)> {
        let ctx = self.ctx();
        let (phase, built) = match next_request(session) {
            Some(MessageType::InitializationRequest) => {
                self.check_source_asset(session).await?;
                ("initialization", initialization::build_request(session, &ctx)?)
            }
            Some(MessageType::CommenceRequest) => ("commence", commence::build_request(session, &ctx)?),
            Some(MessageType::LockAssertionRequest) if session.state == SessionState::Commenced => {
                let locked = self.lock_source_asset(session).await?;
                ("lock-assertion", lock_assertion::build_request(&locked, &ctx)?)
            }
            Some(MessageType::LockAssertionRequest) => ("lock-assertion", lock_assertion::build_request(session, &ctx)?),
            Some(MessageType::CommitRequest) => ("commit", commit::build_request(session, &ctx)?),
            _ => {
                return Err(GatewayError::Internal(format!(
                    "no request to send from {} at step {}",
                    session.state, session.step
                )));
            }
        };
        let (mut next, request) = built;
        self.store.save(&mut next).await?;
        self.audit_transition(&next, phase, LogStatus::Init, request.message_type)
            .await;
        info!(
            parent: &self.span,
            session = %next.id,
            message_type = %request.message_type,
            seq = request.sequence_number,
            "Request built"
        );
        Ok((next, request))
    }

    /// Check and persist an answer from the server. On rejection the stored
    /// session is untouched.
    pub(crate) async fn accept(&self, session: &SessionData, response: &Message) -> Result<SessionData> {
        let ctx = self.ctx();
        let (phase, accepted) = match response.message_type {
            MessageType::InitializationResponse => (
                "initialization",
                initialization::accept_response(session, response, &ctx),
            ),
            MessageType::CommenceResponse => ("commence", commence::accept_response(session, response, &ctx)),
            MessageType::LockAssertionResponse => (
                "lock-assertion",
                lock_assertion::accept_response(session, response, &ctx),
            ),
            MessageType::CommitResponse => ("commit", commit::accept_response(session, response, &ctx)),
            other => (
                "unknown",
                Err(GatewayError::Validation {
                    check: ValidationCheck::MessageType,
                    reason: format!("{other} is not a phase response"),
                }),
            ),
        };
        let mut next = accepted.inspect_err(|err| self.log_rejection(response, err))?;
        self.store.save(&mut next).await?;
        self.audit_transition(&next, phase, LogStatus::Done, response.message_type)
            .await;
        if response.message_type == MessageType::CommitResponse {
            if let Some(proof) = next.create_proof.clone() {
                self.audit_proof(&next, "commit", "CREATE", &proof).await;
            }
        }
        info!(
            parent: &self.span,
            session = %next.id,
            state = %next.state,
            step = next.step,
            seq = next.last_sequence_number,
            "Response accepted"
        );
        Ok(next)
    }

    /// Initialization pre-check: the source asset must exist and be free.
    async fn check_source_asset(&self, session: &SessionData) -> Result<()> {
        let adapter = self.ledger_for(session)?;
        let asset_id = session.local_asset_id()?;
        if !adapter.exists(asset_id).await? {
            return Err(GatewayError::Ledger {
                operation: LedgerCall::Exists,
                asset_id: asset_id.to_string(),
                reason: "source asset does not exist".into(),
            });
        }
        if adapter.is_locked(asset_id).await? {
            return Err(GatewayError::Ledger {
                operation: LedgerCall::IsLocked,
                asset_id: asset_id.to_string(),
                reason: "source asset is already locked".into(),
            });
        }
        Ok(())
    }

    /// Lock the source asset and journal the lock once the ledger confirms.
    async fn lock_source_asset(&self, session: &SessionData) -> Result<SessionData> {
        let adapter = self.ledger_for(session)?;
        let asset_id = session.local_asset_id()?;
        let proof = adapter.lock(asset_id).await?;
        let mut locked = lock_assertion::record_lock(session, &proof)?;
        self.store.save(&mut locked).await?;
        self.audit_proof(&locked, "lock-assertion", "LOCK", &proof).await;
        info!(parent: &self.span, session = %locked.id, asset = asset_id, proof = %proof, "Source asset locked");
        Ok(locked)
    }

    /// Extinguish the source asset, tell the server, and commit.
    ///
    /// Safe to re-run after a crash: an asset already gone from the ledger
    /// counts as extinguished, and the notification is skipped once
    /// acknowledged. The notification itself is best effort.
    pub(crate) async fn finalize_commit(&self, session: &SessionData) -> Result<SessionData> {
        let mut session = session.clone();

        if session.extinguish_proof.is_none() {
            let adapter = self.ledger_for(&session)?;
            let asset_id = session.local_asset_id()?.to_string();
            let proof = if adapter.exists(&asset_id).await? {
                adapter.delete(&asset_id).await?
            } else {
                constants::RECOVERED_PROOF.to_string()
            };
            session = commit::record_extinguish(&session, &proof)?;
            self.store.save(&mut session).await?;
            self.audit_proof(&session, "transfer-complete", "DELETE", &proof).await;
            info!(parent: &self.span, session = %session.id, asset = %asset_id, proof = %proof, "Source asset extinguished");
        }

        if session.link_for(MessageType::TransferCompleteResponse).is_none() {
            session = self.notify_transfer_complete(session).await?;
        }

        let mut done = commit::finalize(&session)?;
        self.store.save(&mut done).await?;
        self.audit_transition(&done, "session", LogStatus::Done, "COMMITTED").await;
        info!(parent: &self.span, session = %done.id, "Transfer committed");
        Ok(done)
    }

    async fn notify_transfer_complete(&self, session: SessionData) -> Result<SessionData> {
        let ctx = self.ctx();
        let (mut next, request) = match session.pending_request() {
            Some(pending) if pending.message_type == MessageType::TransferCompleteRequest => {
                (session.clone(), pending.clone())
            }
            _ => transfer_complete::build_request(&session, &ctx)?,
        };
        self.store.save(&mut next).await?;
        self.audit_transition(&next, "transfer-complete", LogStatus::Init, request.message_type)
            .await;

        let acknowledged = match self.deliver(&next, &request).await {
            Ok(response) => transfer_complete::accept_response(&next, &response, &ctx),
            Err(err) => Err(err),
        };
        match acknowledged {
            Ok(mut acked) => {
                self.store.save(&mut acked).await?;
                self.audit_transition(&acked, "transfer-complete", LogStatus::Done, MessageType::TransferCompleteResponse)
                    .await;
                Ok(acked)
            }
            Err(err) => {
                warn!(
                    parent: &self.span,
                    session = %next.id,
                    error = %err,
                    "Transfer-complete notification failed; server will learn the outcome on recovery"
                );
                Ok(next)
            }
        }
    }
}

/// The request a client session at its current state and step sends next.
fn next_request(session: &SessionData) -> Option<MessageType> {
    match (session.state, session.step) {
        (SessionState::Created, 0) => Some(MessageType::InitializationRequest),
        (SessionState::Initialized, 1) => Some(MessageType::CommenceRequest),
        (SessionState::Commenced | SessionState::Locked, 2) => Some(MessageType::LockAssertionRequest),
        (SessionState::Locked, 3) => Some(MessageType::CommitRequest),
        _ => None,
    }
}

fn target_state(phase: MessageType) -> SessionState {
    match phase {
        MessageType::InitializationRequest => SessionState::Initialized,
        MessageType::CommenceRequest => SessionState::Commenced,
        MessageType::LockAssertionRequest => SessionState::Locked,
        _ => SessionState::Committed,
    }
}
