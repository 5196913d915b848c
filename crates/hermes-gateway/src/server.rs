//! Server-role handlers: the gateway that receives the asset answers the
//! client's requests.
//!
//! Rollback and recover requests are accepted in either role, since a
//! server that gives up on a session notifies its client the same way.

use hermes_types::{
    GatewayError, LogStatus, Message, MessageType, Result, SessionData, ValidationCheck, require,
};
use tracing::{debug, error, info};

use crate::engine::Gateway;
use crate::phases::{
    PhaseContext, checks, commence, commit, control, duplicate_reply, initialization, lock_assertion,
    transfer_complete,
};

impl Gateway {
    /// Entry point for every inbound message.
    pub async fn handle_message(&self, message: Message) -> Result<Message> {
        match message.message_type {
            MessageType::InitializationRequest => self.handle_initialization_request(message).await,
            MessageType::CommenceRequest => self.handle_commence_request(message).await,
            MessageType::LockAssertionRequest => self.handle_lock_assertion_request(message).await,
            MessageType::CommitRequest => self.handle_commit_request(message).await,
            MessageType::TransferCompleteRequest => self.handle_transfer_complete(message).await,
            MessageType::RollbackRequest => self.handle_rollback_request(message).await,
            MessageType::RecoverRequest => self.handle_recover_request(message).await,
            MessageType::RecoverSuccess => self.handle_recover_success(message).await,
            other => {
                let err = GatewayError::Validation {
                    check: ValidationCheck::MessageType,
                    reason: format!("{other} is not a request"),
                };
                self.log_rejection(&message, &err);
                Err(err)
            }
        }
    }

    /// Open a server session. The recipient asset id must be free on the
    /// recipient ledger.
    pub async fn handle_initialization_request(&self, message: Message) -> Result<Message> {
        let _guard = self.store.lock(message.session_id).await;
        if let Some(existing) = self.store.find(&message.session_id).await? {
            return self.replay_or_reject(&existing, &message);
        }

        let ctx = self.ctx();
        let body = initialization::validate_request(&message, &ctx).inspect_err(|err| self.log_rejection(&message, err))?;
        let adapter = self.ledgers.get(body.recipient_dlt_system)?;
        if adapter.exists(&body.recipient_ledger_asset_id).await? {
            let err = GatewayError::payload(format!(
                "recipient asset {} already exists",
                body.recipient_ledger_asset_id
            ));
            self.log_rejection(&message, &err);
            return Err(err);
        }

        let (mut session, response) = initialization::accept_request(&message, &ctx)?;
        self.store.save(&mut session).await?;
        self.audit_transition(&session, "initialization", LogStatus::Done, response.message_type)
            .await;
        info!(
            parent: &self.span,
            session = %session.id,
            client = %message.source_gateway_pubkey,
            asset = %body.recipient_ledger_asset_id,
            seq = message.sequence_number,
            "Session opened"
        );
        Ok(response)
    }

    pub async fn handle_commence_request(&self, message: Message) -> Result<Message> {
        self.serve_chained(message, "commence", commence::handle_request).await
    }

    pub async fn handle_lock_assertion_request(&self, message: Message) -> Result<Message> {
        self.serve_chained(message, "lock-assertion", lock_assertion::handle_request)
            .await
    }

    /// Create the asset on the recipient ledger and answer with the proof.
    ///
    /// If the create fails the server rolls its own session back before
    /// answering with the error.
    pub async fn handle_commit_request(&self, message: Message) -> Result<Message> {
        let _guard = self.store.lock(message.session_id).await;
        let session = self.store.get(&message.session_id).await?;
        if let Some(reply) = duplicate_reply(&session, &message) {
            return Ok(self.replayed(reply));
        }
        commit::validate_request(&session, &message).inspect_err(|err| self.log_rejection(&message, err))?;

        let adapter = self.ledger_for(&session)?;
        let asset_id = session.local_asset_id()?;
        let profile = require(&session.asset_profile, "asset_profile")?;
        let created = adapter
            .create(asset_id, profile.amount()?, profile.recipient_account()?)
            .await;

        let proof = match created {
            Ok(proof) => proof,
            Err(err) => {
                error!(parent: &self.span, session = %session.id, asset = asset_id, error = %err, "Recipient asset create failed");
                let mut failed = session.clone();
                failed.record_error(&err);
                if let Err(rollback_err) = self.rollback.run(&mut failed, &err.to_string()).await {
                    error!(parent: &self.span, session = %session.id, error = %rollback_err, "Rollback after failed create did not finish");
                }
                return Err(err);
            }
        };

        let ctx = self.ctx();
        let (mut next, response) = commit::respond_request(&session, &message, &proof, &ctx)?;
        self.store.save(&mut next).await?;
        self.audit_proof(&next, "commit", "CREATE", &proof).await;
        self.audit_transition(&next, "commit", LogStatus::Done, response.message_type)
            .await;
        info!(parent: &self.span, session = %next.id, asset = asset_id, proof = %proof, "Recipient asset created");
        Ok(response)
    }

    /// The client extinguished the source asset: commit the server session.
    pub async fn handle_transfer_complete(&self, message: Message) -> Result<Message> {
        let response = self
            .serve_chained(message, "transfer-complete", transfer_complete::handle_request)
            .await?;
        info!(parent: &self.span, session = %response.session_id, "Transfer committed");
        Ok(response)
    }

    /// Counterpart asks this gateway to roll its side of the session back.
    pub async fn handle_rollback_request(&self, message: Message) -> Result<Message> {
        let _guard = self.store.lock(message.session_id).await;
        let mut session = self.store.get(&message.session_id).await?;
        checks::check_control(&session, &message, MessageType::RollbackRequest)
            .inspect_err(|err| self.log_rejection(&message, err))?;
        let reason = &message.rollback_request()?.reason;

        info!(parent: &self.span, session = %session.id, reason = %reason, "Counterpart requested rollback");
        let outcome = self
            .rollback
            .run(&mut session, &format!("counterpart requested rollback: {reason}"))
            .await?;
        control::rollback_ack(&session, outcome.state, outcome.compensated, &self.ctx())
    }

    /// Answer with this side's view of the session and every entry this
    /// gateway logged for it after the requester's last one. Read-only.
    pub async fn handle_recover_request(&self, message: Message) -> Result<Message> {
        let session = self.store.get(&message.session_id).await?;
        checks::check_control(&session, &message, MessageType::RecoverRequest)
            .inspect_err(|err| self.log_rejection(&message, err))?;
        let since = message.recover_request()?.last_log_at;
        let recovered_logs = self.audit.read_session_since(&session.id, since).await?;
        debug!(
            parent: &self.span,
            session = %session.id,
            state = %session.state,
            step = session.step,
            entries = recovered_logs.len(),
            "Answering recover request"
        );
        control::recover_update(&session, recovered_logs, &self.ctx())
    }

    /// The counterpart finished replaying our log.
    pub async fn handle_recover_success(&self, message: Message) -> Result<Message> {
        let session = self.store.get(&message.session_id).await?;
        checks::check_control(&session, &message, MessageType::RecoverSuccess)
            .inspect_err(|err| self.log_rejection(&message, err))?;
        let body = message.recover_success()?;
        info!(
            parent: &self.span,
            session = %session.id,
            replayed = body.replayed,
            counterpart_state = %body.snapshot.state,
            counterpart_step = body.snapshot.step,
            "Counterpart recovered"
        );
        self.audit_transition(&session, "recover-success", LogStatus::Done, MessageType::RecoverSuccess)
            .await;
        control::recover_success_ack(&session, &self.ctx())
    }

    /// Apply a client request found in the client's log. Only requests
    /// with no ledger work are applied; `None` means the request was left
    /// for the client to re-send.
    pub(crate) async fn replay_request(&self, session: &SessionData, message: &Message) -> Result<Option<SessionData>> {
        let ctx = self.ctx();
        let (phase, handled) = match message.message_type {
            MessageType::CommenceRequest => ("commence", commence::handle_request(session, message, &ctx)),
            MessageType::LockAssertionRequest => (
                "lock-assertion",
                lock_assertion::handle_request(session, message, &ctx),
            ),
            MessageType::TransferCompleteRequest => (
                "transfer-complete",
                transfer_complete::handle_request(session, message, &ctx),
            ),
            _ => return Ok(None),
        };
        let (mut next, response) = handled.inspect_err(|err| self.log_rejection(message, err))?;
        self.store.save(&mut next).await?;
        self.audit_transition(&next, phase, LogStatus::Done, response.message_type)
            .await;
        info!(
            parent: &self.span,
            session = %next.id,
            message_type = %message.message_type,
            state = %next.state,
            step = next.step,
            "Replayed request from counterpart log"
        );
        Ok(Some(next))
    }

    /// Lock, load, replay duplicates, run a pure phase handler, persist.
    async fn serve_chained<F>(&self, message: Message, phase: &str, handler: F) -> Result<Message>
    where
        F: FnOnce(&SessionData, &Message, &PhaseContext<'_>) -> Result<(SessionData, Message)>,
    {
        let _guard = self.store.lock(message.session_id).await;
        let session = self.store.get(&message.session_id).await?;
        if let Some(reply) = duplicate_reply(&session, &message) {
            return Ok(self.replayed(reply));
        }

        let ctx = self.ctx();
        let (mut next, response) =
            handler(&session, &message, &ctx).inspect_err(|err| self.log_rejection(&message, err))?;
        self.store.save(&mut next).await?;
        self.audit_transition(&next, phase, LogStatus::Done, response.message_type)
            .await;
        info!(
            parent: &self.span,
            session = %next.id,
            state = %next.state,
            step = next.step,
            seq = next.last_sequence_number,
            "Request accepted"
        );
        Ok(response)
    }

    fn replay_or_reject(&self, session: &SessionData, message: &Message) -> Result<Message> {
        if let Some(reply) = duplicate_reply(session, message) {
            return Ok(self.replayed(reply));
        }
        let err = GatewayError::Validation {
            check: ValidationCheck::SequenceNumber,
            reason: format!("session {} is already open", session.id),
        };
        self.log_rejection(message, &err);
        Err(err)
    }

    fn replayed(&self, reply: &Message) -> Message {
        debug!(
            parent: &self.span,
            session = %reply.session_id,
            message_type = %reply.message_type,
            "Duplicate request answered from cache"
        );
        reply.clone()
    }
}
