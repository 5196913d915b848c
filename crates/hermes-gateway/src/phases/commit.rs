//! Phase 4: Commit.
//!
//! The server creates the asset on the recipient ledger and answers with the
//! create proof; the client then extinguishes the source asset. Ledger calls
//! happen in the engine between the validate and respond halves below.

use hermes_types::{
    CommitRequest, CommitResponse, GatewayError, Message, MessageType, Payload, Result, RollbackAction,
    SessionData, SessionState, require,
};

use super::checks::{self, expect_client, expect_server, expect_stage};
use super::{PhaseContext, chained_envelope, record_inbound, record_outbound, respond};

pub fn build_request(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_client(session)?;
    expect_stage(session, SessionState::Locked, 3, SessionState::Committed)?;

    let body = CommitRequest {
        asset_profile_hash: require(&session.asset_profile_hash, "asset_profile_hash")?.clone(),
    };

    let mut next = session.clone();
    let message = chained_envelope(&next, Payload::CommitRequest(body), ctx)?;
    record_outbound(&mut next, &message)?;
    Ok((next, message))
}

/// Server: every check that must pass before the recipient ledger is touched.
pub fn validate_request(session: &SessionData, message: &Message) -> Result<()> {
    expect_server(session)?;
    checks::check_chained(session, message, MessageType::CommitRequest)?;
    let body = message.commit_request()?;
    expect_stage(session, SessionState::Locked, 3, SessionState::Committed)?;
    if body.asset_profile_hash != *require(&session.asset_profile_hash, "asset_profile_hash")? {
        return Err(GatewayError::payload(
            "asset profile hash does not match the one agreed at commence",
        ));
    }
    Ok(())
}

/// Server: journal the create and answer with its proof.
pub fn respond_request(
    session: &SessionData,
    message: &Message,
    create_proof: &str,
    ctx: &PhaseContext<'_>,
) -> Result<(SessionData, Message)> {
    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.record_action(RollbackAction::Create, create_proof);
    next.create_proof = Some(create_proof.to_string());
    next.complete_step(4);

    let response = respond(
        &mut next,
        Payload::CommitResponse(CommitResponse {
            create_proof: create_proof.to_string(),
        }),
        ctx,
    )?;
    Ok((next, response))
}

pub fn accept_response(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<SessionData> {
    expect_client(session)?;
    checks::check_chained(session, message, MessageType::CommitResponse)?;
    let body = message.commit_response()?;
    expect_stage(session, SessionState::Locked, 3, SessionState::Committed)?;
    if body.create_proof.is_empty() {
        return Err(GatewayError::payload("create proof is empty"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.create_proof = Some(body.create_proof.clone());
    next.complete_step(4);
    Ok(next)
}

/// Client: journal the extinguish of the source asset.
pub fn record_extinguish(session: &SessionData, proof: &str) -> Result<SessionData> {
    expect_client(session)?;
    expect_stage(session, SessionState::Locked, 4, SessionState::Committed)?;
    let mut next = session.clone();
    next.record_action(RollbackAction::Delete, proof);
    next.extinguish_proof = Some(proof.to_string());
    Ok(next)
}

/// Mark the transfer final. Nothing is left to compensate afterwards.
pub fn finalize(session: &SessionData) -> Result<SessionData> {
    expect_stage(session, SessionState::Locked, 4, SessionState::Committed)?;
    require(&session.create_proof, "create_proof")?;
    let mut next = session.clone();
    next.transition(SessionState::Committed)?;
    next.clear_journal();
    Ok(next)
}

#[cfg(test)]
mod tests {
    use hermes_types::{GatewayRole, RetryPolicy, SessionId};

    use super::*;

    fn locked_client_at(step: u32) -> SessionData {
        let mut s = SessionData::new(SessionId::new(), GatewayRole::Client, RetryPolicy::default());
        s.state = SessionState::Locked;
        s.step = step;
        s.record_action(RollbackAction::Lock, "lock-A1-ok");
        s.create_proof = Some("create-B1-ok".into());
        s
    }

    #[test]
    fn finalize_clears_journal() {
        let s = record_extinguish(&locked_client_at(4), "delete-A1-ok").unwrap();
        assert_eq!(s.rollback_actions_performed(), &[RollbackAction::Lock, RollbackAction::Delete]);

        let done = finalize(&s).unwrap();
        assert_eq!(done.state, SessionState::Committed);
        assert!(done.rollback_actions_performed().is_empty());
        assert!(done.rollback_proofs().is_empty());
        assert_eq!(done.extinguish_proof.as_deref(), Some("delete-A1-ok"));
    }

    #[test]
    fn finalize_requires_commit_step() {
        let err = finalize(&locked_client_at(3)).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    }

    #[test]
    fn extinguish_leaves_input_untouched() {
        let s = locked_client_at(4);
        let _ = record_extinguish(&s, "delete-A1-ok").unwrap();
        assert!(s.extinguish_proof.is_none());
        assert_eq!(s.rollback_actions_performed().len(), 1);
    }
}
