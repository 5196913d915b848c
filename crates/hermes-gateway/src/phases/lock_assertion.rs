//! Phase 3: Lock-Assertion.
//!
//! The client locks the asset on the source ledger and asserts the lock to
//! the server with the ledger's proof. The `Lock` journal entry is written
//! only once the ledger call has returned.

use hermes_crypto::sha256_hex;
use hermes_types::{
    GatewayError, LockAssertionRequest, LockAssertionResponse, Message, MessageType, Payload, Result,
    RollbackAction, SessionData, SessionState, require,
};

use super::checks::{self, expect_client, expect_server, expect_stage};
use super::{PhaseContext, chained_envelope, record_inbound, record_outbound, respond};

/// Client: journal a successful source-ledger lock.
pub fn record_lock(session: &SessionData, proof: &str) -> Result<SessionData> {
    expect_client(session)?;
    expect_stage(session, SessionState::Commenced, 2, SessionState::Locked)?;
    let mut next = session.clone();
    next.record_action(RollbackAction::Lock, proof);
    next.lock_proof = Some(proof.to_string());
    next.transition(SessionState::Locked)?;
    Ok(next)
}

pub fn build_request(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_client(session)?;
    expect_stage(session, SessionState::Locked, 2, SessionState::Locked)?;

    let body = LockAssertionRequest {
        asset_profile_hash: require(&session.asset_profile_hash, "asset_profile_hash")?.clone(),
        lock_proof: require(&session.lock_proof, "lock_proof")?.clone(),
    };

    let mut next = session.clone();
    let message = chained_envelope(&next, Payload::LockAssertionRequest(body), ctx)?;
    record_outbound(&mut next, &message)?;
    Ok((next, message))
}

pub fn handle_request(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_server(session)?;
    checks::check_chained(session, message, MessageType::LockAssertionRequest)?;
    let body = message.lock_assertion_request()?;
    expect_stage(session, SessionState::Commenced, 2, SessionState::Locked)?;

    if body.asset_profile_hash != *require(&session.asset_profile_hash, "asset_profile_hash")? {
        return Err(GatewayError::payload(
            "asset profile hash does not match the one agreed at commence",
        ));
    }
    if body.lock_proof.is_empty() {
        return Err(GatewayError::payload("lock proof is empty"));
    }
    if require(&session.asset_profile, "asset_profile")?.is_expired(ctx.now) {
        return Err(GatewayError::payload("asset has expired"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.lock_proof = Some(body.lock_proof.clone());
    next.transition(SessionState::Locked)?;
    next.complete_step(3);

    let response = respond(
        &mut next,
        Payload::LockAssertionResponse(LockAssertionResponse {
            lock_proof_hash: sha256_hex(body.lock_proof.as_bytes()),
        }),
        ctx,
    )?;
    Ok((next, response))
}

pub fn accept_response(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<SessionData> {
    expect_client(session)?;
    checks::check_chained(session, message, MessageType::LockAssertionResponse)?;
    let body = message.lock_assertion_response()?;
    expect_stage(session, SessionState::Locked, 2, SessionState::Locked)?;

    let proof = require(&session.lock_proof, "lock_proof")?;
    if body.lock_proof_hash != sha256_hex(proof.as_bytes()) {
        return Err(GatewayError::payload("server recorded a different lock proof"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.complete_step(3);
    Ok(next)
}
