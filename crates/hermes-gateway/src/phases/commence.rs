//! Phase 2: Commence.
//!
//! Binds the originator and beneficiary identities to the session and
//! re-confirms the asset profile digest agreed during Initialization.

use hermes_types::{
    CommenceRequest, CommenceResponse, GatewayError, Message, MessageType, Payload, Result, SessionData,
    SessionState, require,
};

use super::checks::{self, expect_client, expect_server, expect_stage};
use super::{PhaseContext, chained_envelope, record_inbound, record_outbound, respond};

pub fn build_request(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_client(session)?;
    expect_stage(session, SessionState::Initialized, 1, SessionState::Commenced)?;

    let body = CommenceRequest {
        asset_profile_hash: require(&session.asset_profile_hash, "asset_profile_hash")?.clone(),
        originator_pubkey: require(&session.originator_pubkey, "originator_pubkey")?.clone(),
        beneficiary_pubkey: require(&session.beneficiary_pubkey, "beneficiary_pubkey")?.clone(),
    };

    let mut next = session.clone();
    let message = chained_envelope(&next, Payload::CommenceRequest(body), ctx)?;
    record_outbound(&mut next, &message)?;
    Ok((next, message))
}

pub fn handle_request(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_server(session)?;
    checks::check_chained(session, message, MessageType::CommenceRequest)?;
    let body = message.commence_request()?;
    expect_stage(session, SessionState::Initialized, 1, SessionState::Commenced)?;

    let agreed = require(&session.asset_profile_hash, "asset_profile_hash")?;
    if body.asset_profile_hash != *agreed {
        return Err(GatewayError::payload(
            "asset profile hash does not match the one agreed at initialization",
        ));
    }
    if body.originator_pubkey.is_empty() || body.beneficiary_pubkey.is_empty() {
        return Err(GatewayError::payload("originator and beneficiary are required"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.originator_pubkey = Some(body.originator_pubkey.clone());
    next.beneficiary_pubkey = Some(body.beneficiary_pubkey.clone());
    next.transition(SessionState::Commenced)?;
    next.complete_step(2);

    let response = respond(
        &mut next,
        Payload::CommenceResponse(CommenceResponse {
            asset_profile_hash: agreed.clone(),
        }),
        ctx,
    )?;
    Ok((next, response))
}

pub fn accept_response(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<SessionData> {
    expect_client(session)?;
    checks::check_chained(session, message, MessageType::CommenceResponse)?;
    let body = message.commence_response()?;
    expect_stage(session, SessionState::Initialized, 1, SessionState::Commenced)?;
    if Some(&body.asset_profile_hash) != session.asset_profile_hash.as_ref() {
        return Err(GatewayError::payload("server asset profile hash does not match ours"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.transition(SessionState::Commenced)?;
    next.complete_step(2);
    Ok(next)
}
