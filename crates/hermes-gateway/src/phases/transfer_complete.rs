//! Transfer-complete notification.
//!
//! Sent by the client once the source asset is extinguished. The server
//! stays `Locked` with its create journaled until this arrives (or until
//! recovery learns the client's outcome).

use hermes_types::{
    GatewayError, Message, MessageType, Payload, Result, SessionData, SessionState, TransferCompleteRequest,
    TransferCompleteResponse, require,
};

use super::checks::{self, expect_client, expect_server, expect_stage};
use super::{PhaseContext, chained_envelope, record_inbound, record_outbound, respond};

pub fn build_request(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_client(session)?;
    expect_stage(session, SessionState::Locked, 4, SessionState::Committed)?;

    let body = TransferCompleteRequest {
        extinguish_proof: require(&session.extinguish_proof, "extinguish_proof")?.clone(),
    };

    let mut next = session.clone();
    let message = chained_envelope(&next, Payload::TransferCompleteRequest(body), ctx)?;
    record_outbound(&mut next, &message)?;
    Ok((next, message))
}

pub fn handle_request(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_server(session)?;
    checks::check_chained(session, message, MessageType::TransferCompleteRequest)?;
    let body = message.transfer_complete_request()?;
    expect_stage(session, SessionState::Locked, 4, SessionState::Committed)?;
    if body.extinguish_proof.is_empty() {
        return Err(GatewayError::payload("extinguish proof is empty"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.extinguish_proof = Some(body.extinguish_proof.clone());
    next.transition(SessionState::Committed)?;
    next.clear_journal();

    let response = respond(
        &mut next,
        Payload::TransferCompleteResponse(TransferCompleteResponse {}),
        ctx,
    )?;
    Ok((next, response))
}

/// Client: record the server's acknowledgement on the chain.
pub fn accept_response(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<SessionData> {
    expect_client(session)?;
    checks::check_chained(session, message, MessageType::TransferCompleteResponse)?;
    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    Ok(next)
}
