//! Out-of-band control messages: rollback notification and the recover
//! handshake.
//!
//! These are signed like every other message but sit outside the hash
//! chain: they carry the session's current sequence number and last hash
//! for reference and are never appended to the chain.

use chrono::{DateTime, Utc};
use hermes_types::{
    LocalLogEntry, Message, Payload, RecoverRequest, RecoverSuccess, RecoverSuccessAck, RecoverUpdate, Result,
    RollbackAck, RollbackAction, RollbackRequest, SessionData, SessionState, require,
};

use super::PhaseContext;

fn control_envelope(session: &SessionData, payload: Payload, ctx: &PhaseContext<'_>) -> Result<Message> {
    Message {
        message_type: payload.message_type(),
        session_id: session.id,
        sequence_number: session.last_sequence_number,
        hash_prev_message: session.last_hash().map(str::to_string),
        source_gateway_pubkey: *require(&session.source_gateway_pubkey, "source_gateway_pubkey")?,
        recipient_gateway_pubkey: *require(&session.recipient_gateway_pubkey, "recipient_gateway_pubkey")?,
        timestamp: ctx.now,
        payload,
        signature: String::new(),
    }
    .sign(ctx.key)
}

pub fn rollback_request(session: &SessionData, reason: &str, ctx: &PhaseContext<'_>) -> Result<Message> {
    control_envelope(
        session,
        Payload::RollbackRequest(RollbackRequest {
            reason: reason.to_string(),
        }),
        ctx,
    )
}

pub fn rollback_ack(
    session: &SessionData,
    state: SessionState,
    compensated: Vec<RollbackAction>,
    ctx: &PhaseContext<'_>,
) -> Result<Message> {
    control_envelope(session, Payload::RollbackAck(RollbackAck { state, compensated }), ctx)
}

pub fn recover_request(
    session: &SessionData,
    last_log_at: Option<DateTime<Utc>>,
    ctx: &PhaseContext<'_>,
) -> Result<Message> {
    control_envelope(
        session,
        Payload::RecoverRequest(RecoverRequest {
            snapshot: session.snapshot(),
            last_log_at,
        }),
        ctx,
    )
}

pub fn recover_update(
    session: &SessionData,
    recovered_logs: Vec<LocalLogEntry>,
    ctx: &PhaseContext<'_>,
) -> Result<Message> {
    control_envelope(
        session,
        Payload::RecoverUpdate(RecoverUpdate {
            snapshot: session.snapshot(),
            recovered_logs,
        }),
        ctx,
    )
}

pub fn recover_success(session: &SessionData, replayed: u32, ctx: &PhaseContext<'_>) -> Result<Message> {
    control_envelope(
        session,
        Payload::RecoverSuccess(RecoverSuccess {
            snapshot: session.snapshot(),
            replayed,
        }),
        ctx,
    )
}

pub fn recover_success_ack(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<Message> {
    control_envelope(session, Payload::RecoverSuccessAck(RecoverSuccessAck {}), ctx)
}
