//! Pure phase functions.
//!
//! Each phase module turns `(session, message, context)` into an updated
//! session and, where the role calls for it, a signed outbound message. The
//! functions never touch storage, ledgers or the network, and never mutate
//! their input: on error the caller's copy of the session is untouched.
//! The engine wires ledger calls, persistence and delivery around them.
//!
//! ## Inbound check order
//!
//! 1. message type tag
//! 2. sequence number (`last + 1`)
//! 3. previous-message hash
//! 4. declared public keys
//! 5. sender signature
//! 6. phase payload

pub mod checks;
pub mod commence;
pub mod commit;
pub mod control;
pub mod initialization;
pub mod lock_assertion;
pub mod transfer_complete;

use chrono::{DateTime, Utc};
use hermes_crypto::GatewayKeyPair;
use hermes_types::{DltSystem, GatewayId, Message, Payload, Result, SessionData, require};

/// What a phase function may know about the local gateway.
pub struct PhaseContext<'a> {
    pub key: &'a GatewayKeyPair,
    pub local_id: GatewayId,
    pub supported: &'a [DltSystem],
    pub now: DateTime<Utc>,
}

impl<'a> PhaseContext<'a> {
    #[must_use]
    pub fn new(key: &'a GatewayKeyPair, supported: &'a [DltSystem]) -> Self {
        Self {
            key,
            local_id: GatewayId(key.public_key()),
            supported,
            now: Utc::now(),
        }
    }
}

/// Build and sign the next chained message for `session`.
pub(crate) fn chained_envelope(session: &SessionData, payload: Payload, ctx: &PhaseContext<'_>) -> Result<Message> {
    Message {
        message_type: payload.message_type(),
        session_id: session.id,
        sequence_number: session.last_sequence_number + 1,
        hash_prev_message: session.last_hash().map(str::to_string),
        source_gateway_pubkey: *require(&session.source_gateway_pubkey, "source_gateway_pubkey")?,
        recipient_gateway_pubkey: *require(&session.recipient_gateway_pubkey, "recipient_gateway_pubkey")?,
        timestamp: ctx.now,
        payload,
        signature: String::new(),
    }
    .sign(ctx.key)
}

/// Record an outbound chained message on a copy of `session`.
pub(crate) fn record_outbound(session: &mut SessionData, message: &Message) -> Result<()> {
    session.append_link(message, None)?;
    session.last_outbound = Some(message.clone());
    Ok(())
}

/// Record an accepted inbound chained message.
pub(crate) fn record_inbound(session: &mut SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<()> {
    session.append_link(message, Some(ctx.now))
}

/// Build, sign and record a response to an accepted request.
pub(crate) fn respond(session: &mut SessionData, payload: Payload, ctx: &PhaseContext<'_>) -> Result<Message> {
    let response = chained_envelope(session, payload, ctx)?;
    record_outbound(session, &response)?;
    Ok(response)
}

/// The request whose cached response should be replayed, if `message` is
/// an exact duplicate of the last request this server accepted.
#[must_use]
pub fn duplicate_reply<'s>(session: &'s SessionData, message: &Message) -> Option<&'s Message> {
    let reply = session.last_outbound.as_ref()?;
    if message.message_type.response_type() != Some(reply.message_type) {
        return None;
    }
    let chain = session.chain();
    let request_link = chain.len().checked_sub(2).and_then(|i| chain.get(i))?;
    let hash = message.hash().ok()?;
    (request_link.message_type == message.message_type && request_link.hash == hash).then_some(reply)
}
