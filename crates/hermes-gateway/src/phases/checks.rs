//! Inbound message checks shared by every phase.

use hermes_types::{
    GatewayError, GatewayId, GatewayRole, Message, MessageType, Result, SessionData, SessionState,
    ValidationCheck, require,
};

use super::PhaseContext;

fn rejected(check: ValidationCheck, reason: String) -> GatewayError {
    GatewayError::Validation { check, reason }
}

fn check_type(message: &Message, expected: MessageType) -> Result<()> {
    if message.message_type != expected {
        return Err(rejected(
            ValidationCheck::MessageType,
            format!("expected {expected}, got {}", message.message_type),
        ));
    }
    Ok(())
}

fn check_signature(message: &Message, signer: &GatewayId) -> Result<()> {
    if !message.verify_signature(signer) {
        return Err(GatewayError::SignatureVerification {
            message_type: message.message_type.to_string(),
            signer: signer.to_string(),
        });
    }
    Ok(())
}

fn check_body(message: &Message) -> Result<()> {
    if !message.payload_matches_type() {
        return Err(rejected(
            ValidationCheck::Payload,
            format!(
                "{} envelope carries a {} body",
                message.message_type,
                message.payload.message_type()
            ),
        ));
    }
    Ok(())
}

fn check_keys(session: &SessionData, message: &Message) -> Result<()> {
    let source = require(&session.source_gateway_pubkey, "source_gateway_pubkey")?;
    let recipient = require(&session.recipient_gateway_pubkey, "recipient_gateway_pubkey")?;
    if message.source_gateway_pubkey != *source || message.recipient_gateway_pubkey != *recipient {
        return Err(rejected(
            ValidationCheck::PublicKeys,
            format!(
                "declared keys {} -> {} do not match session keys {source} -> {recipient}",
                message.source_gateway_pubkey, message.recipient_gateway_pubkey
            ),
        ));
    }
    Ok(())
}

/// Key the sender of `message` declared for itself, from the receiver's role.
fn declared_sender(receiver: GatewayRole, message: &Message) -> &GatewayId {
    match receiver {
        GatewayRole::Server => &message.source_gateway_pubkey,
        GatewayRole::Client => &message.recipient_gateway_pubkey,
    }
}

/// Full ordered check for a chained message on an existing session.
pub fn check_chained(session: &SessionData, message: &Message, expected: MessageType) -> Result<()> {
    check_type(message, expected)?;

    let want = session.last_sequence_number + 1;
    if message.sequence_number != want {
        return Err(rejected(
            ValidationCheck::SequenceNumber,
            format!("expected sequence {want}, got {}", message.sequence_number),
        ));
    }

    if message.hash_prev_message.as_deref() != session.last_hash() {
        return Err(rejected(
            ValidationCheck::PreviousHash,
            format!(
                "previous hash {:?} does not match recorded {:?}",
                message.hash_prev_message,
                session.last_hash()
            ),
        ));
    }

    check_keys(session, message)?;
    check_signature(message, declared_sender(session.role, message))?;
    check_body(message)
}

/// Checks for the message that opens a session on the server.
///
/// Its sequence number establishes the session's counter, it must not
/// reference a previous message, and it must be addressed to this gateway.
pub fn check_opening(message: &Message, expected: MessageType, ctx: &PhaseContext<'_>) -> Result<()> {
    check_type(message, expected)?;

    if message.sequence_number == u64::MAX {
        return Err(rejected(
            ValidationCheck::SequenceNumber,
            "opening sequence number leaves no room for replies".into(),
        ));
    }

    if let Some(prev) = &message.hash_prev_message {
        return Err(rejected(
            ValidationCheck::PreviousHash,
            format!("opening message references previous hash {prev}"),
        ));
    }

    if message.recipient_gateway_pubkey != ctx.local_id {
        return Err(rejected(
            ValidationCheck::PublicKeys,
            format!(
                "addressed to {}, this gateway is {}",
                message.recipient_gateway_pubkey, ctx.local_id
            ),
        ));
    }

    check_signature(message, &message.source_gateway_pubkey)?;
    check_body(message)
}

/// Checks for out-of-band control messages (rollback, recover): no
/// sequence or hash requirements.
pub fn check_control(session: &SessionData, message: &Message, expected: MessageType) -> Result<()> {
    check_type(message, expected)?;
    if message.session_id != session.id {
        return Err(rejected(
            ValidationCheck::Payload,
            format!("message for session {} delivered to {}", message.session_id, session.id),
        ));
    }
    check_keys(session, message)?;
    check_signature(message, declared_sender(session.role, message))?;
    check_body(message)
}

pub fn expect_client(session: &SessionData) -> Result<()> {
    if session.role != GatewayRole::Client {
        return Err(GatewayError::WrongRole {
            reason: format!("session {} is served, not driven, by this gateway", session.id),
        });
    }
    Ok(())
}

pub fn expect_server(session: &SessionData) -> Result<()> {
    if session.role != GatewayRole::Server {
        return Err(GatewayError::WrongRole {
            reason: format!("session {} is driven, not served, by this gateway", session.id),
        });
    }
    Ok(())
}

/// The session must sit at `state` with `step` completed before moving on
/// towards `next`.
pub fn expect_stage(session: &SessionData, state: SessionState, step: u32, next: SessionState) -> Result<()> {
    if session.state != state || session.step != step {
        return Err(GatewayError::InvalidTransition {
            from: session.state,
            to: next,
        });
    }
    Ok(())
}
