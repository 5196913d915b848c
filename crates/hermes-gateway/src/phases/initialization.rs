//! Phase 1: Initialization.
//!
//! The client proposes the transfer: asset profile, ledgers on both sides,
//! asset ids and retry policy. The server checks that it can take part and
//! opens its own copy of the session. Keys and ledgers are pinned here for
//! the lifetime of the session.

use hermes_types::{
    GatewayError, GatewayRole, InitializationRequest, InitializationResponse, Message, MessageType, Payload,
    Result, SessionData, SessionState, constants, require,
};

use super::checks::{self, expect_client};
use super::{PhaseContext, chained_envelope, record_inbound, record_outbound, respond};

/// Client: build the opening request for a fresh session.
pub fn build_request(session: &SessionData, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    expect_client(session)?;
    if session.state != SessionState::Created {
        return Err(GatewayError::InvalidTransition {
            from: session.state,
            to: SessionState::Initialized,
        });
    }
    let source_dlt = *require(&session.source_gateway_dlt_system, "source_gateway_dlt_system")?;
    if !ctx.supported.contains(&source_dlt) {
        return Err(GatewayError::LedgerNotRegistered(source_dlt));
    }

    let body = InitializationRequest {
        version: session.version.clone(),
        asset_profile: require(&session.asset_profile, "asset_profile")?.clone(),
        source_dlt_system: source_dlt,
        recipient_dlt_system: *require(&session.recipient_gateway_dlt_system, "recipient_gateway_dlt_system")?,
        source_base_path: require(&session.source_base_path, "source_base_path")?.clone(),
        recipient_base_path: require(&session.recipient_base_path, "recipient_base_path")?.clone(),
        source_ledger_asset_id: require(&session.source_ledger_asset_id, "source_ledger_asset_id")?.clone(),
        recipient_ledger_asset_id: require(&session.recipient_ledger_asset_id, "recipient_ledger_asset_id")?
            .clone(),
        retry: session.retry,
    };

    let mut next = session.clone();
    let message = chained_envelope(&next, Payload::InitializationRequest(body), ctx)?;
    record_outbound(&mut next, &message)?;
    Ok((next, message))
}

/// Server: run every check on an opening request that does not need the ledger.
pub fn validate_request<'m>(message: &'m Message, ctx: &PhaseContext<'_>) -> Result<&'m InitializationRequest> {
    checks::check_opening(message, MessageType::InitializationRequest, ctx)?;
    let body = message.initialization_request()?;

    if body.version != constants::PROTOCOL_VERSION {
        return Err(GatewayError::payload(format!(
            "unsupported protocol version {}",
            body.version
        )));
    }
    body.asset_profile.validate()?;
    if body.asset_profile.is_expired(ctx.now) {
        return Err(GatewayError::payload("asset has expired"));
    }
    if !ctx.supported.contains(&body.recipient_dlt_system) {
        return Err(GatewayError::payload(format!(
            "recipient ledger {} is not supported by this gateway",
            body.recipient_dlt_system
        )));
    }
    if body.recipient_ledger_asset_id.is_empty() || body.source_ledger_asset_id.is_empty() {
        return Err(GatewayError::payload("ledger asset ids are required"));
    }
    if body.retry.max_timeout_ms == 0 {
        return Err(GatewayError::payload("max timeout must be positive"));
    }
    Ok(body)
}

/// Server: open the session and answer.
pub fn accept_request(message: &Message, ctx: &PhaseContext<'_>) -> Result<(SessionData, Message)> {
    let body = validate_request(message, ctx)?;
    let asset_profile_hash = body.asset_profile.profile_hash()?;

    let mut session = SessionData::new(message.session_id, GatewayRole::Server, body.retry);
    session.version.clone_from(&body.version);
    session.pin_parties(
        message.source_gateway_pubkey,
        message.recipient_gateway_pubkey,
        body.source_dlt_system,
        body.recipient_dlt_system,
    )?;
    session.source_base_path = Some(body.source_base_path.clone());
    session.recipient_base_path = Some(body.recipient_base_path.clone());
    session.source_ledger_asset_id = Some(body.source_ledger_asset_id.clone());
    session.recipient_ledger_asset_id = Some(body.recipient_ledger_asset_id.clone());
    session.asset_profile = Some(body.asset_profile.clone());
    session.asset_profile_hash = Some(asset_profile_hash.clone());

    record_inbound(&mut session, message, ctx)?;
    session.transition(SessionState::Initialized)?;
    session.complete_step(1);

    let response = respond(
        &mut session,
        Payload::InitializationResponse(InitializationResponse { asset_profile_hash }),
        ctx,
    )?;
    Ok((session, response))
}

/// Client: accept the server's answer.
pub fn accept_response(session: &SessionData, message: &Message, ctx: &PhaseContext<'_>) -> Result<SessionData> {
    expect_client(session)?;
    checks::check_chained(session, message, MessageType::InitializationResponse)?;
    let body = message.initialization_response()?;
    if Some(&body.asset_profile_hash) != session.asset_profile_hash.as_ref() {
        return Err(GatewayError::payload("server asset profile hash does not match ours"));
    }

    let mut next = session.clone();
    record_inbound(&mut next, message, ctx)?;
    next.transition(SessionState::Initialized)?;
    next.complete_step(1);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use hermes_crypto::GatewayKeyPair;
    use hermes_types::{AssetProfile, DltSystem, GatewayId, RetryPolicy, TransferRequest, ValidationCheck};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;

    const SUPPORTED: &[DltSystem] = &[DltSystem::InMemory];

    fn client_session(server: &GatewayKeyPair, client: &GatewayKeyPair, profile: AssetProfile) -> SessionData {
        TransferRequest {
            version: constants::PROTOCOL_VERSION.into(),
            asset_profile: profile,
            source_dlt_system: DltSystem::InMemory,
            recipient_dlt_system: DltSystem::InMemory,
            recipient_gateway_pubkey: GatewayId(server.public_key()),
            recipient_base_path: "http://server".into(),
            source_ledger_asset_id: "A1".into(),
            recipient_ledger_asset_id: "A1-wrapped".into(),
            originator_pubkey: "alice".into(),
            beneficiary_pubkey: "bob".into(),
            retry: None,
        }
        .into_session(GatewayId(client.public_key()), "http://client", RetryPolicy::default())
        .unwrap()
    }

    #[test]
    fn handshake_opens_both_sides() {
        let (client_key, server_key) = (GatewayKeyPair::generate(), GatewayKeyPair::generate());
        let client = client_session(&server_key, &client_key, AssetProfile::dummy("A1", Decimal::new(100, 0)));
        let client_ctx = PhaseContext::new(&client_key, SUPPORTED);
        let server_ctx = PhaseContext::new(&server_key, SUPPORTED);

        let (sent, request) = build_request(&client, &client_ctx).unwrap();
        assert_eq!(request.sequence_number, client.last_sequence_number + 1);
        assert!(request.hash_prev_message.is_none());

        let (server, response) = accept_request(&request, &server_ctx).unwrap();
        assert_eq!(server.role, GatewayRole::Server);
        assert_eq!(server.state, SessionState::Initialized);
        assert_eq!(server.asset_profile_hash, client.asset_profile_hash);
        assert_eq!(response.sequence_number, request.sequence_number + 1);

        let opened = accept_response(&sent, &response, &client_ctx).unwrap();
        assert_eq!(opened.step, 1);
        assert_eq!(opened.last_hash(), server.last_hash());
    }

    #[test]
    fn expired_profile_is_refused() {
        let (client_key, server_key) = (GatewayKeyPair::generate(), GatewayKeyPair::generate());
        let mut profile = AssetProfile::dummy("A1", Decimal::new(100, 0));
        profile.expiration_date = chrono::Utc::now() - Duration::minutes(1);
        let client = client_session(&server_key, &client_key, profile);

        let (_, request) = build_request(&client, &PhaseContext::new(&client_key, SUPPORTED)).unwrap();
        let err = accept_request(&request, &PhaseContext::new(&server_key, SUPPORTED)).unwrap_err();
        assert_eq!(err.to_string(), "HG_ERR_100: Validation failed at payload: asset has expired");
    }

    #[test]
    fn request_to_another_gateway_is_refused() {
        let (client_key, server_key) = (GatewayKeyPair::generate(), GatewayKeyPair::generate());
        let client = client_session(&server_key, &client_key, AssetProfile::dummy("A1", Decimal::new(100, 0)));
        let (_, request) = build_request(&client, &PhaseContext::new(&client_key, SUPPORTED)).unwrap();

        let stranger = GatewayKeyPair::generate();
        let err = accept_request(&request, &PhaseContext::new(&stranger, SUPPORTED)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { check: ValidationCheck::PublicKeys, .. }));
    }

    proptest! {
        #[test]
        fn response_out_of_sequence_is_refused(skew in 2u64..1_000) {
            let (client_key, server_key) = (GatewayKeyPair::generate(), GatewayKeyPair::generate());
            let client = client_session(&server_key, &client_key, AssetProfile::dummy("A1", Decimal::new(100, 0)));
            let client_ctx = PhaseContext::new(&client_key, SUPPORTED);
            let (sent, request) = build_request(&client, &client_ctx).unwrap();
            let (_, response) = accept_request(&request, &PhaseContext::new(&server_key, SUPPORTED)).unwrap();

            let mut late = response;
            late.sequence_number = request.sequence_number + skew;
            let late = late.sign(&server_key).unwrap();
            let err = accept_response(&sent, &late, &client_ctx).unwrap_err();
            let rejected_on_sequence = matches!(err, GatewayError::Validation { check: ValidationCheck::SequenceNumber, .. });
            prop_assert!(rejected_on_sequence);
        }
    }
}
