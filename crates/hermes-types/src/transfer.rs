//! Client-side transfer requests.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    AssetProfile, DltSystem, GatewayId, GatewayRole, Result, RetryPolicy, SessionData, SessionId, constants,
};

/// Everything a client-role gateway needs to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(default = "default_version")]
    pub version: String,
    pub asset_profile: AssetProfile,
    pub source_dlt_system: DltSystem,
    pub recipient_dlt_system: DltSystem,
    pub recipient_gateway_pubkey: GatewayId,
    pub recipient_base_path: String,
    pub source_ledger_asset_id: String,
    pub recipient_ledger_asset_id: String,
    pub originator_pubkey: String,
    pub beneficiary_pubkey: String,
    /// Overrides the gateway's default retry policy for this session.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_version() -> String {
    constants::PROTOCOL_VERSION.to_string()
}

impl TransferRequest {
    /// Open a client-role session at step 0.
    ///
    /// The initial sequence number is random; the first message sent
    /// carries `initial + 1`.
    pub fn into_session(
        self,
        local_pubkey: GatewayId,
        local_base_path: &str,
        default_retry: RetryPolicy,
    ) -> Result<SessionData> {
        self.asset_profile.validate()?;
        let mut session = SessionData::new(
            SessionId::new(),
            GatewayRole::Client,
            self.retry.unwrap_or(default_retry),
        );
        session.version = self.version;
        session.last_sequence_number = rand::thread_rng().gen_range(0..u64::from(u32::MAX));
        session.pin_parties(
            local_pubkey,
            self.recipient_gateway_pubkey,
            self.source_dlt_system,
            self.recipient_dlt_system,
        )?;
        session.source_base_path = Some(local_base_path.to_string());
        session.recipient_base_path = Some(self.recipient_base_path);
        session.asset_profile_hash = Some(self.asset_profile.profile_hash()?);
        session.asset_profile = Some(self.asset_profile);
        session.source_ledger_asset_id = Some(self.source_ledger_asset_id);
        session.recipient_ledger_asset_id = Some(self.recipient_ledger_asset_id);
        session.originator_pubkey = Some(self.originator_pubkey);
        session.beneficiary_pubkey = Some(self.beneficiary_pubkey);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn request() -> TransferRequest {
        TransferRequest {
            version: default_version(),
            asset_profile: AssetProfile::dummy("A1", Decimal::new(100, 0)),
            source_dlt_system: DltSystem::Fabric,
            recipient_dlt_system: DltSystem::Besu,
            recipient_gateway_pubkey: GatewayId([9; 32]),
            recipient_base_path: "http://server".into(),
            source_ledger_asset_id: "A1".into(),
            recipient_ledger_asset_id: "A1-wrapped".into(),
            originator_pubkey: "alice".into(),
            beneficiary_pubkey: "bob".into(),
            retry: None,
        }
    }

    #[test]
    fn session_opens_at_step_zero() {
        let s = request()
            .into_session(GatewayId([1; 32]), "http://client", RetryPolicy::default())
            .unwrap();
        assert_eq!(s.step, 0);
        assert_eq!(s.role, GatewayRole::Client);
        assert_eq!(s.local_asset_id().unwrap(), "A1");
        assert_eq!(s.counterpart_base_path().unwrap(), "http://server");
        assert!(s.asset_profile_hash.is_some());
        assert!(s.chain().is_empty());
    }

    #[test]
    fn request_retry_overrides_default() {
        let mut req = request();
        req.retry = Some(RetryPolicy { max_retries: 1, max_timeout_ms: 50, backoff_ms: 1 });
        let s = req
            .into_session(GatewayId([1; 32]), "http://client", RetryPolicy::default())
            .unwrap();
        assert_eq!(s.retry.max_retries, 1);
    }

    #[test]
    fn invalid_profile_rejected() {
        let mut req = request();
        req.asset_profile.chain_parameters.clear();
        assert!(req.into_session(GatewayId([1; 32]), "c", RetryPolicy::default()).is_err());
    }
}
