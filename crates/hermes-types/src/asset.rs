//! Asset profiles: what is being moved between ledgers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants::{CHAIN_PARAM_AMOUNT, CHAIN_PARAM_RECIPIENT_ACCOUNT, CHAIN_PARAM_SOURCE_ACCOUNT};
use crate::{GatewayError, Result};

/// Metadata describing the asset under transfer.
///
/// `chain_parameters` is an ordered list: `[amount, source account,
/// recipient account]`. Extra trailing entries are carried through
/// untouched for ledger-specific use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetProfile {
    pub issuer: String,
    pub asset_code: String,
    pub expiration_date: DateTime<Utc>,
    pub chain_parameters: Vec<String>,
}

impl AssetProfile {
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        asset_code: impl Into<String>,
        expiration_date: DateTime<Utc>,
        amount: Decimal,
        source_account: impl Into<String>,
        recipient_account: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            asset_code: asset_code.into(),
            expiration_date,
            chain_parameters: vec![amount.to_string(), source_account.into(), recipient_account.into()],
        }
    }

    /// Has the profile expired at `now`?
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration_date
    }

    /// The transfer amount. Must be a strictly positive decimal.
    pub fn amount(&self) -> Result<Decimal> {
        let raw = self.param(CHAIN_PARAM_AMOUNT, "amount")?;
        let amount = Decimal::from_str(raw)
            .map_err(|e| GatewayError::payload(format!("amount {raw:?} is not a decimal: {e}")))?;
        if amount <= Decimal::ZERO {
            return Err(GatewayError::payload(format!("amount must be positive, got {amount}")));
        }
        Ok(amount)
    }

    pub fn source_account(&self) -> Result<&str> {
        self.param(CHAIN_PARAM_SOURCE_ACCOUNT, "source account")
    }

    pub fn recipient_account(&self) -> Result<&str> {
        self.param(CHAIN_PARAM_RECIPIENT_ACCOUNT, "recipient account")
    }

    /// Structural checks shared by both roles.
    pub fn validate(&self) -> Result<()> {
        if self.issuer.is_empty() || self.asset_code.is_empty() {
            return Err(GatewayError::payload("issuer and asset code are required"));
        }
        self.amount()?;
        self.source_account()?;
        self.recipient_account()?;
        Ok(())
    }

    /// Digest binding the profile across phases.
    pub fn profile_hash(&self) -> Result<String> {
        hermes_crypto::hash_object(self).map_err(GatewayError::from)
    }

    fn param(&self, index: usize, name: &str) -> Result<&str> {
        self.chain_parameters
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::payload(format!("missing chain parameter: {name}")))
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl AssetProfile {
    /// A profile for `asset_code` moving `amount`, expiring one year out.
    #[must_use]
    pub fn dummy(asset_code: &str, amount: Decimal) -> Self {
        Self::new(
            "issuer:test",
            asset_code,
            Utc::now() + chrono::Duration::days(365),
            amount,
            "alice@source",
            "bob@recipient",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidationCheck;

    #[test]
    fn accessors_follow_parameter_order() {
        let p = AssetProfile::dummy("A1", Decimal::new(100, 0));
        assert_eq!(p.amount().unwrap(), Decimal::new(100, 0));
        assert_eq!(p.source_account().unwrap(), "alice@source");
        assert_eq!(p.recipient_account().unwrap(), "bob@recipient");
        assert!(p.validate().is_ok());
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let mut p = AssetProfile::dummy("A1", Decimal::ONE);
        let now = Utc::now();
        p.expiration_date = now;
        assert!(p.is_expired(now));
        p.expiration_date = now + chrono::Duration::seconds(1);
        assert!(!p.is_expired(now));
    }

    #[test]
    fn non_positive_amount_rejected() {
        let mut p = AssetProfile::dummy("A1", Decimal::ONE);
        p.chain_parameters[0] = "0".into();
        assert!(matches!(
            p.amount().unwrap_err(),
            GatewayError::Validation { check: ValidationCheck::Payload, .. }
        ));
        p.chain_parameters[0] = "ten".into();
        assert!(p.amount().is_err());
    }

    #[test]
    fn missing_accounts_rejected() {
        let mut p = AssetProfile::dummy("A1", Decimal::ONE);
        p.chain_parameters.truncate(1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn profile_hash_tracks_content() {
        let a = AssetProfile::dummy("A1", Decimal::ONE);
        let mut b = a.clone();
        assert_eq!(a.profile_hash().unwrap(), b.profile_hash().unwrap());
        b.asset_code = "A2".into();
        assert_ne!(a.profile_hash().unwrap(), b.profile_hash().unwrap());
    }
}
