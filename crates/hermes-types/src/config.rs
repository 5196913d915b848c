//! Configuration types for Hermes gateways.
//!
//! A gateway declares which ledgers it can operate on as a list of
//! [`LedgerConfig`] variants, each carrying its connector settings. The
//! set of supported [`DltSystem`]s is derived from that list.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result, constants};

/// Ledger family identifier exchanged during Initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum DltSystem {
    #[serde(rename = "DLT_FABRIC")]
    Fabric,
    #[serde(rename = "DLT_BESU")]
    Besu,
    #[serde(rename = "DLT_ETHEREUM")]
    Ethereum,
    #[serde(rename = "DLT_IN_MEMORY")]
    InMemory,
}

impl fmt::Display for DltSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fabric => write!(f, "DLT_FABRIC"),
            Self::Besu => write!(f, "DLT_BESU"),
            Self::Ethereum => write!(f, "DLT_ETHEREUM"),
            Self::InMemory => write!(f, "DLT_IN_MEMORY"),
        }
    }
}

/// Per-ledger connector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerConfig {
    Fabric {
        channel_name: String,
        contract_name: String,
        #[serde(default)]
        connection_profile: Option<String>,
    },
    Besu {
        rpc_url: String,
        contract_name: String,
        #[serde(default)]
        contract_address: Option<String>,
    },
    Ethereum {
        rpc_url: String,
        chain_id: u64,
        contract_address: String,
    },
    InMemory,
}

impl LedgerConfig {
    #[must_use]
    pub fn dlt_system(&self) -> DltSystem {
        match self {
            Self::Fabric { .. } => DltSystem::Fabric,
            Self::Besu { .. } => DltSystem::Besu,
            Self::Ethereum { .. } => DltSystem::Ethereum,
            Self::InMemory => DltSystem::InMemory,
        }
    }
}

/// Bounded retry policy for outbound deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-sends allowed after the first attempt.
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub max_timeout_ms: u64,
    /// Initial backoff; doubles per attempt up to [`constants::MAX_BACKOFF_MS`].
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    constants::DEFAULT_BACKOFF_MS
}

impl RetryPolicy {
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    /// Total attempts including the first one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before attempt `attempt` (1-based; the first attempt has none).
    #[must_use]
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(16);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << shift)
            .min(constants::MAX_BACKOFF_MS);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: constants::DEFAULT_MAX_RETRIES,
            max_timeout_ms: constants::DEFAULT_MAX_TIMEOUT_MS,
            backoff_ms: constants::DEFAULT_BACKOFF_MS,
        }
    }
}

/// Configuration for a single gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Human-readable gateway name; used as the logging span label.
    pub name: String,
    /// Address counterparts use to reach this gateway.
    pub base_path: String,
    /// Ledgers this gateway can operate on.
    pub ledgers: Vec<LedgerConfig>,
    /// Default retry policy for sessions that do not carry their own.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Run the Recovery Manager when the gateway starts.
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,
    /// Directory for the durable session store; `None` keeps state in memory.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Remote tamper-evident log endpoint; `None` disables mirroring.
    #[serde(default)]
    pub remote_log_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, base_path: impl Into<String>, ledgers: Vec<LedgerConfig>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            ledgers,
            retry: RetryPolicy::default(),
            recover_on_startup: true,
            data_dir: None,
            remote_log_url: None,
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(raw)
            .map_err(|e| GatewayError::Configuration(format!("invalid gateway config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Configuration("gateway name is empty".into()));
        }
        if self.base_path.trim().is_empty() {
            return Err(GatewayError::Configuration("base path is empty".into()));
        }
        if self.ledgers.is_empty() {
            return Err(GatewayError::Configuration("no ledgers configured".into()));
        }
        let mut seen = HashSet::new();
        for ledger in &self.ledgers {
            if !seen.insert(ledger.dlt_system()) {
                return Err(GatewayError::Configuration(format!(
                    "ledger {} configured twice",
                    ledger.dlt_system()
                )));
            }
        }
        if self.retry.max_timeout_ms == 0 {
            return Err(GatewayError::Configuration("retry.max_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn supported_dlts(&self) -> Vec<DltSystem> {
        self.ledgers.iter().map(LedgerConfig::dlt_system).collect()
    }

    #[must_use]
    pub fn supports(&self, dlt: DltSystem) -> bool {
        self.ledgers.iter().any(|l| l.dlt_system() == dlt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_json_with_defaults() {
        let raw = r#"{
            "name": "gw-fabric",
            "base_path": "http://localhost:4010",
            "ledgers": [
                {"type": "fabric", "channel_name": "mychannel", "contract_name": "asset-transfer"},
                {"type": "in_memory"}
            ]
        }"#;
        let cfg = GatewayConfig::from_json(raw).unwrap();
        assert_eq!(cfg.supported_dlts(), vec![DltSystem::Fabric, DltSystem::InMemory]);
        assert!(cfg.supports(DltSystem::Fabric));
        assert!(!cfg.supports(DltSystem::Besu));
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.recover_on_startup);
        assert!(cfg.remote_log_url.is_none());
    }

    #[test]
    fn duplicate_ledgers_rejected() {
        let cfg = GatewayConfig::new("gw", "http://x", vec![LedgerConfig::InMemory, LedgerConfig::InMemory]);
        assert!(matches!(cfg.validate().unwrap_err(), GatewayError::Configuration(_)));
    }

    #[test]
    fn empty_name_and_zero_timeout_rejected() {
        let mut cfg = GatewayConfig::new(" ", "http://x", vec![LedgerConfig::InMemory]);
        assert!(cfg.validate().is_err());
        cfg.name = "gw".into();
        cfg.retry.max_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dlt_wire_names() {
        assert_eq!(serde_json::to_string(&DltSystem::Besu).unwrap(), "\"DLT_BESU\"");
        assert_eq!(DltSystem::Fabric.to_string(), "DLT_FABRIC");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 20, max_timeout_ms: 10, backoff_ms: 100 };
        assert_eq!(policy.backoff_before(1), Duration::ZERO);
        assert_eq!(policy.backoff_before(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(20), Duration::from_millis(constants::MAX_BACKOFF_MS));
        assert_eq!(policy.attempts(), 21);
    }
}
