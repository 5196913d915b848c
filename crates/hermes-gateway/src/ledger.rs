//! Ledger adapter capability.
//!
//! The engine never talks to a blockchain client directly. Each supported
//! ledger family is reached through a [`LedgerAdapter`] registered in the
//! gateway's [`LedgerRegistry`] under its [`DltSystem`].
//!
//! Adapters are assumed at-least-once but not idempotent: calling `unlock`
//! on an asset that is already unlocked may fail. Callers that may repeat
//! work (rollback, recovery) query `exists` / `is_locked` first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hermes_types::{DltSystem, GatewayError, LedgerCall, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Per-ledger operations the protocol needs. Every mutating call returns an
/// opaque proof (e.g. a serialised transaction receipt).
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    fn dlt_system(&self) -> DltSystem;

    async fn lock(&self, asset_id: &str) -> Result<String>;

    async fn unlock(&self, asset_id: &str) -> Result<String>;

    async fn create(&self, asset_id: &str, amount: Decimal, owner: &str) -> Result<String>;

    async fn delete(&self, asset_id: &str) -> Result<String>;

    async fn exists(&self, asset_id: &str) -> Result<bool>;

    async fn is_locked(&self, asset_id: &str) -> Result<bool>;
}

/// Adapters keyed by ledger family.
#[derive(Default, Clone)]
pub struct LedgerRegistry {
    adapters: HashMap<DltSystem, Arc<dyn LedgerAdapter>>,
}

impl LedgerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own [`DltSystem`], replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn LedgerAdapter>) {
        self.adapters.insert(adapter.dlt_system(), adapter);
    }

    pub fn get(&self, dlt: DltSystem) -> Result<Arc<dyn LedgerAdapter>> {
        self.adapters
            .get(&dlt)
            .cloned()
            .ok_or(GatewayError::LedgerNotRegistered(dlt))
    }

    #[must_use]
    pub fn contains(&self, dlt: DltSystem) -> bool {
        self.adapters.contains_key(&dlt)
    }
}

// ---------------------------------------------------------------------------
// InMemoryLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub amount: Decimal,
    pub owner: String,
    pub locked: bool,
}

/// Process-local ledger for the `DLT_IN_MEMORY` family.
///
/// Strict like a real chain: locking a locked asset, unlocking an unlocked
/// one, creating an existing one or deleting a missing one all fail.
/// Operations can be made to fail on demand and every call is counted.
pub struct InMemoryLedger {
    dlt: DltSystem,
    assets: Mutex<HashMap<String, AssetRecord>>,
    failing: Mutex<HashSet<LedgerCall>>,
    calls: Mutex<HashMap<LedgerCall, u32>>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::with_dlt(DltSystem::InMemory)
    }

    /// Present as another ledger family (e.g. to stand in for Fabric in tests).
    #[must_use]
    pub fn with_dlt(dlt: DltSystem) -> Self {
        Self {
            dlt,
            assets: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Put an unlocked asset on the ledger.
    pub fn seed(&self, asset_id: &str, amount: Decimal, owner: &str) {
        self.assets.lock().insert(
            asset_id.to_string(),
            AssetRecord {
                amount,
                owner: owner.to_string(),
                locked: false,
            },
        );
    }

    /// Make every subsequent `call` fail until [`Self::heal`].
    pub fn fail(&self, call: LedgerCall) {
        self.failing.lock().insert(call);
    }

    pub fn heal(&self, call: LedgerCall) {
        self.failing.lock().remove(&call);
    }

    #[must_use]
    pub fn asset(&self, asset_id: &str) -> Option<AssetRecord> {
        self.assets.lock().get(asset_id).cloned()
    }

    /// Number of times `call` was attempted, including failed attempts.
    #[must_use]
    pub fn call_count(&self, call: LedgerCall) -> u32 {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    fn enter(&self, call: LedgerCall, asset_id: &str) -> Result<()> {
        *self.calls.lock().entry(call).or_insert(0) += 1;
        if self.failing.lock().contains(&call) {
            return Err(ledger_error(call, asset_id, "injected failure"));
        }
        Ok(())
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn ledger_error(call: LedgerCall, asset_id: &str, reason: &str) -> GatewayError {
    GatewayError::Ledger {
        operation: call,
        asset_id: asset_id.to_string(),
        reason: reason.to_string(),
    }
}

fn proof(call: LedgerCall, asset_id: &str) -> String {
    format!("{call}-{asset_id}-ok")
}

#[async_trait]
impl LedgerAdapter for InMemoryLedger {
    fn dlt_system(&self) -> DltSystem {
        self.dlt
    }

    async fn lock(&self, asset_id: &str) -> Result<String> {
        self.enter(LedgerCall::Lock, asset_id)?;
        let mut assets = self.assets.lock();
        let record = assets
            .get_mut(asset_id)
            .ok_or_else(|| ledger_error(LedgerCall::Lock, asset_id, "no such asset"))?;
        if record.locked {
            return Err(ledger_error(LedgerCall::Lock, asset_id, "already locked"));
        }
        record.locked = true;
        Ok(proof(LedgerCall::Lock, asset_id))
    }

    async fn unlock(&self, asset_id: &str) -> Result<String> {
        self.enter(LedgerCall::Unlock, asset_id)?;
        let mut assets = self.assets.lock();
        let record = assets
            .get_mut(asset_id)
            .ok_or_else(|| ledger_error(LedgerCall::Unlock, asset_id, "no such asset"))?;
        if !record.locked {
            return Err(ledger_error(LedgerCall::Unlock, asset_id, "not locked"));
        }
        record.locked = false;
        Ok(proof(LedgerCall::Unlock, asset_id))
    }

    async fn create(&self, asset_id: &str, amount: Decimal, owner: &str) -> Result<String> {
        self.enter(LedgerCall::Create, asset_id)?;
        let mut assets = self.assets.lock();
        if assets.contains_key(asset_id) {
            return Err(ledger_error(LedgerCall::Create, asset_id, "already exists"));
        }
        assets.insert(
            asset_id.to_string(),
            AssetRecord {
                amount,
                owner: owner.to_string(),
                locked: false,
            },
        );
        Ok(proof(LedgerCall::Create, asset_id))
    }

    async fn delete(&self, asset_id: &str) -> Result<String> {
        self.enter(LedgerCall::Delete, asset_id)?;
        self.assets
            .lock()
            .remove(asset_id)
            .map(|_| proof(LedgerCall::Delete, asset_id))
            .ok_or_else(|| ledger_error(LedgerCall::Delete, asset_id, "no such asset"))
    }

    async fn exists(&self, asset_id: &str) -> Result<bool> {
        self.enter(LedgerCall::Exists, asset_id)?;
        Ok(self.assets.lock().contains_key(asset_id))
    }

    async fn is_locked(&self, asset_id: &str) -> Result<bool> {
        self.enter(LedgerCall::IsLocked, asset_id)?;
        Ok(self.assets.lock().get(asset_id).is_some_and(|r| r.locked))
    }
}
