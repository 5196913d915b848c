//! # hermes-gateway
//!
//! Protocol engine for the **Hermes** cross-chain asset-transfer gateway.
//!
//! A transfer is a two-party session. The client gateway owns the source
//! asset and drives four phases; the server gateway creates the asset on
//! the recipient ledger:
//!
//! ```text
//! client                                   server
//!   | -- InitializationRequest ------------> |  open session
//!   | <------------ InitializationResponse - |
//!   | -- CommenceRequest ------------------> |  bind parties
//!   | <------------------ CommenceResponse - |
//!   |  lock source asset
//!   | -- LockAssertionRequest -------------> |  check lock proof
//!   | <------------- LockAssertionResponse - |
//!   | -- CommitRequest --------------------> |  create recipient asset
//!   | <-------------------- CommitResponse - |
//!   |  extinguish source asset
//!   | -- TransferCompleteRequest ----------> |  commit
//!   | <---------- TransferCompleteResponse - |
//! ```
//!
//! - [`phases`]: pure per-phase build/validate functions.
//! - [`Gateway`]: wires phases to the session store, ledgers, transport and
//!   audit log; client and server roles.
//! - [`RollbackCoordinator`]: compensates journaled ledger changes.
//! - Recovery: [`Gateway::recover_open_sessions`] decides between resuming
//!   and rolling back after a restart.

mod admin;
mod client;
mod engine;
pub mod ledger;
pub mod phases;
mod recovery;
pub mod retry;
pub mod rollback;
mod server;
pub mod transport;

pub use admin::{HealthReport, SessionStatus};
pub use engine::{Gateway, GatewayBuilder, PhaseOutcome};
pub use ledger::*;
pub use recovery::RecoveryReport;
pub use retry::deliver_with_retry;
pub use rollback::{RollbackCoordinator, RollbackOutcome};
pub use transport::*;
