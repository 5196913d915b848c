//! # hermes-types
//!
//! Shared types, errors, and configuration for the **Hermes** cross-chain
//! transfer gateway.
//!
//! This crate sits directly above `hermes-crypto`; every other crate in the
//! workspace depends on it. It defines:
//!
//! - **Identifiers**: [`SessionId`], [`GatewayId`]
//! - **Asset model**: [`AssetProfile`]
//! - **Session model**: [`SessionData`], [`SessionState`], [`GatewayRole`],
//!   [`RollbackAction`], [`ChainLink`]
//! - **Wire model**: [`Message`], [`MessageType`], [`Payload`]
//! - **Transfer requests**: [`TransferRequest`]
//! - **Configuration**: [`GatewayConfig`], [`LedgerConfig`], [`DltSystem`], [`RetryPolicy`]
//! - **Audit model**: [`LocalLogEntry`], [`RemoteLogEntry`], [`LogStatus`]
//! - **Errors**: [`GatewayError`] with `HG_ERR_` prefix codes
//! - **Constants**: protocol defaults

pub mod asset;
pub mod audit;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod message;
pub mod session;
pub mod transfer;

pub use asset::*;
pub use audit::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use message::*;
pub use session::*;
pub use transfer::*;

// Constants are accessed via `hermes_types::constants::FOO`.
