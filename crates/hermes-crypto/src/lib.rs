//! # hermes-crypto
//!
//! Hashing and signing primitives for the **Hermes** gateway protocol.
//!
//! Everything here is pure: no I/O, no clocks, no global state. The
//! protocol engine uses these functions to build the per-session hash
//! chain and to sign and verify every message exchanged between gateways.
//!
//! - **Canonical encoding**: [`canonical_json`] serialises any `Serialize`
//!   value with object keys sorted at every depth, so field order never
//!   affects a digest.
//! - **Hashing**: [`hash_object`] / [`sha256_hex`] (lowercase hex SHA-256).
//! - **Signing**: [`GatewayKeyPair`] (ed25519) with [`verify_bytes`] and
//!   [`verify_object`] on the receiving side.

pub mod canonical;
pub mod error;
pub mod keys;

pub use canonical::*;
pub use error::*;
pub use keys::*;
