//! # hermes-store
//!
//! Durable state for the **Hermes** gateway.
//!
//! - **Repositories**: [`SessionRepository`] and [`LogRepository`] are the
//!   key-value capabilities the rest of the gateway persists through.
//!   [`MemoryRepository`] backs tests and ephemeral gateways;
//!   [`RedbRepository`] is the embedded on-disk store.
//! - **Session store**: [`SessionStore`] serialises access per session id
//!   while letting distinct sessions proceed in parallel.
//! - **Audit logging**: [`AuditLogger`] appends signed entries locally and
//!   mirrors `{key, hash, signature, signer}` through a [`RemoteLogSink`].

pub mod audit;
pub mod memory;
pub mod redb_store;
pub mod repository;
pub mod session_store;

pub use audit::*;
pub use memory::*;
pub use redb_store::*;
pub use repository::*;
pub use session_store::*;
