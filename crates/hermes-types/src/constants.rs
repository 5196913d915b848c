//! Protocol-wide constants and defaults.

/// Protocol version stamped into every new session.
pub const PROTOCOL_VERSION: &str = "v02";

/// Default number of re-sends after the first delivery attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default per-attempt delivery timeout in milliseconds.
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 5_000;

/// Initial backoff between delivery attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 200;

/// Upper bound on the backoff between delivery attempts in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 10_000;

/// Route prefix under a gateway's base path.
pub const API_PREFIX: &str = "/api/v1/satp";

/// Index of the transfer amount in `AssetProfile::chain_parameters`.
pub const CHAIN_PARAM_AMOUNT: usize = 0;

/// Index of the source-chain account in `AssetProfile::chain_parameters`.
pub const CHAIN_PARAM_SOURCE_ACCOUNT: usize = 1;

/// Index of the destination-chain account in `AssetProfile::chain_parameters`.
pub const CHAIN_PARAM_RECIPIENT_ACCOUNT: usize = 2;

/// Proof recorded when recovery finds a ledger mutation (a lock, a created
/// recipient asset, or an already-extinguished source asset) that the
/// session never saw confirmed.
pub const RECOVERED_PROOF: &str = "recovered:ledger-state";

/// Step reached once the lock assertion is accepted; a server may create
/// the recipient asset from here on.
pub const LOCKED_STEP: u32 = 3;

/// Highest step a session can reach (Commit completed).
pub const FINAL_STEP: u32 = 4;
