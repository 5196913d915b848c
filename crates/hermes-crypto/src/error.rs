//! Errors raised while encoding or decoding key material.
//!
//! Verification failures are deliberately *not* represented here:
//! [`crate::verify_bytes`] and [`crate::verify_object`] return `false`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The value could not be turned into canonical JSON.
    #[error("canonical encoding failed: {0}")]
    Encoding(String),

    /// A hex string was malformed.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Key material had the wrong length or was not a valid curve point.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<hex::FromHexError> for CryptoError {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidHex(err.to_string())
    }
}
