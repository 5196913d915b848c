//! ed25519 gateway identities.
//!
//! Each gateway holds one [`GatewayKeyPair`]. Its 32-byte public key is the
//! gateway's identity on the wire (hex-encoded) and is pinned into every
//! session at Initialization.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;

use crate::{CryptoError, Result, signing_payload};

/// Length in bytes of a raw ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length in bytes of a raw ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// A gateway's signing key.
pub struct GatewayKeyPair {
    signing: SigningKey,
}

impl GatewayKeyPair {
    /// Fresh key from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a key from its 32-byte secret seed.
    #[must_use]
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// Rebuild a key from a hex-encoded 32-byte secret seed.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = from_hex(secret)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("secret must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_secret_bytes(&seed))
    }

    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    #[must_use]
    pub fn public_key_hex(&self) -> String {
        to_hex(&self.public_key())
    }

    /// Sign raw bytes.
    #[must_use]
    pub fn sign_bytes(&self, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(payload).to_bytes()
    }

    /// Sign the canonical form of `value` with its `signature` field blanked.
    /// Returns the hex-encoded signature.
    pub fn sign_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let payload = signing_payload(value)?;
        Ok(to_hex(&self.sign_bytes(&payload)))
    }
}

impl std::fmt::Debug for GatewayKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `payload`. Malformed keys or signatures yield `false`.
#[must_use]
pub fn verify_bytes(public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(payload, &sig).is_ok()
}

/// Verify a hex signature over the canonical form of `value`, re-blanking
/// its `signature` field first.
#[must_use]
pub fn verify_object<T: Serialize + ?Sized>(public_key_hex: &str, value: &T, signature_hex: &str) -> bool {
    let (Ok(key), Ok(sig)) = (from_hex(public_key_hex), from_hex(signature_hex)) else {
        return false;
    };
    let Ok(payload) = signing_payload(value) else {
        return false;
    };
    verify_bytes(&key, &payload, &sig)
}

#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(s)?)
}
