//! HMAC-SHA256 body signing
//!
//! When a shared secret is configured, the agent signs each compressed
//! request body and the collector verifies it. The collector signs its
//! response bodies the same way. The signature travels hex-encoded in the
//! [`SIGNATURE_HEADER`] header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Result, TelemetronError};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC-SHA256 of the body
pub const SIGNATURE_HEADER: &str = "HashSHA256";

/// Signs and verifies bodies with a shared secret
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(key.as_ref())
            .map_err(|e| TelemetronError::signature(format!("Invalid signing key: {e}")))?;
        Ok(Self { mac })
    }

    /// Build a signer from a configured secret; an empty secret disables signing
    pub fn from_secret(secret: &str) -> Result<Option<Self>> {
        if secret.is_empty() {
            Ok(None)
        } else {
            Self::new(secret).map(Some)
        }
    }

    /// Hex-encoded HMAC-SHA256 of `body`
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a hex-encoded signature against `body` in constant time
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        let expected = hex::decode(signature.trim())
            .map_err(|e| TelemetronError::signature(format!("Malformed signature: {e}")))?;

        let mut mac = self.mac.clone();
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| TelemetronError::signature("Signature does not match body"))
    }
}
