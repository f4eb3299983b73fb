//! Callback signature verification
//!
//! The platform signs every callback with
//! `sha1(sort(token, timestamp, nonce, ciphertext))` rendered as lowercase
//! hex. The same computation signs outbound reply envelopes.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Computes and verifies callback signatures for a configured token.
#[derive(Clone)]
pub struct CallbackSignature {
    token: String,
}

impl CallbackSignature {
    /// Create a signer for the shared callback token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Compute the signature over (token, timestamp, nonce, ciphertext).
    ///
    /// The four inputs are sorted lexicographically before hashing, which
    /// is what the platform computes on its side.
    #[must_use]
    pub fn compute(&self, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, ciphertext];
        parts.sort_unstable();

        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        to_hex(&hasher.finalize())
    }

    /// Verify a supplied signature against the recomputed one.
    ///
    /// Returns `false` for a non-numeric timestamp, an empty nonce, or any
    /// signature mismatch. The comparison is constant-time.
    #[must_use]
    pub fn verify(
        &self,
        timestamp: &str,
        nonce: &str,
        ciphertext: &str,
        supplied: &str,
    ) -> bool {
        if timestamp.is_empty() || timestamp.parse::<u64>().is_err() {
            return false;
        }
        if nonce.is_empty() {
            return false;
        }

        let expected = self.compute(timestamp, nonce, ciphertext);
        let supplied = supplied.to_ascii_lowercase();
        expected.as_bytes().ct_eq(supplied.as_bytes()).into()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        s.push_str(&format!("{byte:02x}"));
    }
    s
}
