//! Conflict-parameter fingerprints
//!
//! The sequencer resolves transactions against fixed-width fingerprints
//! rather than the conflict parameters themselves. A fingerprint is the
//! SHA-256 digest of the canonical JSON serialization of the parameter.
//!
//! The ALL sentinel — "conflicts with any update on this stream" — is the
//! reserved zero-length fingerprint.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte digest of one conflict parameter, or the zero-length ALL
/// sentinel.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// The whole-stream sentinel.
    pub fn all() -> Self {
        Fingerprint(Vec::new())
    }

    /// Fingerprint a concrete conflict parameter.
    pub fn of(param: &Value) -> Self {
        let bytes =
            serde_json::to_vec(param).expect("Value serialization is infallible");
        let digest = Sha256::digest(&bytes);
        Fingerprint(digest.to_vec())
    }

    /// True if this is the whole-stream sentinel.
    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw digest bytes (empty for the ALL sentinel).
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "Fingerprint(ALL)")
        } else {
            // first four bytes are enough to tell fingerprints apart in logs
            write!(f, "Fingerprint(")?;
            for byte in self.0.iter().take(4) {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "..)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Fingerprint::of(&Value::from("key1"));
        let b = Fingerprint::of(&Value::from("key1"));
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_distinct_params_have_distinct_fingerprints() {
        let a = Fingerprint::of(&Value::from("key1"));
        let b = Fingerprint::of(&Value::from("key2"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_all_sentinel_is_zero_length() {
        let all = Fingerprint::all();
        assert!(all.is_all());
        assert!(all.as_bytes().is_empty());
        assert!(!Fingerprint::of(&Value::Null).is_all());
    }
}
