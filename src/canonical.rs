//! Canonical serialization for deterministic hashing.
//!
//! Blueprints must be byte-identical across identical planning runs, so every
//! hashed value goes through the same serializer.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: struct fields serialize in declaration order
//! - Stable Vec order: vectors serialize in index order
//! - No HashMap in hashed data: use BTreeMap
//! - Floats that feed parameter hashes are quantized to microseconds first

use serde::Serialize;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::xxh64;

/// Quantization factor for float normalization (1 µs resolution).
pub const FLOAT_QUANTIZATION_FACTOR: f64 = 1_000_000.0;

/// Serialize a value to canonical JSON bytes.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain data structs with string keys cannot fail to serialize.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute the xxh64 hash of a value's canonical bytes.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), 0)
}

/// Compute canonical hash and return as 16-char hex.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

/// SHA-256 digest of a checkpoint payload, hex encoded.
///
/// Stored next to the payload and re-checked on read.
pub fn payload_digest<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    hasher.update(to_canonical_bytes(value));
    hex::encode(hasher.finalize())
}

/// Quantize seconds to integer microseconds.
pub fn quantize_seconds(value: f64) -> i64 {
    (value * FLOAT_QUANTIZATION_FACTOR).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Cut {
        asset: String,
        at: f64,
    }

    #[test]
    fn test_determinism() {
        let cut = Cut { asset: "a".to_string(), at: 1.5 };
        assert_eq!(canonical_hash(&cut), canonical_hash(&cut));
        assert_eq!(canonical_hash_hex(&cut).len(), 16);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let cut = Cut { asset: "a".to_string(), at: 1.5 };
        let digest = payload_digest(&cut);
        assert_eq!(digest.len(), 64);
        assert_ne!(digest, payload_digest(&Cut { asset: "b".to_string(), at: 1.5 }));
    }

    #[test]
    fn test_quantization() {
        assert_eq!(quantize_seconds(0.5), 500_000);
        assert_eq!(quantize_seconds(1e-7), 0);
    }
}
