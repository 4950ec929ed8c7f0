//! Content hashing for translation memory keys.

use sha2::{Digest, Sha256};

/// Length of a canonical source hash (hex-encoded SHA-256).
pub const CANONICAL_HASH_LEN: usize = 64;

/// Canonical hash of a source string: lowercase hex SHA-256 of its UTF-8 bytes.
pub fn source_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{:x}", digest)
}
