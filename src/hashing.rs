//! Sequence Digest - SHA-256 over canonical instruction JSON
//!
//! Two sequences that differ only in whitespace or field order within an
//! entry share a digest. Entry order always matters.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Compact JSON with object keys in sorted order.
///
/// `serde_json::Map` keeps keys sorted unless `preserve_order` is enabled,
/// so a round trip through `Value` is enough.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// Digest of a whole instruction sequence.
pub fn sequence_digest(entries: &[Value]) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(canonical_json(entry)?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
