//! Content checksums.

use sha2::{Digest, Sha256};

use eqms_common::{Error, Result};

/// Algorithm name recorded in sidecars.
pub const CHECKSUM_ALGORITHM: &str = "sha256";

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compare an expected digest with the computed one, ignoring hex case.
pub fn verify(expected: &str, actual: &str) -> Result<()> {
    if expected.trim().eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "checksum mismatch: expected {}, got {}",
            expected.trim(),
            actual
        )))
    }
}
