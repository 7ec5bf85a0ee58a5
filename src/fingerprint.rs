//! Content fingerprints for duplicate detection.
//!
//! A fingerprint is the hex SHA-256 of the normalized upload. Text uploads
//! are normalized so that line-ending and trailing-whitespace differences
//! do not defeat deduplication; anything that is not valid UTF-8 is hashed
//! byte-for-byte.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of an upload body.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    match std::str::from_utf8(bytes) {
        Ok(text) => hasher.update(normalize_text(text).as_bytes()),
        Err(_) => hasher.update(bytes),
    }
    hex::encode(hasher.finalize())
}

/// Line endings to `\n`, trailing whitespace removed from the whole text
/// and from each line.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    for (i, line) in unified.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out
}
