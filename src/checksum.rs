//! SHA-256 hex digests over logical item and set state.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the input bytes.
pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digest_is_sensitive_to_input() {
        assert_ne!(sha256_hex("a|b"), sha256_hex("a|c"));
    }
}
