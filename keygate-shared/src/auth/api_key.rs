/// API key token utilities
///
/// Pure functions for generating, hashing and shape-checking API key
/// tokens. Persistence and ownership rules live in `auth::credentials`.
///
/// # Key Format
///
/// `kg_` followed by 43 base62 characters (46 chars total). 62^43 is just
/// over 2^256, so a token carries at least 256 bits of entropy.
///
/// # Security
///
/// - Tokens come from `rand::thread_rng()`, a CSPRNG seeded from the OS
/// - Only the SHA-256 hex digest is stored
/// - Lookup is by digest, so the plaintext never reaches storage
///
/// # Example
///
/// ```
/// use keygate_shared::auth::api_key::{generate_api_key, hash_api_key, validate_api_key_format};
///
/// let (key, hash) = generate_api_key();
/// assert!(key.starts_with("kg_"));
/// assert!(validate_api_key_format(&key));
/// assert_eq!(hash, hash_api_key(&key));
/// ```

use rand::Rng;
use sha2::{Digest, Sha256};

/// Random part length in base62 characters
const KEY_RANDOM_LENGTH: usize = 43;

/// Token prefix
pub const KEY_PREFIX: &str = "kg_";

/// Total token length
pub const API_KEY_LENGTH: usize = KEY_PREFIX.len() + KEY_RANDOM_LENGTH;

/// Characters of the token kept for display
pub const DISPLAY_PREFIX_LENGTH: usize = KEY_PREFIX.len() + 8;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a token and its storage digest
///
/// Returns `(plaintext, sha256_hex)`.
pub fn generate_api_key() -> (String, String) {
    let mut rng = rand::thread_rng();
    let random: String = (0..KEY_RANDOM_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();

    let key = format!("{KEY_PREFIX}{random}");
    let hash = hash_api_key(&key);
    (key, hash)
}

/// SHA-256 hex digest of a token (64 chars)
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Leading characters shown in key listings
pub fn display_prefix(key: &str) -> String {
    key.chars().take(DISPLAY_PREFIX_LENGTH).collect()
}

/// Cheap shape check run before touching storage
pub fn validate_api_key_format(key: &str) -> bool {
    key.len() == API_KEY_LENGTH
        && key
            .strip_prefix(KEY_PREFIX)
            .map(|rest| rest.bytes().all(|b| b.is_ascii_alphanumeric()))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_api_key() {
        let (key, hash) = generate_api_key();
        assert_eq!(key.len(), API_KEY_LENGTH);
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let keys: HashSet<String> = (0..1000).map(|_| generate_api_key().0).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_api_key("kg_abc"), hash_api_key("kg_abc"));
        assert_ne!(hash_api_key("kg_abc"), hash_api_key("kg_abd"));
    }

    #[test]
    fn test_hash_known_vector() {
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_display_prefix() {
        let (key, _) = generate_api_key();
        let prefix = display_prefix(&key);
        assert_eq!(prefix.len(), DISPLAY_PREFIX_LENGTH);
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn test_validate_api_key_format() {
        let (key, _) = generate_api_key();
        assert!(validate_api_key_format(&key));

        assert!(!validate_api_key_format(""));
        assert!(!validate_api_key_format("kg_short"));
        assert!(!validate_api_key_format(&key.replacen("kg_", "sk_", 1)));

        let mut bad = key.clone();
        bad.pop();
        bad.push('-');
        assert!(!validate_api_key_format(&bad));
    }
}
