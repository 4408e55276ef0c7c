/// API key model
///
/// API keys are the credentials tenants present on metered endpoints.
/// The plaintext token is handed out exactly once at issuance; afterwards
/// only its SHA-256 digest and a short display prefix exist.
///
/// # Security
///
/// - Keys are stored as SHA-256 hashes, never plaintext
/// - `key_hash` is unique across all owners
/// - The digest is never serialized into API responses
///
/// # Schema
///
/// ```sql
/// CREATE TABLE api_keys (
///     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
///     owner_user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
///     display_name VARCHAR(100) NOT NULL,
///     key_prefix VARCHAR(16) NOT NULL,
///     key_hash CHAR(64) NOT NULL UNIQUE,
///     active BOOLEAN NOT NULL DEFAULT TRUE,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     last_used_at TIMESTAMPTZ
/// );
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum display name length (matches the column width)
pub const MAX_DISPLAY_NAME_LENGTH: usize = 100;

/// Stored API key record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    /// Unique key ID
    pub id: Uuid,

    /// User that owns the key
    pub owner_user_id: Uuid,

    /// Human-readable label chosen by the owner
    pub display_name: String,

    /// Leading characters of the token, for display ("kg_AbCd1234")
    pub key_prefix: String,

    /// SHA-256 hex digest of the full token
    #[serde(skip_serializing, default)]
    pub key_hash: String,

    /// Only active keys authenticate
    pub active: bool,

    /// When the key was issued
    pub created_at: DateTime<Utc>,

    /// Last time the key passed the gate (best-effort)
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Insert payload for a freshly generated key
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub owner_user_id: Uuid,
    pub display_name: String,
    pub key_prefix: String,
    pub key_hash: String,
}

/// Result of issuing a key: the stored record plus the one-time plaintext
#[derive(Debug, Clone, Serialize)]
pub struct IssuedApiKey {
    #[serde(flatten)]
    pub key: ApiKey,

    /// Plaintext token. Never persisted and never returned again.
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            display_name: "ci".to_string(),
            key_prefix: "kg_AbCd1234".to_string(),
            key_hash: "a".repeat(64),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_hash_is_never_serialized() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("key_hash").is_none());
        assert_eq!(json["key_prefix"], "kg_AbCd1234");
    }

    #[test]
    fn test_issued_key_flattens_record() {
        let issued = IssuedApiKey {
            key: sample(),
            token: "kg_secret".to_string(),
        };
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["token"], "kg_secret");
        assert_eq!(json["display_name"], "ci");
        assert!(json.get("key_hash").is_none());
    }
}
