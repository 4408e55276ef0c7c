/// User model
///
/// A user is the tenant principal: every API key, subscription and usage
/// event belongs to exactly one user. The core never hard-deletes users;
/// deactivation is expressed through the `active` flag.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE users (
///     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
///     email VARCHAR(255) NOT NULL UNIQUE,
///     username VARCHAR(80) NOT NULL UNIQUE,
///     active BOOLEAN NOT NULL DEFAULT TRUE,
///     admin BOOLEAN NOT NULL DEFAULT FALSE,
///     email_verified BOOLEAN NOT NULL DEFAULT FALSE,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     last_login_at TIMESTAMPTZ
/// );
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted username length (matches the column width)
pub const MAX_USERNAME_LENGTH: usize = 80;

/// User account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// Unique user ID
    pub id: Uuid,

    /// Email address, stored lowercased
    pub email: String,

    /// Unique handle
    pub username: String,

    /// Inactive users are refused by the access gate
    pub active: bool,

    /// Grants access to platform-wide statistics
    pub admin: bool,

    /// Whether the email address has been verified
    pub email_verified: bool,

    /// When the account was created
    pub created_at: DateTime<Utc>,

    /// Last successful sign-in, if any
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Input for creating a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

impl CreateUser {
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            username: username.into(),
            admin: false,
        }
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    /// Email in the form it is stored and compared in
    pub fn normalized_email(&self) -> String {
        normalize_email(&self.email)
    }
}

/// Lowercases and trims an email address so uniqueness is case-insensitive
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Aggregate user counts for the admin dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserCounts {
    pub total: i64,
    pub active: i64,
    pub verified: i64,
}
