//! # Keygate Shared Library
//!
//! Core of the Keygate API gateway: credentials, usage accounting, quota
//! admission and plan state, shared by the HTTP server and its tests.
//!
//! ## Module Organization
//!
//! - `models`: Database models and data structures
//! - `store`: Repository traits with Postgres and in-memory backends
//! - `db`: Connection pool and migrations
//! - `auth`: API keys, the credential store and owner JWTs
//! - `ledger`: Append-only usage ledger and calendar windows
//! - `quota`: Plan catalog and admission decisions
//! - `billing`: Webhook verification and the subscription registry
//! - `gate`: The per-request access pipeline

pub mod auth;
pub mod billing;
pub mod db;
pub mod gate;
pub mod ledger;
pub mod models;
pub mod quota;
pub mod store;

/// Current version of the Keygate shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
