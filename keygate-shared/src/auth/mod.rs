/// Authentication
///
/// # Modules
///
/// - [`api_key`]: Token generation, hashing and format checks
/// - [`credentials`]: The credential store (issue, resolve, revoke, delete)
/// - [`jwt`]: Owner session tokens for management routes
///
/// # Security Features
///
/// - **API keys**: 256-bit random tokens, stored only as SHA-256 digests
/// - **Uniform rejection**: every unusable token resolves to the same error
/// - **JWT**: HS256 with issuer and lifetime checks

pub mod api_key;
pub mod credentials;
pub mod jwt;

pub use credentials::{CredentialError, CredentialStore, ResolvedCredential};
