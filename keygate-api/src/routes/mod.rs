/// API route handlers
///
/// This module contains all route handlers organized by resource:
///
/// - `health`: Health check endpoint
/// - `admin`: Account lookup and deactivation (admins only)
/// - `api_keys`: API key management endpoints
/// - `billing`: Processor webhook, checkout and subscription status
/// - `usage`: Quota standing and usage dashboards
/// - `completions`: Metered endpoints forwarding to the model backend

pub mod admin;
pub mod api_keys;
pub mod billing;
pub mod completions;
pub mod health;
pub mod usage;
