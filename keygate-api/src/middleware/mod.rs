/// Middleware modules for the API server
///
/// - `access_gate`: API key authentication and usage metering

pub mod access_gate;
