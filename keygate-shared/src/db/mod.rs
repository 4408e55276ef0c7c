/// Database layer
///
/// Connection pooling and schema migrations for the Postgres backend.
/// Queries themselves live in `store::postgres`.
///
/// # Modules
///
/// - `pool`: Connection pool bounded by the storage timeout
/// - `migrations`: Embedded migration runner

pub mod migrations;
pub mod pool;
