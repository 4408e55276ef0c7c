/// Data models for Keygate
///
/// Plain records shared by the storage backends and the services. Each
/// module documents the table it maps to; the SQL itself lives in
/// `store::postgres`.
///
/// # Models
///
/// - `user`: Tenant principals
/// - `api_key`: Hashed API credentials
/// - `subscription`: Plan assignment and billing lifecycle
/// - `usage`: Append-only request ledger and its aggregates

pub mod api_key;
pub mod subscription;
pub mod usage;
pub mod user;

pub use api_key::{ApiKey, IssuedApiKey, NewApiKey};
pub use subscription::{
    CheckoutCompletion, PeriodUpdate, Plan, PlanCount, Subscription, SubscriptionState,
    UnknownPlan,
};
pub use usage::{DailyCount, EndpointStats, NewUsageEvent, TopUser, UsageEvent};
pub use user::{CreateUser, User, UserCounts};
