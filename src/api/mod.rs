//! Authenticated REST API surface: key issuance, timing-safe
//! verification, token-bucket rate limiting, and route dispatch.

pub mod keys;
pub mod openapi;
pub mod rate_limit;
pub mod server;

pub use keys::{ApiKeyStore, ApiKeySummary, CreatedApiKey, PermissionLevel};
pub use rate_limit::RateLimiter;
pub use server::AppState;
