//! Local HTTP gateway.
//!
//! The only way the three contexts reach the broker: websites through the
//! bridge routes, the approval surface through the approval routes, and the
//! operator through the token-protected API.

pub mod auth;
pub mod rate_limit;
pub mod server;
pub mod types;

pub use rate_limit::RateLimiter;
pub use server::{GatewayState, start_server};
