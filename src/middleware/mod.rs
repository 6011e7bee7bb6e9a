//! Middleware components for HTTP request processing.
//!
//! The [`governor`] sits in front of the credential handlers and combines the building blocks:
//! client identification ([`ip`]), fixed-window throttling ([`rate_limit`]) and session-bound
//! anti-forgery tokens ([`csrf`]). [`security_headers`] applies to every response.

pub mod csrf;
pub mod governor;
pub mod ip;
pub mod rate_limit;
pub mod security_headers;

pub use governor::{governor_middleware, IssuedCsrf};
pub use rate_limit::RateLimiter;
