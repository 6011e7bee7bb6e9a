//! # Torwache
//!
//! Request governance for credential endpoints: per-client throttling of login and signup
//! attempts and session-bound anti-forgery tokens, as an Axum middleware stack.
//!
//! ## Architecture
//!
//! - **Axum**: HTTP server, routing and the governor middleware
//! - **Tokio**: Async runtime, background sweepers
//! - **LRU**: Bounded in-memory counter and token stores
//! - **Serde**: Configuration and JSON bodies
//!
//! ## Core Components
//!
//! - [`config`]: Layered configuration and validation
//! - [`error`]: Error responses and the fail-open decision table
//! - [`middleware`]: Client identification, rate limiting, CSRF tokens, the governor
//! - [`store`]: Key-value store abstraction and the in-memory implementation
//! - [`clock`]: Time source, replaceable in tests
//! - [`forms`]: Inspection of submitted credential forms
//! - [`metrics`]: Counters exposed over HTTP
//! - [`routes`]: HTTP endpoint handlers
//! - [`state`]: Shared application state
//!
//! Throttling fails open: a fault in the counter store never blocks authentication. Token
//! validation fails closed.

pub mod clock;
pub mod config;
pub mod error;
pub mod forms;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;

#[cfg(test)]
mod tests;
