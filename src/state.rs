use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::middleware::csrf::CsrfTokenStore;
use crate::middleware::ip::IdentityResolver;
use crate::middleware::rate_limit::RateLimiter;

/// The shared application state.
///
/// Created once at startup and cloned into every handler. All clones share the same counter
/// and token stores.
#[derive(Clone)]
pub struct AppState {
    /// The application configuration.
    pub config: Arc<AppConfig>,
    /// The application metrics.
    pub metrics: Metrics,
    /// Fixed-window counters for the login and signup policies.
    pub rate_limiter: RateLimiter,
    /// Session-bound anti-forgery tokens.
    pub csrf: CsrfTokenStore,
    /// Client identifier and pseudo-session derivation.
    pub identity: IdentityResolver,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates a new `AppState` on the system clock.
    pub fn new(config: AppConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a new `AppState` driven by `clock`, with in-memory stores sized from `config`.
    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        let rate_limiter = RateLimiter::from_config(&config.rate_limit, clock.clone());
        let csrf = CsrfTokenStore::from_config(&config.csrf, clock.clone());
        let identity = IdentityResolver::new(&config);

        Self { config: Arc::new(config), metrics: Metrics::new(), rate_limiter, csrf, identity, clock }
    }

    /// Replaces the stores, keeping configuration and metrics.
    pub fn with_stores(mut self, rate_limiter: RateLimiter, csrf: CsrfTokenStore) -> Self {
        self.rate_limiter = rate_limiter;
        self.csrf = csrf;
        self
    }
}
