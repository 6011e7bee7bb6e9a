//! HTTP route handlers for the Torwache service.
//!
//! - `auth`: the token endpoint, form descriptors and the credential submission call sites
//! - `health`: health check, metrics and build information

pub mod auth;
pub mod health;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::{routing::get, Router};

use crate::middleware::{governor::governor_middleware, security_headers::security_headers_middleware};
use crate::state::AppState;

/// Builds the application router with the governor and security headers applied.
///
/// Paths come from `[routes]`; `config::validate` guarantees they are unique.
pub fn router(state: AppState) -> Router {
    let routes = state.config.routes.clone();
    let mut app = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/version", get(health::version));

    for path in &routes.token_paths {
        app = app.route(path, get(auth::csrf_token));
    }
    for path in &routes.login_paths {
        app = app.route(path, get(auth::login_form).post(auth::login_submit));
    }
    for path in &routes.signup_paths {
        app = app.route(path, get(auth::signup_form).post(auth::signup_submit));
    }

    let cfg_arc = state.config.clone();
    // Bounds the submission handlers; signup bodies reach them unbuffered
    app.layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(from_fn_with_state(state.clone(), governor_middleware))
        .with_state(state)
        .layer(from_fn_with_state(cfg_arc, security_headers_middleware))
}
