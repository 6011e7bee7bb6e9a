use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

// Health check endpoint - lightweight, never throttled
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// Metrics endpoint: counters plus current store sizes
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.get_snapshot();
    // Store sizes are informational; a failing store reports null
    let rate_limit_entries = state.rate_limiter.tracked().await.ok();
    let csrf_entries = state.csrf.tracked().await.ok();
    Json(serde_json::json!({
        "counters": snapshot,
        "stores": {
            "rate_limit_entries": rate_limit_entries,
            "csrf_entries": csrf_entries,
        }
    }))
}

// Prometheus-compatible text exposition format
pub async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let m = state.metrics.get_snapshot();
    let mut body = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
        body.push_str(&format!(
            "# HELP torwache_{name} {help}\n# TYPE torwache_{name} {kind}\ntorwache_{name} {value}\n"
        ));
    };
    metric("login_allowed", "counter", "Login attempts admitted", m.login_allowed);
    metric("login_denied", "counter", "Login attempts throttled", m.login_denied);
    metric("signup_allowed", "counter", "Signup attempts admitted", m.signup_allowed);
    metric("signup_denied", "counter", "Signup attempts throttled", m.signup_denied);
    metric("fail_open", "counter", "Guard checks that failed internally and allowed the request", m.fail_open);
    metric("tokens_issued", "counter", "CSRF tokens issued", m.tokens_issued);
    metric("tokens_reused", "counter", "CSRF tokens reused", m.tokens_reused);
    metric("csrf_accepted", "counter", "CSRF validations accepted", m.csrf_accepted);
    metric("csrf_rejected", "counter", "CSRF validations rejected", m.csrf_rejected);
    metric("identifier_fallbacks", "counter", "Requests keyed by a fallback identifier", m.identifier_fallbacks);
    metric("entries_swept", "counter", "Expired store entries swept", m.entries_swept);
    metric("uptime_seconds", "gauge", "Uptime seconds", m.uptime_seconds);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

// Version/Build info endpoint (JSON)
pub async fn version() -> impl IntoResponse {
    let body = serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "package": {
            "description": env!("CARGO_PKG_DESCRIPTION"),
            "authors": env!("CARGO_PKG_AUTHORS"),
            "license": env!("CARGO_PKG_LICENSE"),
        },
        "build": {
            "profile": if cfg!(debug_assertions) { "debug" } else { "release" },
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        }
    });
    (StatusCode::OK, Json(body))
}
