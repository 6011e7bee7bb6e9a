use axum::{
    body::Bytes,
    extract::{connect_info::ConnectInfo, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use std::net::SocketAddr;

use crate::error::{AppError, AppResult};
use crate::forms::FormProbe;
use crate::middleware::csrf::{cookie_value, validate_csrf_token};
use crate::middleware::governor::IssuedCsrf;
use crate::state::AppState;

// Token endpoint: the governor already issued or reused the token
pub async fn csrf_token(issued: Option<Extension<IssuedCsrf>>) -> AppResult<impl IntoResponse> {
    // Absent only when token issuance failed open
    let Extension(issued) =
        issued.ok_or_else(|| AppError::ServiceUnavailable("CSRF token temporarily unavailable".to_string()))?;
    Ok(Json(json!({
        "token": issued.token,
        "expiresAt": issued.expires_at.to_rfc3339(),
    })))
}

// Forms stay available without a token; the client can retry the token endpoint
fn form_descriptor(state: &AppState, form: &'static str, issued: Option<Extension<IssuedCsrf>>) -> impl IntoResponse {
    Json(json!({
        "form": form,
        "csrfField": state.config.csrf.form_field,
        "token": issued.map(|Extension(issued)| issued.token),
    }))
}

pub async fn login_form(State(state): State<AppState>, issued: Option<Extension<IssuedCsrf>>) -> impl IntoResponse {
    form_descriptor(&state, "login", issued)
}

pub async fn signup_form(State(state): State<AppState>, issued: Option<Extension<IssuedCsrf>>) -> impl IntoResponse {
    form_descriptor(&state, "signup", issued)
}

/// Credential-check call site. Only the anti-forgery token is verified here; the credentials
/// themselves belong to the downstream authentication service.
async fn submit(
    state: &AppState,
    form: &'static str,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: &HeaderMap,
    body: &[u8],
) -> AppResult<impl IntoResponse> {
    let csrf_cfg = &state.config.csrf;
    let from_header = headers
        .get(csrf_cfg.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let supplied = match from_header {
        Some(token) => Some(token),
        None => {
            let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
            FormProbe::parse(content_type, body, &csrf_cfg.form_field).ok().and_then(|p| p.csrf_token)
        }
    };

    // Cookie-less clients were bound to the session derived from their address
    let session_id = cookie_value(headers, &csrf_cfg.cookie_name).unwrap_or_else(|| {
        let remote = connect.map(|Extension(ConnectInfo(addr))| addr.ip());
        state.identity.pseudo_session(&state.identity.resolve(headers, remote))
    });

    let valid = validate_csrf_token(&state.csrf, Some(session_id.as_str()), supplied.as_deref()).await;
    state.metrics.record_csrf(valid);
    if !valid {
        tracing::info!(form, "csrf token rejected");
        return Err(AppError::CsrfRejected("Invalid or missing CSRF token".to_string()));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted", "form": form }))))
}

pub async fn login_submit(
    State(state): State<AppState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    submit(&state, "login", connect, &headers, &body).await
}

pub async fn signup_submit(
    State(state): State<AppState>,
    connect: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    submit(&state, "signup", connect, &headers, &body).await
}
