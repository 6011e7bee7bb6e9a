//! Request governance ahead of the credential handlers.
//!
//! Every request is classified by method and path:
//!
//! - GET on a token, login or signup path: make sure the pseudo-session has a live CSRF token,
//!   hand it to the handler and the client, and (re)issue the session cookie.
//! - POST on a login path: throttle per hashed account and address. Unreadable bodies are
//!   counted against the address and then refused.
//! - POST on a signup path: throttle per address, without touching the body.
//! - anything else passes through.
//!
//! All responses get baseline cookie attributes. Internal faults in these checks are resolved
//! through [`crate::error::verdict`]; the governor never takes authentication down on its own.

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, Request, State},
    http::{
        header::{CONTENT_TYPE, SET_COOKIE},
        HeaderMap, HeaderName, HeaderValue, Method,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};

use super::csrf::{cookie_value, harden_set_cookie, session_cookie};
use super::ip::{is_valid_session_id, redact_identifier, Resolution};
use super::rate_limit::{apply_rate_limit_headers, check_rate_limit, Policy, RateLimitOutcome};
use crate::config::{Environment, RoutesConfig};
use crate::error::{verdict, AppError, FaultKind, GuardSite, Verdict};
use crate::forms::FormProbe;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    TokenIssuingGet,
    LoginPost,
    SignupPost,
    Other,
}

fn matches_any(path: &str, candidates: &[String]) -> bool {
    let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };
    candidates.iter().any(|c| c == path)
}

pub fn classify(method: &Method, path: &str, routes: &RoutesConfig) -> RequestClass {
    let on_login = matches_any(path, &routes.login_paths);
    let on_signup = matches_any(path, &routes.signup_paths);
    match *method {
        Method::GET if on_login || on_signup || matches_any(path, &routes.token_paths) => RequestClass::TokenIssuingGet,
        Method::POST if on_login => RequestClass::LoginPost,
        Method::POST if on_signup => RequestClass::SignupPost,
        _ => RequestClass::Other,
    }
}

/// The token the governor issued or reused for this request, available to handlers as a
/// request extension.
#[derive(Debug, Clone)]
pub struct IssuedCsrf {
    pub session_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn governor_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let class = classify(req.method(), req.uri().path(), &state.config.routes);
    let mut res = match class {
        RequestClass::TokenIssuingGet => issue_token(&state, req, next).await,
        RequestClass::LoginPost => throttle(&state, req, next, Policy::Login).await,
        RequestClass::SignupPost => throttle(&state, req, next, Policy::Signup).await,
        RequestClass::Other => next.run(req).await,
    };
    harden_response_cookies(res.headers_mut(), state.config.server.environment);
    res
}

fn remote_ip(req: &Request) -> Option<IpAddr> {
    req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip())
}

fn resolve(state: &AppState, headers: &HeaderMap, remote: Option<IpAddr>) -> Resolution {
    let resolution = state.identity.resolve(headers, remote);
    if let Resolution::Fallback { reason, .. } = &resolution {
        state.metrics.inc_identifier_fallbacks();
        tracing::debug!(?reason, identifier = %redact_identifier(resolution.identifier()), "using fallback client identifier");
    }
    resolution
}

async fn issue_token(state: &AppState, mut req: Request, next: Next) -> Response {
    let csrf_cfg = &state.config.csrf;
    let session_id = match cookie_value(req.headers(), &csrf_cfg.cookie_name).filter(|s| is_valid_session_id(s)) {
        Some(existing) => existing,
        None => {
            let resolution = resolve(state, req.headers(), remote_ip(&req));
            state.identity.pseudo_session(&resolution)
        }
    };

    let issued = match state.csrf.issue_or_reuse(&session_id).await {
        Ok(issued) => {
            state.metrics.record_token(issued.reused);
            Some(IssuedCsrf { session_id, token: issued.token, expires_at: issued.expires_at })
        }
        Err(e) => {
            tracing::error!(session = %redact_identifier(&session_id), "csrf token issue failed: {}", e);
            match verdict(GuardSite::TokenIssue, FaultKind::TransientStore) {
                Verdict::Allow => {
                    state.metrics.record_fail_open(GuardSite::TokenIssue);
                    None
                }
                Verdict::Deny => return AppError::from(e).into_response(),
            }
        }
    };

    if let Some(issued) = &issued {
        req.extensions_mut().insert(issued.clone());
    }
    let mut res = next.run(req).await;

    if let Some(issued) = issued {
        let headers = res.headers_mut();
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(csrf_cfg.header_name.as_bytes()), HeaderValue::from_str(&issued.token))
        {
            headers.insert(name, value);
        }
        let cookie = session_cookie(&csrf_cfg.cookie_name, &issued.session_id, state.config.server.environment);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(SET_COOKIE, value);
        }
    }
    res
}

/// What to do with a governed request once the limiter has counted it.
enum Inspection {
    Forward(Request),
    /// The body could not be read; answer with the error instead of forwarding.
    Refuse(AppError),
}

impl Inspection {
    async fn respond(self, next: Next) -> Response {
        match self {
            Inspection::Forward(req) => next.run(req).await,
            Inspection::Refuse(e) => e.into_response(),
        }
    }
}

/// Buffers a login body to find the submitted account. Bodies that cannot be read or parsed
/// fall back to the address-only key.
async fn inspect_login(state: &AppState, req: Request, address: String) -> Result<(String, Inspection), Response> {
    let (parts, body) = req.into_parts();
    let limit = state.config.server.max_body_bytes;
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("unreadable login body: {}", e);
            let err = AppError::PayloadTooLarge(format!("Request body could not be read within {} bytes", limit));
            return match verdict(GuardSite::IdentifierResolution, err.fault_kind()) {
                Verdict::Allow => Ok((address, Inspection::Refuse(err))),
                Verdict::Deny => Err(err.into_response()),
            };
        }
    };

    let content_type = parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let identifier = match FormProbe::parse(content_type, &bytes, &state.config.csrf.form_field) {
        Ok(probe) => state.identity.login_identifier(probe.account.as_deref(), &address),
        Err(e) => match verdict(GuardSite::IdentifierResolution, e.fault_kind()) {
            Verdict::Allow => {
                tracing::debug!("login body not inspectable, keying by address only: {}", e);
                address
            }
            Verdict::Deny => return Err(e.into_response()),
        },
    };
    // The body was consumed for inspection
    Ok((identifier, Inspection::Forward(Request::from_parts(parts, Body::from(bytes)))))
}

async fn throttle(state: &AppState, req: Request, next: Next, policy: Policy) -> Response {
    let address = resolve(state, req.headers(), remote_ip(&req)).identifier().to_string();
    let (identifier, inspection) = match policy {
        Policy::Login => match inspect_login(state, req, address).await {
            Ok(inspected) => inspected,
            Err(res) => return res,
        },
        // Keyed by address alone, the body stays with the handler
        Policy::Signup => (address, Inspection::Forward(req)),
    };

    match check_rate_limit(&state.rate_limiter, &identifier, policy).await {
        RateLimitOutcome::Checked(decision) if decision.allowed => {
            state.metrics.record_decision(policy, true);
            let mut res = inspection.respond(next).await;
            apply_rate_limit_headers(res.headers_mut(), decision.limit, decision.remaining, decision.reset_at);
            res
        }
        RateLimitOutcome::Checked(decision) => {
            state.metrics.record_decision(policy, false);
            tracing::info!(
                policy = policy.as_str(),
                identifier = %redact_identifier(&identifier),
                "rate limit exceeded"
            );
            AppError::RateLimited(decision.rejection(state.rate_limiter.now())).into_response()
        }
        RateLimitOutcome::FailedOpen => {
            state.metrics.record_fail_open(GuardSite::RateLimitCheck);
            inspection.respond(next).await
        }
    }
}

/// Rewrites every `Set-Cookie` header with baseline `Path`, `SameSite` and `Secure` attributes.
pub fn harden_response_cookies(headers: &mut HeaderMap, env: Environment) {
    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }
    headers.remove(SET_COOKIE);
    for cookie in cookies {
        let hardened = match cookie.to_str() {
            Ok(v) => HeaderValue::from_str(&harden_set_cookie(v, env)).ok(),
            Err(_) => None,
        };
        headers.append(SET_COOKIE, hardened.unwrap_or(cookie));
    }
}
