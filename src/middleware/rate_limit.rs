//! Fixed-window rate limiting for credential endpoints.
//!
//! Each `(identifier, policy)` pair owns one counter that resets entirely when its window
//! elapses. A client can therefore get up to `2 × limit` requests through in a short span that
//! straddles a window boundary; that approximation is accepted.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

use super::ip::redact_identifier;
use crate::clock::Clock;
use crate::config::{PolicyConfig, RateLimitConfig};
use crate::error::{verdict, FaultKind, GuardSite, Verdict};
use crate::store::{Expiring, KvStore, MemoryStore, StoreResult};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Login,
    Signup,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Login => "login",
            Policy::Signup => "signup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLimits {
    pub limit: u32,
    pub window: TimeDelta,
}

impl From<PolicyConfig> for PolicyLimits {
    fn from(cfg: PolicyConfig) -> Self {
        // window_secs is bounded by config validation
        Self { limit: cfg.limit, window: TimeDelta::seconds(cfg.window_secs as i64) }
    }
}

/// Counter state for one identifier under one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRecord {
    pub identifier: String,
    pub policy: Policy,
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub window: TimeDelta,
}

impl Expiring for RateLimitRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub policy: Policy,
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000)
    }

    pub fn rejection(&self, now: DateTime<Utc>) -> RateLimitRejection {
        let retry_after_secs = self.retry_after_secs(now);
        let what = match self.policy {
            Policy::Login => "login",
            Policy::Signup => "signup",
        };
        RateLimitRejection {
            policy: self.policy,
            limit: self.limit,
            reset_at: self.reset_at,
            retry_after_secs,
            message: format!("Too many {} attempts. Please try again {}.", what, retry_hint(retry_after_secs)),
        }
    }
}

/// Everything the `429` response is rendered from.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRejection {
    pub policy: Policy,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
    pub message: String,
}

fn retry_hint(secs: u64) -> String {
    match secs {
        0..=1 => "in 1 second".to_string(),
        2..=59 => format!("in {} seconds", secs),
        60..=3599 => format!("in {} minutes", secs.div_ceil(60)),
        3600..=43199 => format!("in {} hours", secs.div_ceil(3600)),
        _ => "tomorrow".to_string(),
    }
}

/// Per-identifier, per-policy fixed-window counters.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore<RateLimitRecord>>,
    login: PolicyLimits,
    signup: PolicyLimits,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KvStore<RateLimitRecord>>,
        login: PolicyLimits,
        signup: PolicyLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, login, signup, clock }
    }

    /// Limiter backed by a bounded in-memory store.
    pub fn from_config(cfg: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let store: Arc<dyn KvStore<RateLimitRecord>> = Arc::new(MemoryStore::new(cfg.max_entries));
        Self::new(store, cfg.login.into(), cfg.signup.into(), clock)
    }

    pub fn limits(&self, policy: Policy) -> PolicyLimits {
        match policy {
            Policy::Login => self.login,
            Policy::Signup => self.signup,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Counts one request for `identifier` and decides whether it may proceed.
    ///
    /// A missing or lapsed record starts a new window with `count = 1`; otherwise the count is
    /// incremented, and the request is denied once it exceeds the limit. `reset_at` is always
    /// the end of the current window.
    pub async fn check(&self, identifier: &str, policy: Policy) -> StoreResult<RateLimitDecision> {
        let now = self.clock.now();
        let limits = self.limits(policy);
        let key = format!("{}:{}", policy.as_str(), identifier);
        let fresh_identifier = identifier.to_string();

        let record = self
            .store
            .update(
                &key,
                Box::new(move |current: Option<RateLimitRecord>| match current {
                    Some(mut rec) if !rec.is_expired(now) => {
                        rec.count = rec.count.saturating_add(1);
                        rec
                    }
                    _ => RateLimitRecord {
                        identifier: fresh_identifier,
                        policy,
                        window_start: now,
                        count: 1,
                        window: limits.window,
                    },
                }),
            )
            .await?;

        let allowed = record.count <= limits.limit;
        Ok(RateLimitDecision {
            policy,
            allowed,
            limit: limits.limit,
            remaining: if allowed { limits.limit - record.count } else { 0 },
            reset_at: record.expires_at(),
        })
    }

    /// Drops lapsed windows. Returns the number of records removed.
    pub async fn sweep(&self) -> StoreResult<usize> {
        self.store.sweep(self.clock.now()).await
    }

    pub async fn tracked(&self) -> StoreResult<usize> {
        self.store.len().await
    }
}

/// Outcome of [`check_rate_limit`].
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitOutcome {
    Checked(RateLimitDecision),
    /// The counter store failed and the request was let through.
    FailedOpen,
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        match self {
            RateLimitOutcome::Checked(d) => d.allowed,
            RateLimitOutcome::FailedOpen => true,
        }
    }
}

/// Rate-limit check for credential call sites. Store faults are logged with a redacted
/// identifier and resolved through the fault verdict table, which lets the request through.
pub async fn check_rate_limit(limiter: &RateLimiter, identifier: &str, policy: Policy) -> RateLimitOutcome {
    match limiter.check(identifier, policy).await {
        Ok(decision) => RateLimitOutcome::Checked(decision),
        Err(e) => {
            tracing::error!(
                policy = policy.as_str(),
                identifier = %redact_identifier(identifier),
                "rate limit store failure: {}",
                e
            );
            if matches!(verdict(GuardSite::RateLimitCheck, FaultKind::TransientStore), Verdict::Allow) {
                return RateLimitOutcome::FailedOpen;
            }
            let limits = limiter.limits(policy);
            RateLimitOutcome::Checked(RateLimitDecision {
                policy,
                allowed: false,
                limit: limits.limit,
                remaining: 0,
                reset_at: limiter.now() + limits.window,
            })
        }
    }
}

/// Writes `X-RateLimit-Limit`, `-Remaining` and `-Reset` (epoch milliseconds).
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at: DateTime<Utc>) {
    headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(limit));
    headers.insert(HeaderName::from_static(HEADER_REMAINING), HeaderValue::from(remaining));
    headers.insert(HeaderName::from_static(HEADER_RESET), HeaderValue::from(reset_at.timestamp_millis()));
}
