use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::GuardSite;
use crate::middleware::rate_limit::Policy;

/// Counters for the governor and its stores
#[derive(Clone)]
pub struct Metrics {
    pub login_allowed: Arc<AtomicU64>,
    pub login_denied: Arc<AtomicU64>,
    pub signup_allowed: Arc<AtomicU64>,
    pub signup_denied: Arc<AtomicU64>,
    pub fail_open: Arc<AtomicU64>,
    pub tokens_issued: Arc<AtomicU64>,
    pub tokens_reused: Arc<AtomicU64>,
    pub csrf_accepted: Arc<AtomicU64>,
    pub csrf_rejected: Arc<AtomicU64>,
    pub identifier_fallbacks: Arc<AtomicU64>,
    pub entries_swept: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            login_allowed: Arc::new(AtomicU64::new(0)),
            login_denied: Arc::new(AtomicU64::new(0)),
            signup_allowed: Arc::new(AtomicU64::new(0)),
            signup_denied: Arc::new(AtomicU64::new(0)),
            fail_open: Arc::new(AtomicU64::new(0)),
            tokens_issued: Arc::new(AtomicU64::new(0)),
            tokens_reused: Arc::new(AtomicU64::new(0)),
            csrf_accepted: Arc::new(AtomicU64::new(0)),
            csrf_rejected: Arc::new(AtomicU64::new(0)),
            identifier_fallbacks: Arc::new(AtomicU64::new(0)),
            entries_swept: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn record_decision(&self, policy: Policy, allowed: bool) {
        let counter = match (policy, allowed) {
            (Policy::Login, true) => &self.login_allowed,
            (Policy::Login, false) => &self.login_denied,
            (Policy::Signup, true) => &self.signup_allowed,
            (Policy::Signup, false) => &self.signup_denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reports a protective check that failed internally and let the request through.
    pub fn record_fail_open(&self, site: GuardSite) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(site = ?site, "guard failed open");
    }

    pub fn record_token(&self, reused: bool) {
        if reused {
            self.tokens_reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tokens_issued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_csrf(&self, accepted: bool) {
        if accepted {
            self.csrf_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.csrf_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_identifier_fallbacks(&self) {
        self.identifier_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_swept(&self, count: usize) {
        self.entries_swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            login_allowed: self.login_allowed.load(Ordering::Relaxed),
            login_denied: self.login_denied.load(Ordering::Relaxed),
            signup_allowed: self.signup_allowed.load(Ordering::Relaxed),
            signup_denied: self.signup_denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            tokens_reused: self.tokens_reused.load(Ordering::Relaxed),
            csrf_accepted: self.csrf_accepted.load(Ordering::Relaxed),
            csrf_rejected: self.csrf_rejected.load(Ordering::Relaxed),
            identifier_fallbacks: self.identifier_fallbacks.load(Ordering::Relaxed),
            entries_swept: self.entries_swept.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub login_allowed: u64,
    pub login_denied: u64,
    pub signup_allowed: u64,
    pub signup_denied: u64,
    pub fail_open: u64,
    pub tokens_issued: u64,
    pub tokens_reused: u64,
    pub csrf_accepted: u64,
    pub csrf_rejected: u64,
    pub identifier_fallbacks: u64,
    pub entries_swept: u64,
    pub uptime_seconds: u64,
}
