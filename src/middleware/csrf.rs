//! Session-bound Cross-Site Request Forgery (CSRF) tokens.
//!
//! One live token per pseudo-session. Issuing a new token for a session invalidates the old
//! one, and tokens stay valid for repeated submissions until they expire or are replaced;
//! there is no one-time-use state. Expiry is checked on read and by the periodic sweep.

use axum::http::{header::COOKIE, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::ip::{is_valid_session_id, redact_identifier};
use crate::clock::Clock;
use crate::config::{CsrfConfig, Environment};
use crate::error::{verdict, FaultKind, GuardSite, Verdict};
use crate::store::{Expiring, KvStore, MemoryStore, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CsrfTokenRecord {
    pub session_id: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for CsrfTokenRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// A token handed to a client, and whether it was already live for the session.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub reused: bool,
}

#[derive(Clone)]
pub struct CsrfTokenStore {
    store: Arc<dyn KvStore<CsrfTokenRecord>>,
    clock: Arc<dyn Clock>,
    token_bytes: usize,
    ttl: TimeDelta,
}

impl CsrfTokenStore {
    /// `token_bytes` is clamped to at least 16 (128 bits).
    pub fn new(store: Arc<dyn KvStore<CsrfTokenRecord>>, clock: Arc<dyn Clock>, token_bytes: usize, ttl: TimeDelta) -> Self {
        Self { store, clock, token_bytes: token_bytes.max(16), ttl }
    }

    pub fn from_config(cfg: &CsrfConfig, clock: Arc<dyn Clock>) -> Self {
        let store: Arc<dyn KvStore<CsrfTokenRecord>> = Arc::new(MemoryStore::new(cfg.max_entries));
        Self::new(store, clock, cfg.token_bytes, TimeDelta::seconds(cfg.ttl_secs as i64))
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    /// A random URL-safe base64 token (no padding) from the thread-local CSPRNG.
    pub fn generate_token(&self) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(&bytes)
    }

    /// Upserts the token for `session_id`, replacing any previous one.
    pub async fn store(&self, session_id: &str, token: &str, ttl: TimeDelta) -> StoreResult<CsrfTokenRecord> {
        let now = self.clock.now();
        let record = CsrfTokenRecord {
            session_id: session_id.to_string(),
            token: token.to_string(),
            issued_at: now,
            expires_at: now + ttl,
        };
        self.store.set(session_id, record.clone()).await?;
        Ok(record)
    }

    async fn live_record(&self, session_id: &str) -> StoreResult<Option<CsrfTokenRecord>> {
        match self.store.get(session_id).await? {
            Some(record) if record.is_expired(self.clock.now()) => {
                self.store.delete(session_id).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// The live token for `session_id`, or `None` if absent or expired.
    pub async fn get(&self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self.live_record(session_id).await?.map(|r| r.token))
    }

    /// True only for an exact match against a live token. The comparison runs in constant time
    /// over the token content.
    pub async fn validate(&self, session_id: &str, supplied: &str) -> StoreResult<bool> {
        Ok(match self.live_record(session_id).await? {
            Some(record) => tokens_match(supplied, &record.token),
            None => false,
        })
    }

    /// Returns the live token for the session, issuing one if there is none.
    ///
    /// The check and the write run as one store update, so concurrent first requests for a
    /// session all receive the same token.
    pub async fn issue_or_reuse(&self, session_id: &str) -> StoreResult<IssuedToken> {
        let now = self.clock.now();
        let fresh = CsrfTokenRecord {
            session_id: session_id.to_string(),
            token: self.generate_token(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let candidate = fresh.token.clone();
        let record = self
            .store
            .update(
                session_id,
                Box::new(move |current| match current {
                    Some(live) if !live.is_expired(now) => live,
                    _ => fresh,
                }),
            )
            .await?;
        let reused = record.token != candidate;
        Ok(IssuedToken { token: record.token, expires_at: record.expires_at, reused })
    }

    /// Replaces the session's token unconditionally.
    pub async fn regenerate(&self, session_id: &str) -> StoreResult<CsrfTokenRecord> {
        let token = self.generate_token();
        self.store(session_id, &token, self.ttl).await
    }

    pub async fn sweep(&self) -> StoreResult<usize> {
        self.store.sweep(self.clock.now()).await
    }

    pub async fn tracked(&self) -> StoreResult<usize> {
        self.store.len().await
    }
}

/// Constant-time token comparison. Unequal lengths fail early; token length is not secret.
pub fn tokens_match(supplied: &str, expected: &str) -> bool {
    if supplied.len() != expected.len() {
        return false;
    }
    supplied.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Token check for credential call sites.
///
/// Missing session or token is a mismatch. A store fault is logged and resolved through the
/// fault verdict table, which rejects the submission.
pub async fn validate_csrf_token(store: &CsrfTokenStore, session_id: Option<&str>, supplied: Option<&str>) -> bool {
    let (Some(session_id), Some(supplied)) = (session_id, supplied) else {
        return false;
    };
    if !is_valid_session_id(session_id) {
        return false;
    }
    match store.validate(session_id, supplied).await {
        Ok(valid) => valid,
        Err(e) => {
            tracing::error!(session = %redact_identifier(session_id), "csrf store failure: {}", e);
            matches!(verdict(GuardSite::TokenValidation, FaultKind::TransientStore), Verdict::Allow)
        }
    }
}

/// The value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|hv| hv.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

fn same_site(env: Environment) -> &'static str {
    // Strict breaks same-site redirects on local hosts without TLS
    if env.is_production() {
        "Strict"
    } else {
        "Lax"
    }
}

/// `Set-Cookie` value binding the pseudo-session. Lives for the browser session.
pub fn session_cookie(name: &str, session_id: &str, env: Environment) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite={}", name, session_id, same_site(env));
    if env.is_production() {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Adds `Path`, `SameSite` and (in production) `Secure` to a `Set-Cookie` value that lacks them.
pub fn harden_set_cookie(value: &str, env: Environment) -> String {
    let attrs: Vec<String> = value.split(';').skip(1).map(|a| a.trim().to_ascii_lowercase()).collect();
    let has = |name: &str| attrs.iter().any(|a| a == name || a.starts_with(&format!("{}=", name)));

    let mut out = value.trim_end().trim_end_matches(';').to_string();
    if !has("path") {
        out.push_str("; Path=/");
    }
    if !has("samesite") {
        out.push_str("; SameSite=");
        out.push_str(same_site(env));
    }
    if env.is_production() && !has("secure") {
        out.push_str("; Secure");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{StoreError, UpdateFn};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use std::collections::HashSet;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn token_store(ttl_secs: i64) -> (CsrfTokenStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store: Arc<dyn KvStore<CsrfTokenRecord>> = Arc::new(MemoryStore::new(1024));
        (CsrfTokenStore::new(store, clock.clone(), 32, TimeDelta::seconds(ttl_secs)), clock)
    }

    #[test]
    fn test_generate_token_shape() {
        let (store, _) = token_store(60);
        let token = store.generate_token();
        // 32 bytes = 43 base64 characters (URL-safe, no padding)
        assert_eq!(token.len(), 43);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_token_bytes_clamped_to_128_bits() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = CsrfTokenStore::new(Arc::new(MemoryStore::<CsrfTokenRecord>::new(8)), clock, 4, TimeDelta::seconds(60));
        // 16 bytes = 22 base64 characters
        assert_eq!(store.generate_token().len(), 22);
    }

    #[test]
    fn test_no_collisions_in_a_million_tokens() {
        let (store, _) = token_store(60);
        let mut seen = HashSet::with_capacity(1_000_000);
        for _ in 0..1_000_000 {
            assert!(seen.insert(store.generate_token()));
        }
    }

    #[tokio::test]
    async fn test_store_get_and_overwrite() {
        let (store, _) = token_store(60);
        store.store("session-a", "first", TimeDelta::seconds(60)).await.unwrap();
        assert_eq!(store.get("session-a").await.unwrap().as_deref(), Some("first"));

        store.store("session-a", "second", TimeDelta::seconds(60)).await.unwrap();
        assert_eq!(store.get("session-a").await.unwrap().as_deref(), Some("second"));
        assert!(!store.validate("session-a", "first").await.unwrap());
        assert!(store.validate("session-a", "second").await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_expired_and_inexact() {
        let (store, clock) = token_store(60);
        assert!(!store.validate("session-none", "x").await.unwrap());

        store.store("session-a", "abcdef", TimeDelta::seconds(60)).await.unwrap();
        assert!(!store.validate("session-a", "abcde").await.unwrap());
        assert!(!store.validate("session-a", "abcdeg").await.unwrap());
        assert!(!store.validate("session-a", "ABCDEF").await.unwrap());
        assert!(!store.validate("session-b", "abcdef").await.unwrap());
        assert!(store.validate("session-a", "abcdef").await.unwrap());
        // Reusable until expiry
        assert!(store.validate("session-a", "abcdef").await.unwrap());

        clock.advance(TimeDelta::seconds(60));
        assert!(!store.validate("session-a", "abcdef").await.unwrap());
        assert_eq!(store.get("session-a").await.unwrap(), None);
        // Lazy expiry removed the record
        assert_eq!(store.tracked().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_issue_or_reuse_is_idempotent() {
        let (store, clock) = token_store(60);
        let first = store.issue_or_reuse("session-a").await.unwrap();
        assert!(!first.reused);
        let second = store.issue_or_reuse("session-a").await.unwrap();
        assert!(second.reused);
        assert_eq!(first.token, second.token);

        let replaced = store.regenerate("session-a").await.unwrap();
        assert_ne!(replaced.token, first.token);
        assert!(!store.validate("session-a", &first.token).await.unwrap());

        clock.advance(TimeDelta::seconds(61));
        let fresh = store.issue_or_reuse("session-a").await.unwrap();
        assert!(!fresh.reused);
        assert_eq!(fresh.expires_at, clock.now() + TimeDelta::seconds(60));
    }

    struct InterleavingStore(MemoryStore<CsrfTokenRecord>);

    #[async_trait]
    impl KvStore<CsrfTokenRecord> for InterleavingStore {
        async fn get(&self, key: &str) -> StoreResult<Option<CsrfTokenRecord>> {
            let v = self.0.get(key).await;
            tokio::task::yield_now().await;
            v
        }
        async fn set(&self, key: &str, value: CsrfTokenRecord) -> StoreResult<()> {
            tokio::task::yield_now().await;
            self.0.set(key, value).await
        }
        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.0.delete(key).await
        }
        async fn sweep(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            self.0.sweep(now).await
        }
        async fn len(&self) -> StoreResult<usize> {
            self.0.len().await
        }
        async fn update(&self, key: &str, f: UpdateFn<CsrfTokenRecord>) -> StoreResult<CsrfTokenRecord> {
            tokio::task::yield_now().await;
            self.0.update(key, f).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_token() {
        let clock = Arc::new(ManualClock::new(start()));
        let inner: Arc<dyn KvStore<CsrfTokenRecord>> = Arc::new(InterleavingStore(MemoryStore::new(16)));
        let store = CsrfTokenStore::new(inner, clock, 32, TimeDelta::seconds(60));

        let (a, b) = tokio::join!(store.issue_or_reuse("session-x"), store.issue_or_reuse("session-x"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.token, b.token);
        assert_eq!([a.reused, b.reused].iter().filter(|reused| !**reused).count(), 1);
        assert!(store.validate("session-x", &a.token).await.unwrap());
        assert!(store.validate("session-x", &b.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep() {
        let (store, clock) = token_store(60);
        store.issue_or_reuse("session-a").await.unwrap();
        clock.advance(TimeDelta::seconds(30));
        store.issue_or_reuse("session-b").await.unwrap();
        clock.advance(TimeDelta::seconds(30));
        assert_eq!(store.sweep().await.unwrap(), 1);
        assert_eq!(store.tracked().await.unwrap(), 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore<CsrfTokenRecord> for BrokenStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<CsrfTokenRecord>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: CsrfTokenRecord) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn sweep(&self, _now: DateTime<Utc>) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn len(&self) -> StoreResult<usize> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn update(&self, _key: &str, _f: UpdateFn<CsrfTokenRecord>) -> StoreResult<CsrfTokenRecord> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_validate_csrf_token_call_site() {
        let (store, _) = token_store(60);
        let issued = store.issue_or_reuse("session-a").await.unwrap();

        assert!(validate_csrf_token(&store, Some("session-a"), Some(&issued.token)).await);
        assert!(!validate_csrf_token(&store, None, Some(&issued.token)).await);
        assert!(!validate_csrf_token(&store, Some("session-a"), None).await);
        assert!(!validate_csrf_token(&store, Some("bogus"), Some(&issued.token)).await);

        let clock = Arc::new(ManualClock::new(start()));
        let broken = CsrfTokenStore::new(Arc::new(BrokenStore), clock, 32, TimeDelta::seconds(60));
        assert!(!validate_csrf_token(&broken, Some("session-a"), Some(&issued.token)).await);
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; csrf-session=session-1.2.3.4"));
        headers.append(COOKIE, HeaderValue::from_static("other=1"));
        assert_eq!(cookie_value(&headers, "csrf-session").as_deref(), Some("session-1.2.3.4"));
        assert_eq!(cookie_value(&headers, "other").as_deref(), Some("1"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        assert_eq!(
            session_cookie("csrf-session", "session-x", Environment::Production),
            "csrf-session=session-x; Path=/; HttpOnly; SameSite=Strict; Secure"
        );
        assert_eq!(
            session_cookie("csrf-session", "session-x", Environment::Development),
            "csrf-session=session-x; Path=/; HttpOnly; SameSite=Lax"
        );
    }

    #[test]
    fn test_harden_set_cookie() {
        assert_eq!(harden_set_cookie("a=1", Environment::Production), "a=1; Path=/; SameSite=Strict; Secure");
        assert_eq!(harden_set_cookie("a=1; Path=/app;", Environment::Development), "a=1; Path=/app; SameSite=Lax");
        let already = "a=1; Path=/; SameSite=None; Secure";
        assert_eq!(harden_set_cookie(already, Environment::Production), already);
    }
}
