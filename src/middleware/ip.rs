//! Client identification for rate-limit buckets and pseudo-sessions.
//!
//! Resolution is a pure function of request metadata and returns a tagged [`Resolution`], so
//! every use of a fallback identity is visible to the caller and shows up in the logs.

use axum::http::{header::USER_AGENT, HeaderMap};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use crate::config::{AppConfig, Environment};

/// Bucket used when no address can be resolved.
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

pub const SESSION_PREFIX: &str = "session-";
pub const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Neither proxy headers nor the socket yielded an address.
    NoAddress,
    /// Development only: derived from a truncated user-agent. Any client can choose this value,
    /// so it identifies nothing and must never be relied on for abuse prevention.
    ClientDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Fallback { identifier: String, reason: FallbackReason },
}

impl Resolution {
    pub fn identifier(&self) -> &str {
        match self {
            Resolution::Resolved(id) => id,
            Resolution::Fallback { identifier, .. } => identifier,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolution::Fallback { .. })
    }
}

/// Extract the client address from proxy headers.
///
/// `X-Forwarded-For` entries are read right to left: each of the `trusted_hops` proxies in front
/// of this service appended one entry, so the client is the entry `trusted_hops` from the right.
/// Anything further left was supplied by the client and is ignored. `X-Real-IP` is only consulted
/// when no `X-Forwarded-For` header is present.
pub fn forwarded_address(headers: &HeaderMap, trusted_hops: usize) -> Option<IpAddr> {
    if headers.contains_key("x-forwarded-for") {
        let entries: Vec<&str> = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|hv| hv.to_str().ok())
            .flat_map(|h| h.split(','))
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();
        let index = entries.len().checked_sub(trusted_hops.max(1))?;
        return entries[index].parse::<IpAddr>().ok();
    }
    headers
        .get("x-real-ip")
        .and_then(|hv| hv.to_str().ok())
        .and_then(|h| h.trim().parse::<IpAddr>().ok())
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub trust_proxy_headers: bool,
    pub trusted_proxy_hops: usize,
    pub environment: Environment,
    pub descriptor_prefix_len: usize,
}

/// Derive a client identifier from proxy headers, falling back to the socket address.
///
/// Without any address the result is [`UNKNOWN_IDENTIFIER`], except in development where a
/// `ua:` identifier built from the user-agent prefix keeps local testing usable.
pub fn resolve_client_identifier(headers: &HeaderMap, remote: Option<IpAddr>, opts: &ResolveOptions) -> Resolution {
    let proxied = if opts.trust_proxy_headers { forwarded_address(headers, opts.trusted_proxy_hops) } else { None };
    if let Some(ip) = proxied.or(remote) {
        return Resolution::Resolved(ip.to_string());
    }

    if !opts.environment.is_production() {
        if let Some(descriptor) = client_descriptor(headers, opts.descriptor_prefix_len) {
            return Resolution::Fallback {
                identifier: format!("ua:{}", descriptor),
                reason: FallbackReason::ClientDescriptor,
            };
        }
    }

    Resolution::Fallback { identifier: UNKNOWN_IDENTIFIER.to_string(), reason: FallbackReason::NoAddress }
}

fn client_descriptor(headers: &HeaderMap, max_len: usize) -> Option<String> {
    let ua = headers.get(USER_AGENT)?.to_str().ok()?.trim();
    if ua.is_empty() {
        return None;
    }
    Some(
        ua.chars()
            .take(max_len)
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_') { c } else { '_' })
            .collect(),
    )
}

/// Join an account key and an address into one login bucket key.
pub fn compose_identifier(primary: &str, secondary: &str) -> String {
    format!("acct:{}|ip:{}", primary, secondary)
}

/// Shorten an identifier for log output: a short prefix and `***`.
pub fn redact_identifier(identifier: &str) -> String {
    let keep = (identifier.chars().count() / 2).min(6);
    let prefix: String = identifier.chars().take(keep).collect();
    format!("{}***", prefix)
}

/// Hex SHA-256 over `secret`, a domain label and `value`, truncated to 128 bits.
fn keyed_digest(secret: &str, domain: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update([0u8]);
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Identity derivation bound to the configured secret and deployment mode.
#[derive(Clone)]
pub struct IdentityResolver {
    opts: ResolveOptions,
    secret: String,
    hash_session_ids: bool,
}

impl IdentityResolver {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            opts: ResolveOptions {
                trust_proxy_headers: cfg.identity.trust_proxy_headers,
                trusted_proxy_hops: cfg.identity.trusted_proxy_hops,
                environment: cfg.server.environment,
                descriptor_prefix_len: cfg.identity.descriptor_prefix_len,
            },
            secret: cfg.identity_secret().to_string(),
            hash_session_ids: cfg.csrf.hash_session_ids,
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> Resolution {
        resolve_client_identifier(headers, remote, &self.opts)
    }

    /// Bucket component for a submitted account value. The value is normalized and hashed, so
    /// keys never hold it in cleartext and have a bounded length.
    pub fn account_key(&self, account: &str) -> String {
        keyed_digest(&self.secret, "account", &account.trim().to_lowercase())
    }

    /// Login bucket: hashed account plus address, or the address alone when no account was
    /// submitted.
    pub fn login_identifier(&self, account: Option<&str>, address: &str) -> String {
        match account {
            Some(acct) => compose_identifier(&self.account_key(acct), address),
            None => address.to_string(),
        }
    }

    /// `session-<identifier>`, with the identifier hashed when configured.
    pub fn pseudo_session(&self, resolution: &Resolution) -> String {
        let id = resolution.identifier();
        if self.hash_session_ids {
            format!("{}{}", SESSION_PREFIX, keyed_digest(&self.secret, "session", id))
        } else {
            format!("{}{}", SESSION_PREFIX, id)
        }
    }
}

/// Whether a cookie-supplied pseudo-session id has the shape this service issues.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() > SESSION_PREFIX.len()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.starts_with(SESSION_PREFIX)
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '/' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn opts(environment: Environment) -> ResolveOptions {
        ResolveOptions { trust_proxy_headers: true, trusted_proxy_hops: 1, environment, descriptor_prefix_len: 32 }
    }

    #[test]
    fn test_forwarded_for_takes_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let remote = Some(IpAddr::from([127, 0, 0, 1]));
        assert_eq!(
            resolve_client_identifier(&headers, remote, &opts(Environment::Production)),
            Resolution::Resolved("203.0.113.7".to_string())
        );
    }

    #[test]
    fn test_forwarded_for_ignores_client_supplied_entries() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.9.9.9, 10.8.8.8, 203.0.113.7"));
        assert_eq!(forwarded_address(&headers, 1), Some("203.0.113.7".parse().unwrap()));

        // Two proxies: the last entry is the outer proxy, the client is one further left
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.9.9.9, 203.0.113.7, 192.0.2.1"));
        assert_eq!(forwarded_address(&headers, 2), Some("203.0.113.7".parse().unwrap()));

        // Split across several headers
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("10.9.9.9"));
        headers.append("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(forwarded_address(&headers, 1), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_short_or_malformed_forwarded_for_yields_nothing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(forwarded_address(&headers, 2), None);

        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(forwarded_address(&headers, 1), None);

        let remote = Some(IpAddr::from([192, 0, 2, 9]));
        assert_eq!(resolve_client_identifier(&headers, remote, &opts(Environment::Production)).identifier(), "192.0.2.9");
    }

    #[test]
    fn test_real_ip_without_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(forwarded_address(&headers, 1), Some("198.51.100.2".parse().unwrap()));
    }

    #[test]
    fn test_socket_address_fallback() {
        let headers = HeaderMap::new();
        let remote = Some(IpAddr::from([192, 0, 2, 9]));
        assert_eq!(
            resolve_client_identifier(&headers, remote, &opts(Environment::Production)),
            Resolution::Resolved("192.0.2.9".to_string())
        );
    }

    #[test]
    fn test_untrusted_proxy_headers_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        let o = ResolveOptions { trust_proxy_headers: false, ..opts(Environment::Production) };
        let remote = Some(IpAddr::from([192, 0, 2, 9]));
        assert_eq!(resolve_client_identifier(&headers, remote, &o).identifier(), "192.0.2.9");
    }

    #[test]
    fn test_unknown_in_production() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("TestBrowser/1.0"));
        let res = resolve_client_identifier(&headers, None, &opts(Environment::Production));
        assert_eq!(
            res,
            Resolution::Fallback { identifier: UNKNOWN_IDENTIFIER.to_string(), reason: FallbackReason::NoAddress }
        );
    }

    #[test]
    fn test_descriptor_fallback_in_development() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("TestBrowser/1.0 (X11; Linux x86_64) Gecko/20100101"));
        let res = resolve_client_identifier(&headers, None, &opts(Environment::Development));
        assert!(res.is_fallback());
        assert_eq!(res.identifier(), "ua:TestBrowser/1.0__X11__Linux_x86_");
        assert_eq!(res.identifier().len(), "ua:".len() + 32);
    }

    #[test]
    fn test_no_descriptor_in_development_is_unknown() {
        let res = resolve_client_identifier(&HeaderMap::new(), None, &opts(Environment::Development));
        assert_eq!(res.identifier(), UNKNOWN_IDENTIFIER);
    }

    #[test]
    fn test_compose_and_redact() {
        assert_eq!(compose_identifier("a@b.com", "1.2.3.4"), "acct:a@b.com|ip:1.2.3.4");
        assert_eq!(redact_identifier("1.2.3.4"), "1.2***");
        assert_eq!(redact_identifier("acct:abcdef|ip:1.2.3.4"), "acct:a***");
        assert_eq!(redact_identifier(""), "***");
    }

    #[test]
    fn test_account_key_normalizes_and_hides_value() {
        let resolver = IdentityResolver::new(&AppConfig::default());
        let a = resolver.account_key("A@B.com ");
        let b = resolver.account_key("a@b.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains("a@b"));

        let id = resolver.login_identifier(Some("a@b.com"), "1.2.3.4");
        assert_eq!(id, format!("acct:{}|ip:1.2.3.4", b));
        assert_eq!(resolver.login_identifier(None, "1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn test_pseudo_session_is_deterministic_and_valid() {
        let resolver = IdentityResolver::new(&AppConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("TestBrowser/1.0"));

        let first = resolver.pseudo_session(&resolver.resolve(&headers, None));
        let second = resolver.pseudo_session(&resolver.resolve(&headers, None));
        assert_eq!(first, second);
        assert!(is_valid_session_id(&first));
    }

    #[test]
    fn test_session_id_shape() {
        assert!(is_valid_session_id("session-1.2.3.4"));
        assert!(is_valid_session_id("session-2001:db8::1"));
        assert!(!is_valid_session_id("session-"));
        assert!(!is_valid_session_id("other-1.2.3.4"));
        assert!(!is_valid_session_id("session-a;b"));
        assert!(!is_valid_session_id(&format!("session-{}", "a".repeat(200))));
    }
}
