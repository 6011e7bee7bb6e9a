use serde::Deserialize;

use crate::middleware::ip::{MAX_SESSION_ID_LEN, SESSION_PREFIX};

/// Deployment mode. Production tightens cookie attributes and requires an identity secret.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub max_body_bytes: usize,
}

/// Paths the governor classifies. GETs on any of them issue a CSRF token.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
    pub token_paths: Vec<String>,
    pub login_paths: Vec<String>,
    pub signup_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login: PolicyConfig,
    pub signup: PolicyConfig,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub form_field: String,
    pub token_bytes: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
    pub hash_session_ids: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub trust_proxy_headers: bool,
    /// Number of reverse proxies in front of the service that append to `X-Forwarded-For`.
    pub trusted_proxy_hops: usize,
    pub descriptor_prefix_len: usize,
    /// Key for hashing account values and pseudo-session ids.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    pub enable_hsts: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub routes: RoutesConfig,
    pub rate_limit: RateLimitConfig,
    pub csrf: CsrfConfig,
    pub identity: IdentityConfig,
    pub security: Option<SecurityConfig>,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

/// Paths served by the operational endpoints, unavailable to `[routes]`.
pub const RESERVED_PATHS: [&str; 4] = ["/healthz", "/metrics", "/metrics/prometheus", "/version"];

/// Used when no secret is configured outside of production.
pub const DEVELOPMENT_SECRET: &str = "torwache-development-only-secret";

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
        {
            Ok(cfg) => match cfg.try_deserialize() {
                Ok(app_cfg) => app_cfg,
                Err(e) => {
                    eprintln!("FATAL: Failed to deserialize default config: {}", e);
                    panic!("Failed to deserialize default config: {}", e);
                }
            },
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

impl AppConfig {
    /// The secret used for keyed hashing. Falls back to a fixed development key, which
    /// `validate` forbids in production.
    pub fn identity_secret(&self) -> &str {
        self.identity
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEVELOPMENT_SECRET)
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: torwache.toml (in CWD)
        .add_source(::config::File::with_name("torwache").required(false));

    if let Ok(custom_path) = std::env::var("TORWACHE_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(::config::Environment::with_prefix("TORWACHE").separator("__"));

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    // Server
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }
    if cfg.server.max_body_bytes == 0 {
        return Err(anyhow::anyhow!("server.max_body_bytes must be > 0"));
    }

    // Routes
    for (name, paths) in [
        ("routes.token_paths", &cfg.routes.token_paths),
        ("routes.login_paths", &cfg.routes.login_paths),
        ("routes.signup_paths", &cfg.routes.signup_paths),
    ] {
        if paths.is_empty() {
            return Err(anyhow::anyhow!("{} must not be empty", name));
        }
        if let Some(bad) = paths.iter().find(|p| !p.starts_with('/')) {
            return Err(anyhow::anyhow!("{} entry must start with '/': {}", name, bad));
        }
        // Literal paths only; request paths are compared with the trailing slash trimmed
        if let Some(bad) = paths
            .iter()
            .find(|p| (p.len() > 1 && p.ends_with('/')) || p.contains(['{', '}', '*', '?', '#']))
        {
            return Err(anyhow::anyhow!("{} entry must be a literal path without trailing '/': {}", name, bad));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for path in cfg
        .routes
        .token_paths
        .iter()
        .chain(&cfg.routes.login_paths)
        .chain(&cfg.routes.signup_paths)
    {
        if RESERVED_PATHS.contains(&path.as_str()) {
            return Err(anyhow::anyhow!("route {} collides with a built-in endpoint", path));
        }
        if !seen.insert(path.as_str()) {
            return Err(anyhow::anyhow!("route {} is configured more than once", path));
        }
    }

    // Rate limiting
    for (name, policy) in [("rate_limit.login", cfg.rate_limit.login), ("rate_limit.signup", cfg.rate_limit.signup)] {
        if policy.limit == 0 {
            return Err(anyhow::anyhow!("{}.limit must be > 0", name));
        }
        // Upper bound keeps window arithmetic inside chrono's range
        if policy.window_secs == 0 || policy.window_secs > 366 * 24 * 3600 {
            return Err(anyhow::anyhow!("{}.window_secs must be in 1..=31622400", name));
        }
    }
    if cfg.rate_limit.max_entries == 0 {
        return Err(anyhow::anyhow!("rate_limit.max_entries must be > 0"));
    }
    if cfg.rate_limit.sweep_interval_secs == 0 {
        return Err(anyhow::anyhow!("rate_limit.sweep_interval_secs must be > 0"));
    }

    // CSRF
    if cfg.csrf.token_bytes < 16 {
        return Err(anyhow::anyhow!("csrf.token_bytes must be >= 16 (128 bits)"));
    }
    if cfg.csrf.ttl_secs == 0 || cfg.csrf.ttl_secs > 366 * 24 * 3600 {
        return Err(anyhow::anyhow!("csrf.ttl_secs must be in 1..=31622400"));
    }
    if cfg.csrf.max_entries == 0 {
        return Err(anyhow::anyhow!("csrf.max_entries must be > 0"));
    }
    if cfg.csrf.sweep_interval_secs == 0 {
        return Err(anyhow::anyhow!("csrf.sweep_interval_secs must be > 0"));
    }
    if cfg.csrf.cookie_name.is_empty()
        || !cfg.csrf.cookie_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(anyhow::anyhow!("invalid csrf.cookie_name: {:?}", cfg.csrf.cookie_name));
    }
    if axum::http::HeaderName::from_bytes(cfg.csrf.header_name.as_bytes()).is_err() {
        return Err(anyhow::anyhow!("invalid csrf.header_name: {:?}", cfg.csrf.header_name));
    }

    // Identity
    if cfg.identity.descriptor_prefix_len == 0 {
        return Err(anyhow::anyhow!("identity.descriptor_prefix_len must be > 0"));
    }
    // Unhashed pseudo-sessions embed the descriptor and must still pass session id validation
    let max_prefix_len = MAX_SESSION_ID_LEN - SESSION_PREFIX.len() - "ua:".len();
    if !cfg.csrf.hash_session_ids && cfg.identity.descriptor_prefix_len > max_prefix_len {
        return Err(anyhow::anyhow!(
            "identity.descriptor_prefix_len must be <= {} while csrf.hash_session_ids is off",
            max_prefix_len
        ));
    }
    if cfg.identity.trusted_proxy_hops == 0 {
        return Err(anyhow::anyhow!("identity.trusted_proxy_hops must be > 0"));
    }
    if cfg.server.environment.is_production() && cfg.identity.trust_proxy_headers {
        tracing::warn!(
            "identity.trust_proxy_headers is enabled: X-Forwarded-For is trusted from the last {} hop(s); \
             only safe when every request arrives through those proxies",
            cfg.identity.trusted_proxy_hops
        );
    }
    let secret_len = cfg.identity.secret.as_deref().map(str::len).unwrap_or(0);
    if cfg.server.environment.is_production() && secret_len < 16 {
        return Err(anyhow::anyhow!(
            "identity.secret is required in production and must be at least 16 bytes"
        ));
    }

    Ok(())
}
