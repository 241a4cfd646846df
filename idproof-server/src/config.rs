//! HTTP listener, storage and collaborator settings
//!
//! Read from the environment; `Default` is the test profile.
//! Engine tuning (OTP, TOTP, thresholds, limits) lives in `idproof_core::EngineConfig`.

use std::net::SocketAddr;
use std::str::FromStr;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Settings for the REST surface and its backing services
#[derive(Clone)]
pub struct Config {
    /// Server port (default: 3000)
    pub port: u16,
    /// Server host (default: 127.0.0.1)
    pub host: [u8; 4],
    /// Allowed CORS origins, comma-separated (default: allow all in dev)
    pub allowed_origins: Option<Vec<String>>,
    /// Request body limit in MB (default: 50)
    pub body_limit_mb: usize,
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Enable per-IP request throttling (default: false for tests, true when loaded from env)
    pub rate_limit_enabled: bool,
    /// Throttle: requests per second (default: 10)
    pub rate_limit_per_sec: u64,
    /// Throttle: burst size (default: 20)
    pub rate_limit_burst: u32,
    /// Read the client address from `X-Forwarded-For` (default: false).
    /// Enable only behind a proxy that sets the header itself.
    pub trust_forwarded_for: bool,
    /// Bearer token the calling host must present. `None` disables the check.
    pub service_token: Option<String>,
    /// Postgres connection string. In-memory storage when unset.
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 20)
    pub database_max_connections: u32,
    /// Database connection pool minimum connections (default: 2)
    pub database_min_connections: u32,
    /// Document classifier endpoint
    pub classifier_url: Option<String>,
    pub classifier_api_key: Option<String>,
    /// Webhook that sends OTP messages
    pub delivery_webhook_url: Option<String>,
    pub delivery_webhook_token: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("allowed_origins", &self.allowed_origins)
            .field("body_limit_mb", &self.body_limit_mb)
            .field("timeout_secs", &self.timeout_secs)
            .field("rate_limit_enabled", &self.rate_limit_enabled)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("service_token", &redacted(&self.service_token))
            .field("database_url", &redacted(&self.database_url))
            .field("classifier_url", &self.classifier_url)
            .field("delivery_webhook_url", &self.delivery_webhook_url)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            host: [127, 0, 0, 1],
            allowed_origins: None, // None = allow all (dev mode)
            body_limit_mb: 50,
            timeout_secs: 30,
            rate_limit_enabled: false, // Disabled by default (for tests)
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            trust_forwarded_for: false,
            service_token: None,
            database_url: None,
            database_max_connections: 20,
            database_min_connections: 2,
            classifier_url: None,
            classifier_api_key: None,
            delivery_webhook_url: None,
            delivery_webhook_token: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("HOST")
            .ok()
            .map(|h| {
                if h == "0.0.0.0" {
                    [0, 0, 0, 0]
                } else {
                    [127, 0, 0, 1]
                }
            })
            .unwrap_or(defaults.host);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        // Throttling is on in production unless RATE_LIMIT_ENABLED=false
        let rate_limit_enabled = std::env::var("RATE_LIMIT_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        let trust_forwarded_for = std::env::var("TRUST_FORWARDED_FOR")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.trust_forwarded_for);

        Self {
            port: env_or("PORT", defaults.port),
            host,
            allowed_origins,
            body_limit_mb: env_or("BODY_LIMIT_MB", defaults.body_limit_mb),
            timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.timeout_secs),
            rate_limit_enabled,
            rate_limit_per_sec: env_or("RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", defaults.rate_limit_burst),
            trust_forwarded_for,
            service_token: env_opt("SERVICE_TOKEN"),
            database_url: env_opt("DATABASE_URL"),
            database_max_connections: env_or(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            database_min_connections: env_or(
                "DATABASE_MIN_CONNECTIONS",
                defaults.database_min_connections,
            ),
            classifier_url: env_opt("CLASSIFIER_URL"),
            classifier_api_key: env_opt("CLASSIFIER_API_KEY"),
            delivery_webhook_url: env_opt("DELIVERY_WEBHOOK_URL"),
            delivery_webhook_token: env_opt("DELIVERY_WEBHOOK_TOKEN"),
        }
    }

    /// Get socket address from config
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}
