//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Flat deployment environment variables (`JWT_SECRET`, `READONLY_MODE`, ...)
//! 2. Environment variables (prefix: HOMEBASE_, `__` as section separator)
//! 3. Current working directory: ./homebase.toml
//! 4. Default values
//!
//! An unset or empty `auth.jwt_secret` aborts start-up.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// CORS configuration
    #[serde(default)]
    pub cors: CorsConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// OAuth providers, keyed by provider name (google, microsoft, facebook)
    #[serde(default)]
    pub oauth: HashMap<String, OAuthProviderConfig>,

    /// Storage and quota configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Externally visible base URL, used to build OAuth redirect URIs
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment (dev, staging, production); "production" activates HSTS
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Start in read-only mode (mutable at runtime through admin settings)
    #[serde(default)]
    pub read_only: bool,

    /// Per-request deadline in seconds, propagated to all I/O
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Page to redirect to after a completed OAuth login
    #[serde(default = "default_post_login_redirect")]
    pub post_login_redirect: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_url: default_base_url(),
            environment: default_environment(),
            read_only: false,
            request_timeout_secs: default_request_timeout(),
            post_login_redirect: default_post_login_redirect(),
        }
    }
}

impl ServerConfig {
    /// Whether production hardening (HSTS) applies
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC signing secret for bearer tokens (required, empty is fatal)
    #[serde(default)]
    pub jwt_secret: String,

    /// Access token lifetime in seconds (default 24 h)
    #[serde(default = "default_access_lifetime")]
    pub access_token_lifetime_secs: i64,

    /// Refresh token lifetime in seconds (default 30 d)
    #[serde(default = "default_refresh_lifetime")]
    pub refresh_token_lifetime_secs: i64,

    /// bcrypt cost factor (minimum 10)
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Minimum accepted password length
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,

    /// API key prefix shown in the UI and used for recognition (e.g. "hb")
    #[serde(default = "default_api_key_prefix")]
    pub api_key_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_lifetime_secs: default_access_lifetime(),
            refresh_token_lifetime_secs: default_refresh_lifetime(),
            bcrypt_cost: default_bcrypt_cost(),
            min_password_length: default_min_password_length(),
            api_key_prefix: default_api_key_prefix(),
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to make credentialed requests
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Allowed methods (empty = common defaults)
    #[serde(default)]
    pub allowed_methods: Vec<String>,

    /// Allowed request headers (empty = common defaults)
    #[serde(default)]
    pub allowed_headers: Vec<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per window per principal or client IP
    #[serde(default = "default_rpm")]
    pub requests_per_window: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests per window on expensive routes
    #[serde(default = "default_strict_rpm")]
    pub strict_requests_per_window: u32,

    /// Path prefixes subject to the strict bucket
    #[serde(default = "default_strict_prefixes")]
    pub strict_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_rpm(),
            window_secs: default_window_secs(),
            strict_requests_per_window: default_strict_rpm(),
            strict_prefixes: default_strict_prefixes(),
        }
    }
}

/// OAuth provider configuration; a missing client id disables the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// OAuth client ID
    #[serde(default)]
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// Scopes to request (empty = provider defaults)
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthProviderConfig {
    /// Provider is configured when both credentials are present
    pub fn is_enabled(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// Storage and quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Filesystem root for the local object-store backend
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Default per-role storage budget in bytes
    #[serde(default = "default_storage_bytes")]
    pub default_storage_bytes: i64,

    /// Default per-role monthly bandwidth budget in bytes
    #[serde(default = "default_bandwidth_bytes")]
    pub default_bandwidth_bytes: i64,

    /// Capability token lifetime in seconds (capped at one hour)
    #[serde(default = "default_capability_ttl")]
    pub capability_token_ttl_secs: i64,

    /// Maximum accepted request body for uploads, in bytes
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_storage_bytes: default_storage_bytes(),
            default_bandwidth_bytes: default_bandwidth_bytes(),
            capability_token_ttl_secs: default_capability_ttl(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, `./homebase.toml`, and environment
    pub fn load() -> Result<Self> {
        Self::load_from(Figment::new())
    }

    /// Load configuration, merging an extra figment layer first (for tests)
    pub fn load_from(overrides: Figment) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("homebase.toml"))
            .merge(Env::prefixed("HOMEBASE_").split("__"))
            .merge(overrides);

        let mut config: Config = figment.extract()?;
        config.apply_flat_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the flat, documented deployment variables over the figment tree
    fn apply_flat_env(&mut self) {
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(mode) = std::env::var("READONLY_MODE") {
            self.server.read_only = mode == "true";
        }
        if let Ok(base) = std::env::var("BASE_URL") {
            self.server.base_url = base;
        }
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            self.server.environment = env;
        }
        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            self.cors.allowed_origins = split_csv(&origins);
        }
        if let Ok(methods) = std::env::var("CORS_ALLOWED_METHODS") {
            self.cors.allowed_methods = split_csv(&methods);
        }
        if let Ok(headers) = std::env::var("CORS_ALLOWED_HEADERS") {
            self.cors.allowed_headers = split_csv(&headers);
        }
        if let Ok(bytes) = std::env::var("DEFAULT_STORAGE_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.storage.default_storage_bytes = n;
            }
        }
        if let Ok(bytes) = std::env::var("DEFAULT_BANDWIDTH_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.storage.default_bandwidth_bytes = n;
            }
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }

        for provider in ["google", "microsoft", "facebook"] {
            let upper = provider.to_uppercase();
            let id = std::env::var(format!("OAUTH_{}_CLIENT_ID", upper)).ok();
            let secret = std::env::var(format!("OAUTH_{}_CLIENT_SECRET", upper)).ok();
            if id.is_none() && secret.is_none() {
                continue;
            }
            let entry = self.oauth.entry(provider.to_string()).or_default();
            if let Some(id) = id {
                entry.client_id = id;
            }
            if let Some(secret) = secret {
                entry.client_secret = secret;
            }
        }
    }

    /// Validate invariants that must hold before the server starts
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(Error::Config(Box::new(figment::Error::from(
                "auth.jwt_secret (JWT_SECRET) must be set and non-empty".to_string(),
            ))));
        }
        if self.auth.bcrypt_cost < 10 {
            return Err(Error::Config(Box::new(figment::Error::from(
                "auth.bcrypt_cost must be at least 10".to_string(),
            ))));
        }
        if self.cors.allowed_origins.iter().any(|o| o == "*") {
            // Credentials are always in play (cookies), so a wildcard origin
            // would break the CORS credential rules.
            return Err(Error::Config(Box::new(figment::Error::from(
                "cors.allowed_origins may not contain \"*\"".to_string(),
            ))));
        }
        if self.storage.capability_token_ttl_secs > 3600 {
            return Err(Error::Config(Box::new(figment::Error::from(
                "storage.capability_token_ttl_secs may not exceed 3600".to_string(),
            ))));
        }
        Ok(())
    }

    /// Redirect URI for a provider callback, built from the base URL
    pub fn oauth_redirect_uri(&self, provider: &str) -> String {
        format!(
            "{}/auth/oauth/callback/{}",
            self.server.base_url.trim_end_matches('/'),
            provider
        )
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn default_bind() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_post_login_redirect() -> String {
    "/".to_string()
}

fn default_access_lifetime() -> i64 {
    24 * 60 * 60
}

fn default_refresh_lifetime() -> i64 {
    30 * 24 * 60 * 60
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_min_password_length() -> usize {
    8
}

fn default_api_key_prefix() -> String {
    "hb".to_string()
}

fn default_rpm() -> u32 {
    300
}

fn default_window_secs() -> u64 {
    60
}

fn default_strict_rpm() -> u32 {
    20
}

fn default_strict_prefixes() -> Vec<String> {
    vec![
        "/api/admin/logs/export".to_string(),
        "/api/admin/database".to_string(),
    ]
}

fn default_data_dir() -> String {
    "./data/storage".to_string()
}

fn default_storage_bytes() -> i64 {
    1024 * 1024 * 1024
}

fn default_bandwidth_bytes() -> i64 {
    10 * 1024 * 1024 * 1024
}

fn default_capability_ttl() -> i64 {
    3600
}

fn default_max_upload() -> usize {
    256 * 1024 * 1024
}

fn default_max_connections() -> u32 {
    10
}
