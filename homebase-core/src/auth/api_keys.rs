//! API key generation and verification
//!
//! Keys follow the format `{prefix}_{base64url(random)}` with at least 192
//! bits of entropy. Only the SHA-256 digest of the full key is stored; the
//! short prefix segment is kept alongside it for UI display.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// API key record as persisted (never contains the plaintext key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Database ID
    pub id: Uuid,

    /// Owning user ID
    pub user_id: Uuid,

    /// User-provided name for the key
    pub display_name: String,

    /// Displayable key prefix (e.g. "hb_3kf9")
    pub key_prefix: String,

    /// SHA-256 digest of the full key, hex-encoded
    pub key_hash: String,

    /// When this key was created
    pub created_at: DateTime<Utc>,

    /// When this key expires (None = never)
    pub expires_at: Option<DateTime<Utc>>,

    /// When this key was last used
    pub last_used_at: Option<DateTime<Utc>>,

    /// Client IP of the last use
    pub last_used_ip: Option<String>,

    /// When this key was revoked (None = live)
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Check if the key is currently valid (not revoked, not expired)
    pub fn is_valid(&self) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => Utc::now() < expires_at,
            None => true,
        }
    }
}

/// API key generator bound to the platform prefix
#[derive(Clone)]
pub struct ApiKeyGenerator {
    prefix: String,
}

impl ApiKeyGenerator {
    /// Create a generator with the configured platform prefix (e.g. "hb")
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generate a new API key
    ///
    /// Returns `(plaintext, display_prefix, hash)`. The plaintext is shown to
    /// the caller exactly once; only the hash and display prefix are stored.
    pub fn generate(&self) -> (String, String, String) {
        let random_bytes: [u8; 32] = rand::random();
        let encoded = URL_SAFE_NO_PAD.encode(random_bytes);
        let key = format!("{}_{}", self.prefix, encoded);

        let display_prefix = format!("{}_{}", self.prefix, &encoded[..4]);
        let hash = hash_key(&key);

        (key, display_prefix, hash)
    }
}

/// SHA-256 digest of a full key, hex-encoded
pub fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Check whether a presented bearer credential is shaped like an API key
///
/// Pattern: `^[a-zA-Z0-9]{2,8}_[A-Za-z0-9_-]{32,}$`. Anything else is
/// treated as a signed bearer token.
pub fn looks_like_api_key(credential: &str) -> bool {
    let Some((prefix, secret)) = credential.split_once('_') else {
        return false;
    };
    if prefix.len() < 2 || prefix.len() > 8 || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }
    secret.len() >= 32
        && secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Generate an opaque URL-safe random token
///
/// Shared by refresh sessions, OAuth state, and capability tokens.
pub fn random_urlsafe_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}
