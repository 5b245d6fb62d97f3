//! Credential aggregates: OAuth linkages, refresh sessions, API keys

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RepositoryResult;
use crate::auth::api_keys::ApiKey;

/// Link between a platform user and an identity at an OAuth provider
///
/// Unique on `(provider, provider_user_id)`. Provider tokens never leave the
/// auth subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthLink {
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A refresh session
///
/// The presented refresh token is stored only as a SHA-256 digest. Sessions
/// in one `family_id` descend from one login; replaying a retired member
/// revokes the whole family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub refresh_token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshSession {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none() && Utc::now() < self.expires_at
    }
}

/// Repository for OAuth linkages
#[async_trait]
pub trait OAuthLinkRepo: Send + Sync {
    /// Insert or refresh the link for `(provider, provider_user_id)`
    async fn upsert(&self, link: &OAuthLink) -> RepositoryResult<()>;

    async fn find(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepositoryResult<Option<OAuthLink>>;

    async fn list_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<OAuthLink>>;

    async fn delete(&self, user_id: Uuid, provider: &str) -> RepositoryResult<()>;
}

/// Repository for refresh sessions
#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create(&self, session: &RefreshSession) -> RepositoryResult<()>;

    async fn find_by_token_hash(&self, hash: &str) -> RepositoryResult<Option<RefreshSession>>;

    async fn revoke(&self, id: Uuid) -> RepositoryResult<()>;

    /// Revoke every session in a family (reuse detection)
    async fn revoke_family(&self, family_id: Uuid) -> RepositoryResult<u64>;

    /// Revoke every session of a user (logout-everywhere, password change)
    async fn revoke_all_for_user(&self, user_id: Uuid) -> RepositoryResult<u64>;
}

/// Repository for API keys
#[async_trait]
pub trait ApiKeyRepo: Send + Sync {
    async fn create(&self, key: &ApiKey) -> RepositoryResult<()>;

    async fn find_by_hash(&self, key_hash: &str) -> RepositoryResult<Option<ApiKey>>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<ApiKey>>;

    async fn list_by_user(&self, user_id: Uuid) -> RepositoryResult<Vec<ApiKey>>;

    /// Revoke a key; revoking an already-revoked key is a no-op success
    async fn revoke(&self, id: Uuid) -> RepositoryResult<()>;

    /// Record `last_used_at` / `last_used_ip`; called off the request path
    async fn touch_usage(&self, id: Uuid, ip: &str) -> RepositoryResult<()>;
}
