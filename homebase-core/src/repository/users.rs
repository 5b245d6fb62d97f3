//! User aggregate and its repository trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RepositoryResult;

/// A platform user
///
/// `password_hash` is absent for OAuth-only users. Users are never
/// hard-deleted while they own live objects; `active = false` marks a
/// soft-deleted account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub display_name: String,
    pub confirmed: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build a new user record; the caller decides the password hash
    pub fn new(email: &str, password_hash: Option<String>, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash,
            display_name: display_name.to_string(),
            confirmed: false,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Owner-editable profile fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfileUpdate {
    pub display_name: Option<String>,
}

/// Repository for the user aggregate
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Insert a new user; fails with `Conflict` on a duplicate email
    async fn create(&self, user: &User) -> RepositoryResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>>;

    /// Case-insensitive email lookup
    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>>;

    async fn update_profile(&self, id: Uuid, update: &UserProfileUpdate) -> RepositoryResult<()>;

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> RepositoryResult<()>;

    async fn set_confirmed(&self, id: Uuid, confirmed: bool) -> RepositoryResult<()>;

    /// Soft delete / reactivate
    async fn set_active(&self, id: Uuid, active: bool) -> RepositoryResult<()>;

    async fn list(&self, limit: i64, offset: i64) -> RepositoryResult<Vec<User>>;

    async fn count(&self) -> RepositoryResult<i64>;
}
