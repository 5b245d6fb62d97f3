//! PostgreSQL repository implementations
//!
//! Row structs mirror the table shapes and convert into the domain types, so
//! the domain layer never sees sqlx. Counter updates and capability-token
//! claims are single atomic statements; there is no read-modify-write on
//! shared counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::credentials::{ApiKeyRepo, OAuthLink, OAuthLinkRepo, RefreshSession, SessionRepo};
use super::error::{RepositoryError, RepositoryResult};
use super::iam::{AuditLogRepo, PolicyRepo, RoleRepo};
use super::storage::{CapabilityTokenRepo, ObjectRepo, QuotaRepo};
use super::users::{User, UserProfileUpdate, UserRepo};
use crate::auth::api_keys::ApiKey;
use crate::iam::model::{
    AuditEntry, AuditFilter, Effect, Grouping, Role, RoleType, Rule, UserRole,
};
use crate::storage::model::{DownloadToken, QuotaRecord, StorageObject, UploadToken};

/// Run the embedded migrations; IAM table failures abort start-up upstream
pub async fn migrate(pool: &PgPool) -> RepositoryResult<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|e| RepositoryError::Backend(format!("migration failed: {}", e)))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: Option<String>,
    display_name: String,
    confirmed: bool,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            display_name: row.display_name,
            confirmed: row.confirmed,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed user repository
#[derive(Clone)]
pub struct PgUserRepo {
    pool: PgPool,
}

impl PgUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn create(&self, user: &User) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO auth_users (id, email, password_hash, display_name, confirmed, active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.display_name)
        .bind(user.confirmed)
        .bind(user.active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM auth_users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    async fn find_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        let row =
            sqlx::query_as::<_, UserRow>("SELECT * FROM auth_users WHERE lower(email) = lower($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    async fn update_profile(&self, id: Uuid, update: &UserProfileUpdate) -> RepositoryResult<()> {
        if let Some(display_name) = &update.display_name {
            let result = sqlx::query(
                "UPDATE auth_users SET display_name = $2, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(display_name)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
        }
        Ok(())
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE auth_users SET password_hash = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_confirmed(&self, id: Uuid, confirmed: bool) -> RepositoryResult<()> {
        let result =
            sqlx::query("UPDATE auth_users SET confirmed = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(confirmed)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> RepositoryResult<()> {
        let result =
            sqlx::query("UPDATE auth_users SET active = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(active)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list(&self, limit: i64, offset: i64) -> RepositoryResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM auth_users ORDER BY created_at LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn count(&self) -> RepositoryResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM auth_users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// OAuth links, refresh sessions, API keys
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct OAuthLinkRow {
    user_id: Uuid,
    provider: String,
    provider_user_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OAuthLinkRow> for OAuthLink {
    fn from(row: OAuthLinkRow) -> Self {
        Self {
            user_id: row.user_id,
            provider: row.provider,
            provider_user_id: row.provider_user_id,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed OAuth link repository
#[derive(Clone)]
pub struct PgOAuthLinkRepo {
    pool: PgPool,
}

impl PgOAuthLinkRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuthLinkRepo for PgOAuthLinkRepo {
    async fn upsert(&self, link: &OAuthLink) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO auth_oauth_links
               (user_id, provider, provider_user_id, access_token, refresh_token, expires_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now(), now())
             ON CONFLICT (provider, provider_user_id) DO UPDATE SET
               access_token = EXCLUDED.access_token,
               refresh_token = EXCLUDED.refresh_token,
               expires_at = EXCLUDED.expires_at,
               updated_at = now()",
        )
        .bind(link.user_id)
        .bind(&link.provider)
        .bind(&link.provider_user_id)
        .bind(&link.access_token)
        .bind(&link.refresh_token)
        .bind(link.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepositoryResult<Option<OAuthLink>> {
        let row = sqlx::query_as::<_, OAuthLinkRow>(
            "SELECT * FROM auth_oauth_links WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OAuthLink::from))
    }

    async fn list_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<OAuthLink>> {
        let rows = sqlx::query_as::<_, OAuthLinkRow>(
            "SELECT * FROM auth_oauth_links WHERE user_id = $1 ORDER BY provider",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OAuthLink::from).collect())
    }

    async fn delete(&self, user_id: Uuid, provider: &str) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM auth_oauth_links WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    family_id: Uuid,
    refresh_token_hash: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for RefreshSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            family_id: row.family_id,
            refresh_token_hash: row.refresh_token_hash,
            created_at: row.created_at,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
        }
    }
}

/// Postgres-backed refresh session repository
#[derive(Clone)]
pub struct PgSessionRepo {
    pool: PgPool,
}

impl PgSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepo for PgSessionRepo {
    async fn create(&self, session: &RefreshSession) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO auth_refresh_sessions
               (id, user_id, family_id, refresh_token_hash, created_at, expires_at, revoked_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.family_id)
        .bind(&session.refresh_token_hash)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.revoked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_token_hash(&self, hash: &str) -> RepositoryResult<Option<RefreshSession>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM auth_refresh_sessions WHERE refresh_token_hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshSession::from))
    }

    async fn revoke(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE auth_refresh_sessions SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_family(&self, family_id: Uuid) -> RepositoryResult<u64> {
        let result = sqlx::query(
            "UPDATE auth_refresh_sessions SET revoked_at = now() WHERE family_id = $1 AND revoked_at IS NULL",
        )
        .bind(family_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> RepositoryResult<u64> {
        let result = sqlx::query(
            "UPDATE auth_refresh_sessions SET revoked_at = now() WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    user_id: Uuid,
    display_name: String,
    key_prefix: String,
    key_hash: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    last_used_ip: Option<String>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            display_name: row.display_name,
            key_prefix: row.key_prefix,
            key_hash: row.key_hash,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            last_used_ip: row.last_used_ip,
            revoked_at: row.revoked_at,
        }
    }
}

/// Postgres-backed API key repository
#[derive(Clone)]
pub struct PgApiKeyRepo {
    pool: PgPool,
}

impl PgApiKeyRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepo for PgApiKeyRepo {
    async fn create(&self, key: &ApiKey) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO auth_api_keys
               (id, user_id, display_name, key_prefix, key_hash, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(key.id)
        .bind(key.user_id)
        .bind(&key.display_name)
        .bind(&key.key_prefix)
        .bind(&key.key_hash)
        .bind(key.created_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, key_hash: &str) -> RepositoryResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM auth_api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM auth_api_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn list_by_user(&self, user_id: Uuid) -> RepositoryResult<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM auth_api_keys WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    async fn revoke(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE auth_api_keys SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_usage(&self, id: Uuid, ip: &str) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE auth_api_keys SET last_used_at = now(), last_used_ip = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IAM
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    name: String,
    display_name: String,
    description: String,
    role_type: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            role_type: RoleType::parse(&row.role_type),
            metadata: serde_json::from_value(row.metadata).unwrap_or_default(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed role repository
#[derive(Clone)]
pub struct PgRoleRepo {
    pool: PgPool,
}

impl PgRoleRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleRepo for PgRoleRepo {
    async fn create(&self, role: &Role) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO iam_roles (id, name, display_name, description, role_type, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(role.role_type.as_str())
        .bind(serde_json::to_value(&role.metadata)?)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, role: &Role) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE iam_roles SET display_name = $2, description = $3, metadata = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(role.id)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(serde_json::to_value(&role.metadata)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM iam_roles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>("SELECT * FROM iam_roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Role::from))
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>("SELECT * FROM iam_roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Role::from))
    }

    async fn list(&self) -> RepositoryResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>("SELECT * FROM iam_roles ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn count(&self) -> RepositoryResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM iam_roles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn assign(&self, binding: &UserRole) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO iam_user_roles (user_id, role_id, granted_by, granted_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, role_id) DO NOTHING",
        )
        .bind(binding.user_id)
        .bind(binding.role_id)
        .bind(binding.granted_by)
        .bind(binding.granted_at)
        .bind(binding.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unassign(&self, user_id: Uuid, role_id: Uuid) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM iam_user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(
            "SELECT r.* FROM iam_roles r
             JOIN iam_user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = $1 AND (ur.expires_at IS NULL OR ur.expires_at > now())
             ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn remove_assignments_for_role(&self, role_id: Uuid) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM iam_user_roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    v0: String,
    v1: String,
    v2: String,
    v3: String,
}

/// Postgres-backed policy repository
#[derive(Clone)]
pub struct PgPolicyRepo {
    pool: PgPool,
}

impl PgPolicyRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepo for PgPolicyRepo {
    async fn load_rules(&self) -> RepositoryResult<Vec<Rule>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT v0, v1, v2, v3 FROM iam_policies WHERE ptype = 'p' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Rule {
                subject: row.v0,
                object: row.v1,
                action: row.v2,
                effect: Effect::parse(&row.v3),
            })
            .collect())
    }

    async fn load_groupings(&self) -> RepositoryResult<Vec<Grouping>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT v0, v1, v2, v3 FROM iam_policies WHERE ptype = 'g' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let user_id = Uuid::parse_str(&row.v0).ok()?;
                Some(Grouping {
                    user_id,
                    role: row.v1,
                })
            })
            .collect())
    }

    async fn add_rule(&self, rule: &Rule) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO iam_policies (ptype, v0, v1, v2, v3)
             VALUES ('p', $1, $2, $3, $4)
             ON CONFLICT (ptype, v0, v1, v2, v3) DO NOTHING",
        )
        .bind(&rule.subject)
        .bind(&rule.object)
        .bind(&rule.action)
        .bind(rule.effect.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_rule(&self, rule: &Rule) -> RepositoryResult<()> {
        sqlx::query(
            "DELETE FROM iam_policies
             WHERE ptype = 'p' AND v0 = $1 AND v1 = $2 AND v2 = $3 AND v3 = $4",
        )
        .bind(&rule.subject)
        .bind(&rule.object)
        .bind(&rule.action)
        .bind(rule.effect.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_rules_for_subject(&self, subject: &str) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM iam_policies WHERE ptype = 'p' AND v0 = $1")
            .bind(subject)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn add_grouping(&self, grouping: &Grouping) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO iam_policies (ptype, v0, v1, v2, v3)
             VALUES ('g', $1, $2, '', '')
             ON CONFLICT (ptype, v0, v1, v2, v3) DO NOTHING",
        )
        .bind(grouping.user_id.to_string())
        .bind(&grouping.role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_grouping(&self, grouping: &Grouping) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM iam_policies WHERE ptype = 'g' AND v0 = $1 AND v1 = $2")
            .bind(grouping.user_id.to_string())
            .bind(&grouping.role)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_groupings_for_role(&self, role: &str) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM iam_policies WHERE ptype = 'g' AND v1 = $1")
            .bind(role)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn groupings_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT v1 FROM iam_policies WHERE ptype = 'g' AND v0 = $1",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(role,)| role).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    user_id: Option<Uuid>,
    path: String,
    action: String,
    result: String,
    reason: String,
    ip: String,
    user_agent: String,
    created_at: DateTime<Utc>,
}

impl From<AuditRow> for AuditEntry {
    fn from(row: AuditRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            path: row.path,
            action: row.action,
            result: row.result,
            reason: row.reason,
            ip: row.ip,
            user_agent: row.user_agent,
            created_at: row.created_at,
        }
    }
}

/// Postgres-backed audit log
#[derive(Clone)]
pub struct PgAuditLogRepo {
    pool: PgPool,
}

impl PgAuditLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLogRepo for PgAuditLogRepo {
    async fn append(&self, entry: &AuditEntry) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO iam_audit_logs (user_id, path, action, result, reason, ip, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.user_id)
        .bind(&entry.path)
        .bind(&entry.action)
        .bind(&entry.result)
        .bind(&entry.reason)
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, filter: &AuditFilter) -> RepositoryResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM iam_audit_logs
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::text IS NULL OR result = $2)
             ORDER BY id DESC LIMIT $3 OFFSET $4",
        )
        .bind(filter.user_id)
        .bind(&filter.result)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditEntry::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ObjectRow {
    id: Uuid,
    bucket: String,
    object_key: String,
    parent_folder_id: Option<Uuid>,
    user_id: Uuid,
    app_id: Option<String>,
    size: i64,
    content_type: String,
    checksum: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_viewed: Option<DateTime<Utc>>,
}

impl From<ObjectRow> for StorageObject {
    fn from(row: ObjectRow) -> Self {
        Self {
            id: row.id,
            bucket: row.bucket,
            object_key: row.object_key,
            parent_folder_id: row.parent_folder_id,
            user_id: row.user_id,
            app_id: row.app_id,
            size: row.size,
            content_type: row.content_type,
            checksum: row.checksum,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_viewed: row.last_viewed,
        }
    }
}

/// Postgres-backed object metadata repository
#[derive(Clone)]
pub struct PgObjectRepo {
    pool: PgPool,
}

impl PgObjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObjectRepo for PgObjectRepo {
    async fn insert(&self, object: &StorageObject) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO storage_objects
               (id, bucket, object_key, parent_folder_id, user_id, app_id, size, content_type, checksum, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(object.id)
        .bind(&object.bucket)
        .bind(&object.object_key)
        .bind(object.parent_folder_id)
        .bind(object.user_id)
        .bind(&object.app_id)
        .bind(object.size)
        .bind(&object.content_type)
        .bind(&object.checksum)
        .bind(object.created_at)
        .bind(object.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<StorageObject>> {
        let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM storage_objects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StorageObject::from))
    }

    async fn delete(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM storage_objects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename(&self, id: Uuid, object_key: &str) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE storage_objects SET object_key = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(object_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn touch_viewed(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query("UPDATE storage_objects SET last_viewed = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_bucket(
        &self,
        bucket: &str,
        owner: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>> {
        let rows = sqlx::query_as::<_, ObjectRow>(
            "SELECT * FROM storage_objects
             WHERE bucket = $1 AND ($2::uuid IS NULL OR user_id = $2)
             ORDER BY object_key",
        )
        .bind(bucket)
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StorageObject::from).collect())
    }

    async fn list_children(
        &self,
        bucket: &str,
        owner: Uuid,
        parent: Option<Uuid>,
    ) -> RepositoryResult<Vec<StorageObject>> {
        let rows = sqlx::query_as::<_, ObjectRow>(
            "SELECT * FROM storage_objects
             WHERE bucket = $1 AND user_id = $2 AND parent_folder_id IS NOT DISTINCT FROM $3
             ORDER BY object_key",
        )
        .bind(bucket)
        .bind(owner)
        .bind(parent)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StorageObject::from).collect())
    }

    async fn stats_for_user(&self, user_id: Uuid) -> RepositoryResult<(i64, i64)> {
        let (count, bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0)::BIGINT FROM storage_objects WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((count, bytes))
    }

    async fn list_buckets(&self, owner: Option<Uuid>) -> RepositoryResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT DISTINCT bucket FROM storage_objects
             WHERE ($1::uuid IS NULL OR user_id = $1)
             ORDER BY bucket",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(bucket,)| bucket).collect())
    }
}

#[derive(sqlx::FromRow)]
struct DownloadTokenRow {
    id: Uuid,
    token: String,
    user_id: Option<Uuid>,
    bucket: String,
    object_id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    callback_at: Option<DateTime<Utc>>,
    bytes_served: i64,
}

impl From<DownloadTokenRow> for DownloadToken {
    fn from(row: DownloadTokenRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            user_id: row.user_id,
            bucket: row.bucket,
            object_id: row.object_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
            callback_at: row.callback_at,
            bytes_served: row.bytes_served,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UploadTokenRow {
    id: Uuid,
    token: String,
    user_id: Option<Uuid>,
    bucket: String,
    object_key: String,
    parent_folder_id: Option<Uuid>,
    max_size: Option<i64>,
    content_type: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    bytes_uploaded: i64,
}

impl From<UploadTokenRow> for UploadToken {
    fn from(row: UploadTokenRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            user_id: row.user_id,
            bucket: row.bucket,
            object_key: row.object_key,
            parent_folder_id: row.parent_folder_id,
            max_size: row.max_size,
            content_type: row.content_type,
            created_at: row.created_at,
            expires_at: row.expires_at,
            completed_at: row.completed_at,
            bytes_uploaded: row.bytes_uploaded,
        }
    }
}

/// Postgres-backed capability token repository
#[derive(Clone)]
pub struct PgCapabilityTokenRepo {
    pool: PgPool,
}

impl PgCapabilityTokenRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapabilityTokenRepo for PgCapabilityTokenRepo {
    async fn insert_download(&self, token: &DownloadToken) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO storage_download_tokens
               (id, token, user_id, bucket, object_id, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(token.id)
        .bind(&token.token)
        .bind(token.user_id)
        .bind(&token.bucket)
        .bind(token.object_id)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_upload(&self, token: &UploadToken) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO storage_upload_tokens
               (id, token, user_id, bucket, object_key, parent_folder_id, max_size, content_type, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(token.id)
        .bind(&token.token)
        .bind(token.user_id)
        .bind(&token.bucket)
        .bind(&token.object_key)
        .bind(token.parent_folder_id)
        .bind(token.max_size)
        .bind(&token.content_type)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_download(&self, token: &str) -> RepositoryResult<Option<DownloadToken>> {
        let row = sqlx::query_as::<_, DownloadTokenRow>(
            "SELECT * FROM storage_download_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DownloadToken::from))
    }

    async fn find_upload(&self, token: &str) -> RepositoryResult<Option<UploadToken>> {
        let row = sqlx::query_as::<_, UploadTokenRow>(
            "SELECT * FROM storage_upload_tokens WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UploadToken::from))
    }

    async fn try_claim_download(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_download_tokens SET completed_at = now()
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_claim_upload(&self, id: Uuid) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_upload_tokens SET completed_at = now()
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_download(&self, id: Uuid, bytes_served: i64) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE storage_download_tokens SET bytes_served = $2, callback_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(bytes_served)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_upload(&self, id: Uuid, bytes_uploaded: i64) -> RepositoryResult<()> {
        sqlx::query("UPDATE storage_upload_tokens SET bytes_uploaded = $2 WHERE id = $1")
            .bind(id)
            .bind(bytes_uploaded)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct QuotaRow {
    subject_key: String,
    max_storage_bytes: Option<i64>,
    max_bandwidth_bytes: Option<i64>,
    storage_used: i64,
    bandwidth_used: i64,
    bandwidth_reset_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<QuotaRow> for QuotaRecord {
    fn from(row: QuotaRow) -> Self {
        Self {
            subject_key: row.subject_key,
            max_storage_bytes: row.max_storage_bytes,
            max_bandwidth_bytes: row.max_bandwidth_bytes,
            storage_used: row.storage_used,
            bandwidth_used: row.bandwidth_used,
            bandwidth_reset_at: row.bandwidth_reset_at,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed quota repository
#[derive(Clone)]
pub struct PgQuotaRepo {
    pool: PgPool,
}

impl PgQuotaRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaRepo for PgQuotaRepo {
    async fn get(&self, subject_key: &str) -> RepositoryResult<Option<QuotaRecord>> {
        let row = sqlx::query_as::<_, QuotaRow>(
            "SELECT * FROM ext_cloudstorage_storage_quotas WHERE subject_key = $1",
        )
        .bind(subject_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(QuotaRecord::from))
    }

    async fn ensure(&self, subject_key: &str) -> RepositoryResult<QuotaRecord> {
        sqlx::query(
            "INSERT INTO ext_cloudstorage_storage_quotas (subject_key, bandwidth_reset_at)
             VALUES ($1, now() + interval '1 month')
             ON CONFLICT (subject_key) DO NOTHING",
        )
        .bind(subject_key)
        .execute(&self.pool)
        .await?;
        self.get(subject_key)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    async fn set_limits(
        &self,
        subject_key: &str,
        max_storage_bytes: Option<i64>,
        max_bandwidth_bytes: Option<i64>,
    ) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO ext_cloudstorage_storage_quotas
               (subject_key, max_storage_bytes, max_bandwidth_bytes, bandwidth_reset_at)
             VALUES ($1, $2, $3, now() + interval '1 month')
             ON CONFLICT (subject_key) DO UPDATE SET
               max_storage_bytes = EXCLUDED.max_storage_bytes,
               max_bandwidth_bytes = EXCLUDED.max_bandwidth_bytes,
               updated_at = now()",
        )
        .bind(subject_key)
        .bind(max_storage_bytes)
        .bind(max_bandwidth_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_storage(&self, subject_key: &str, delta: i64) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO ext_cloudstorage_storage_quotas (subject_key, storage_used, bandwidth_reset_at)
             VALUES ($1, GREATEST($2, 0), now() + interval '1 month')
             ON CONFLICT (subject_key) DO UPDATE SET
               storage_used = GREATEST(ext_cloudstorage_storage_quotas.storage_used + $2, 0),
               updated_at = now()",
        )
        .bind(subject_key)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_bandwidth(&self, subject_key: &str, bytes: i64) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO ext_cloudstorage_storage_quotas (subject_key, bandwidth_used, bandwidth_reset_at)
             VALUES ($1, GREATEST($2, 0), now() + interval '1 month')
             ON CONFLICT (subject_key) DO UPDATE SET
               bandwidth_used = CASE
                 WHEN now() >= ext_cloudstorage_storage_quotas.bandwidth_reset_at
                   THEN GREATEST($2, 0)
                 ELSE ext_cloudstorage_storage_quotas.bandwidth_used + GREATEST($2, 0)
               END,
               bandwidth_reset_at = CASE
                 WHEN now() >= ext_cloudstorage_storage_quotas.bandwidth_reset_at
                   THEN ext_cloudstorage_storage_quotas.bandwidth_reset_at + interval '1 month'
                 ELSE ext_cloudstorage_storage_quotas.bandwidth_reset_at
               END,
               updated_at = now()",
        )
        .bind(subject_key)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> RepositoryResult<Vec<QuotaRecord>> {
        let rows = sqlx::query_as::<_, QuotaRow>(
            "SELECT * FROM ext_cloudstorage_storage_quotas ORDER BY subject_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(QuotaRecord::from).collect())
    }
}
