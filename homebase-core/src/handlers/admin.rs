//! Admin endpoints: user CRUD, roles and policies, audit logs, quota
//! overrides, runtime settings
//!
//! The whole surface sits behind the admin gate: `admin` has full access,
//! `admin_viewer` only safe methods.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::iam::{AuditFilter, Effect, Role, RoleMetadata, Rule};
use crate::repository::{User, UserProfileUpdate};
use crate::state::AuthKernel;
use crate::storage::QuotaRecord;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

// -- users -------------------------------------------------------------------

/// `GET /api/admin/users`
pub async fn list_users(
    State(kernel): State<AuthKernel>,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>> {
    let users = kernel.users().list(page.limit, page.offset).await?;
    let total = kernel.users().count().await?;
    Ok(Json(json!({ "users": users, "total": total })))
}

/// `GET /api/admin/users/{id}`
pub async fn get_user(
    State(kernel): State<AuthKernel>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let user = kernel
        .users()
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    let roles = kernel.iam().roles_for_user(id).await?;
    let metadata = kernel.iam().user_effective_metadata(id).await?;
    Ok(Json(json!({
        "user": user,
        "roles": roles,
        "effective_metadata": metadata,
    })))
}

/// `PATCH /api/admin/users/{id}`
///
/// Profile fields only; ids, email confirmation, and passwords are never
/// mutable through this route.
pub async fn update_user(
    State(kernel): State<AuthKernel>,
    Path(id): Path<Uuid>,
    Json(update): Json<UserProfileUpdate>,
) -> Result<Json<User>> {
    kernel.users().update_profile(id, &update).await?;
    let user = kernel
        .users()
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    Ok(Json(user))
}

/// `DELETE /api/admin/users/{id}`
///
/// Soft-delete: the account is marked inactive and its sessions retired;
/// owned objects stay in place.
pub async fn deactivate_user(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    if id == principal.id {
        return Err(Error::BadRequest(
            "Administrators cannot deactivate themselves".to_string(),
        ));
    }
    kernel.users().set_active(id, false).await?;
    kernel.sessions().revoke_all_for_user(id).await?;
    kernel
        .iam()
        .record_event(Some(principal.id), "admin.user.deactivated", &id.to_string());
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role: String,
}

/// `POST /api/admin/users/{id}/roles`
pub async fn assign_role(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignRoleRequest>,
) -> Result<StatusCode> {
    kernel
        .iam()
        .assign_role(id, &request.role, Some(principal.id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/admin/users/{id}/roles/{role}`
pub async fn remove_role(
    State(kernel): State<AuthKernel>,
    Path((id, role)): Path<(Uuid, String)>,
) -> Result<StatusCode> {
    kernel.iam().remove_role(id, &role).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- roles -------------------------------------------------------------------

/// `GET /api/admin/roles`
pub async fn list_roles(State(kernel): State<AuthKernel>) -> Result<Json<Vec<Role>>> {
    Ok(Json(kernel.iam().list_roles().await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: RoleMetadata,
}

/// `POST /api/admin/roles`
pub async fn create_role(
    State(kernel): State<AuthKernel>,
    Json(request): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse> {
    if request.name.trim().is_empty() {
        return Err(Error::ValidationError("Role name required".to_string()));
    }
    let role = kernel
        .iam()
        .create_role(
            request.name.trim(),
            &request.display_name,
            &request.description,
            request.metadata,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRoleRequest {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<RoleMetadata>,
}

/// `PATCH /api/admin/roles/{id}`
pub async fn update_role(
    State(kernel): State<AuthKernel>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateRoleRequest>,
) -> Result<Json<Role>> {
    let role = kernel
        .iam()
        .update_role(id, request.display_name, request.description, request.metadata)
        .await?;
    Ok(Json(role))
}

/// `DELETE /api/admin/roles/{id}`
pub async fn delete_role(
    State(kernel): State<AuthKernel>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    kernel.iam().delete_role(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- policies ----------------------------------------------------------------

/// `GET /api/admin/policies`
pub async fn list_policies(State(kernel): State<AuthKernel>) -> Result<Json<Vec<Rule>>> {
    Ok(Json(kernel.iam().list_rules().await?))
}

#[derive(Debug, Deserialize)]
pub struct RuleRequest {
    pub subject: String,
    pub object: String,
    pub action: String,
    pub effect: Effect,
}

impl From<RuleRequest> for Rule {
    fn from(request: RuleRequest) -> Self {
        Self {
            subject: request.subject,
            object: request.object,
            action: request.action,
            effect: request.effect,
        }
    }
}

/// `POST /api/admin/policies`
pub async fn add_policy(
    State(kernel): State<AuthKernel>,
    Json(request): Json<RuleRequest>,
) -> Result<StatusCode> {
    kernel.iam().add_rule(&Rule::from(request)).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /api/admin/policies`
pub async fn remove_policy(
    State(kernel): State<AuthKernel>,
    Json(request): Json<RuleRequest>,
) -> Result<StatusCode> {
    kernel.iam().remove_rule(&Rule::from(request)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- audit log ---------------------------------------------------------------

/// `GET /api/admin/logs`
pub async fn list_audit_logs(
    State(kernel): State<AuthKernel>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<serde_json::Value>> {
    let entries = kernel.iam().list_audit_logs(&filter).await?;
    Ok(Json(json!({ "entries": entries })))
}

// -- quotas ------------------------------------------------------------------

/// `GET /api/admin/quotas`
pub async fn list_quotas(State(kernel): State<AuthKernel>) -> Result<Json<Vec<QuotaRecord>>> {
    Ok(Json(kernel.quota().list_records().await?))
}

#[derive(Debug, Deserialize)]
pub struct QuotaLimitsRequest {
    pub max_storage_bytes: Option<i64>,
    pub max_bandwidth_bytes: Option<i64>,
}

/// `PUT /api/admin/quotas/users/{id}`
pub async fn set_user_quota(
    State(kernel): State<AuthKernel>,
    Path(id): Path<Uuid>,
    Json(request): Json<QuotaLimitsRequest>,
) -> Result<StatusCode> {
    kernel
        .quota()
        .set_user_override(id, request.max_storage_bytes, request.max_bandwidth_bytes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /api/admin/quotas/roles/{role}`
pub async fn set_role_quota(
    State(kernel): State<AuthKernel>,
    Path(role): Path<String>,
    Json(request): Json<QuotaLimitsRequest>,
) -> Result<StatusCode> {
    kernel
        .quota()
        .set_role_default(&role, request.max_storage_bytes, request.max_bandwidth_bytes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- settings and stats ------------------------------------------------------

/// `GET /api/admin/settings`
pub async fn get_settings(State(kernel): State<AuthKernel>) -> Result<Json<serde_json::Value>> {
    let config = kernel.config();
    Ok(Json(json!({
        "read_only": kernel.is_read_only(),
        "environment": config.server.environment,
        "base_url": config.server.base_url,
        "oauth_providers": kernel.oauth().enabled_providers(),
        "default_storage_bytes": config.storage.default_storage_bytes,
        "default_bandwidth_bytes": config.storage.default_bandwidth_bytes,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub read_only: Option<bool>,
}

/// `PATCH /api/admin/settings`
pub async fn update_settings(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<serde_json::Value>> {
    if let Some(read_only) = request.read_only {
        kernel.set_read_only(read_only);
        kernel.iam().record_event(
            Some(principal.id),
            "admin.settings.read_only",
            if read_only { "on" } else { "off" },
        );
    }
    Ok(Json(json!({ "read_only": kernel.is_read_only() })))
}

/// `GET /api/admin/stats`
pub async fn stats(State(kernel): State<AuthKernel>) -> Result<Json<serde_json::Value>> {
    let users = kernel.users().count().await?;
    let metrics = kernel.metrics();
    Ok(Json(json!({
        "users": users,
        "requests": metrics.total_requests(),
        "routes": metrics.snapshot(),
    })))
}
