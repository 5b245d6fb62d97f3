//! Small authenticated surfaces: public settings, dashboard stats, health

use axum::{extract::State, Extension, Json};
use serde_json::json;

use crate::auth::Principal;
use crate::error::Result;
use crate::state::AuthKernel;

/// `GET /healthz` (public)
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/settings` — the subset of settings any user may read
pub async fn settings(State(kernel): State<AuthKernel>) -> Result<Json<serde_json::Value>> {
    Ok(Json(json!({
        "read_only": kernel.is_read_only(),
        "oauth_providers": kernel.oauth().enabled_providers(),
    })))
}

/// `GET /api/dashboard/stats` — per-user dashboard numbers
pub async fn dashboard_stats(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    let (objects, total_bytes) = kernel.objects().stats_for_user(principal.id).await?;
    let quota = kernel.quota().summary(principal.id).await?;
    Ok(Json(json!({
        "objects": objects,
        "total_bytes": total_bytes,
        "quota": quota,
    })))
}
