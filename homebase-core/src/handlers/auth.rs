//! Authentication endpoints: login, signup, sessions, profile, API keys

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{AppendHeaders, IntoResponse},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::api_keys::ApiKey;
use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::middleware::AUTH_COOKIE;
use crate::repository::{User, UserProfileUpdate};
use crate::state::AuthKernel;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user: User,
}

fn auth_cookie(token: &str, max_age: i64) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        AUTH_COOKIE, token, max_age
    )
}

fn clear_auth_cookie() -> String {
    format!("{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax", AUTH_COOKIE)
}

/// `POST /auth/login`
pub async fn login(
    State(kernel): State<AuthKernel>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let (pair, user) = kernel.auth().login(&request.email, &request.password).await?;

    let cookie = auth_cookie(&pair.access_token, pair.expires_in);
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(LoginResponse {
            token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_in: pair.expires_in,
            user,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: String,
}

/// `POST /auth/signup`
pub async fn signup(
    State(kernel): State<AuthKernel>,
    Json(request): Json<SignupRequest>,
) -> Result<impl IntoResponse> {
    let user = kernel
        .auth()
        .signup(&request.email, &request.password, &request.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(kernel): State<AuthKernel>,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse> {
    let pair = kernel.auth().refresh(&request.refresh_token).await?;
    let cookie = auth_cookie(&pair.access_token, pair.expires_in);
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(json!({
            "token": pair.access_token,
            "refresh_token": pair.refresh_token,
            "expires_in": pair.expires_in,
        })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `POST /auth/logout`
///
/// The body is optional: with a refresh token only that session is retired,
/// without one every session of the caller is.
pub async fn logout(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let refresh_token = serde_json::from_slice::<LogoutRequest>(&body)
        .ok()
        .and_then(|b| b.refresh_token);
    kernel
        .auth()
        .logout(principal.id, refresh_token.as_deref())
        .await?;
    Ok((
        AppendHeaders([(header::SET_COOKIE, clear_auth_cookie())]),
        StatusCode::NO_CONTENT,
    ))
}

/// `GET /auth/me`
pub async fn me(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<User>> {
    let user = kernel
        .users()
        .find_by_id(principal.id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    Ok(Json(user))
}

/// `PATCH /auth/me`
pub async fn update_me(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Json(update): Json<UserProfileUpdate>,
) -> Result<Json<User>> {
    kernel.users().update_profile(principal.id, &update).await?;
    let user = kernel
        .users()
        .find_by_id(principal.id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// `POST /auth/change-password`
pub async fn change_password(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<StatusCode> {
    let user = kernel
        .users()
        .find_by_id(principal.id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    kernel
        .auth()
        .change_password(&user, &request.current_password, &request.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// API key metadata as listed; never includes hash or plaintext
#[derive(Debug, Serialize)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub display_name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl From<ApiKey> for ApiKeySummary {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            display_name: key.display_name,
            key_prefix: key.key_prefix,
            created_at: key.created_at,
            expires_at: key.expires_at,
            last_used_at: key.last_used_at,
            revoked: key.revoked_at.is_some(),
        }
    }
}

/// `GET /auth/api-keys`
pub async fn list_api_keys(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<ApiKeySummary>>> {
    let keys = kernel.api_keys().list_by_user(principal.id).await?;
    Ok(Json(keys.into_iter().map(ApiKeySummary::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub display_name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// `POST /auth/api-keys`
///
/// The plaintext key appears in this response and nowhere else.
pub async fn create_api_key(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse> {
    let (plaintext, display_prefix, hash) = kernel.api_key_generator().generate();
    let key = ApiKey {
        id: Uuid::new_v4(),
        user_id: principal.id,
        display_name: request.display_name,
        key_prefix: display_prefix,
        key_hash: hash,
        created_at: Utc::now(),
        expires_at: request.expires_at,
        last_used_at: None,
        last_used_ip: None,
        revoked_at: None,
    };
    kernel.api_keys().create(&key).await?;
    kernel
        .iam()
        .record_event(Some(principal.id), "auth.apikey.created", &key.display_name);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "key": plaintext,
            "display_name": key.display_name,
            "key_prefix": key.key_prefix,
            "expires_at": key.expires_at,
        })),
    ))
}

/// `GET /auth/oauth-links`
///
/// Providers linked to the calling account; provider tokens never leave the
/// auth subsystem.
pub async fn list_oauth_links(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<serde_json::Value>>> {
    let links = kernel.oauth_links().list_for_user(principal.id).await?;
    Ok(Json(
        links
            .into_iter()
            .map(|link| {
                json!({
                    "provider": link.provider,
                    "created_at": link.created_at,
                    "updated_at": link.updated_at,
                })
            })
            .collect(),
    ))
}

/// `DELETE /auth/oauth-links/{provider}`
pub async fn unlink_oauth_provider(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
) -> Result<StatusCode> {
    let user = kernel
        .users()
        .find_by_id(principal.id)
        .await?
        .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
    let links = kernel.oauth_links().list_for_user(principal.id).await?;

    // Removing the last login method would lock the account out.
    if user.password_hash.is_none()
        && links.len() == 1
        && links[0].provider == provider
    {
        return Err(Error::Conflict(
            "Cannot unlink the only sign-in method".to_string(),
        ));
    }

    kernel.oauth().unlink(principal.id, &provider).await?;
    kernel
        .iam()
        .record_event(Some(principal.id), "auth.oauth.unlinked", &provider);
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /auth/api-keys/{id}`
///
/// Revokes the key; revoking a revoked key is a no-op success.
pub async fn revoke_api_key(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let key = kernel
        .api_keys()
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound("API key not found".to_string()))?;
    if key.user_id != principal.id && !principal.is_admin() {
        return Err(Error::access_denied());
    }

    kernel.api_keys().revoke(id).await?;
    kernel
        .iam()
        .record_event(Some(principal.id), "auth.apikey.revoked", &key.display_name);
    Ok(StatusCode::NO_CONTENT)
}
