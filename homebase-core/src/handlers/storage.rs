//! Storage endpoints: buckets, objects, capability URLs, quota
//!
//! Everything under `/api/storage` runs behind authentication and the IAM
//! policy check; the `/storage/direct/{token}` pair is public and mediated
//! solely by capability tokens.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::state::AuthKernel;
use crate::storage::StorageObject;

/// `GET /api/storage/buckets`
pub async fn list_buckets(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(kernel.mediator().list_buckets(&principal).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Restrict to direct children of this folder (absent = whole bucket)
    #[serde(default)]
    pub parent_folder_id: Option<Uuid>,
}

/// `GET /api/storage/buckets/{bucket}`
pub async fn list_objects(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<StorageObject>>> {
    let objects = match query.parent_folder_id {
        Some(parent) => {
            kernel
                .objects()
                .list_children(&bucket, principal.id, Some(parent))
                .await?
        }
        None => kernel.mediator().list_bucket(&principal, &bucket).await?,
    };
    Ok(Json(objects))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
    #[serde(default)]
    pub parent_folder_id: Option<Uuid>,
}

fn request_content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// `POST /api/storage/buckets/{bucket}/upload`
pub async fn upload(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let content_type = request_content_type(&headers);
    let object = kernel
        .mediator()
        .upload(
            &principal,
            &bucket,
            &query.filename,
            &content_type,
            query.parent_folder_id,
            &body,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(object)))
}

/// `GET /api/storage/buckets/{bucket}/objects/{id}` and `/metadata`
pub async fn object_metadata(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path((_bucket, id)): Path<(String, Uuid)>,
) -> Result<Json<StorageObject>> {
    Ok(Json(kernel.mediator().metadata(&principal, id).await?))
}

fn object_response_headers(object: &StorageObject) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, object.content_type.clone()),
        (header::CONTENT_LENGTH, object.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", object.object_key),
        ),
    ]
}

/// `GET /api/storage/buckets/{bucket}/objects/{id}/download`
pub async fn download(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path((_bucket, id)): Path<(String, Uuid)>,
) -> Result<Response> {
    let (object, body) = kernel.mediator().download(&principal, id).await?;
    Ok((object_response_headers(&object), body).into_response())
}

/// `DELETE /api/storage/buckets/{bucket}/objects/{id}`
pub async fn delete_object(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path((_bucket, id)): Path<(String, Uuid)>,
) -> Result<StatusCode> {
    let object = kernel.mediator().delete(&principal, id).await?;
    kernel
        .quota()
        .release_storage(object.user_id, object.size)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub new_name: String,
}

/// `POST /api/storage/buckets/{bucket}/objects/{id}/rename`
pub async fn rename_object(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path((_bucket, id)): Path<(String, Uuid)>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<StorageObject>> {
    if request.new_name.trim().is_empty() {
        return Err(Error::ValidationError("Name must not be empty".to_string()));
    }
    Ok(Json(
        kernel
            .mediator()
            .rename(&principal, id, request.new_name.trim())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    pub filename: String,
    #[serde(default)]
    pub max_size: Option<i64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub parent_folder_id: Option<Uuid>,
}

/// `POST /api/storage/buckets/{bucket}/upload-url`
pub async fn upload_url(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path(bucket): Path<String>,
    Json(request): Json<UploadUrlRequest>,
) -> Result<impl IntoResponse> {
    let token = kernel
        .capability_tokens()
        .mint_upload(
            Some(principal.id),
            &bucket,
            &request.filename,
            request.max_size,
            request.content_type,
            request.parent_folder_id,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "url": format!(
                "{}/storage/direct/{}",
                kernel.config().server.base_url.trim_end_matches('/'),
                token.token
            ),
            "token": token.token,
            "type": "token",
            "expires_at": token.expires_at,
        })),
    ))
}

/// `GET /api/storage/buckets/{bucket}/objects/{id}/download-url`
pub async fn download_url(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
    Path((_bucket, id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>> {
    let object = kernel.mediator().load_owned(&principal, id).await?;
    let token = kernel
        .capability_tokens()
        .mint_download(Some(principal.id), &object)
        .await?;

    Ok(Json(json!({
        "url": format!(
            "{}/storage/direct/{}",
            kernel.config().server.base_url.trim_end_matches('/'),
            token.token
        ),
        "token": token.token,
        "type": "token",
        "expires_at": token.expires_at,
    })))
}

/// `GET /api/storage/quota`
pub async fn quota(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<crate::storage::quota::QuotaSummary>> {
    Ok(Json(kernel.quota().summary(principal.id).await?))
}

/// `GET /api/storage/stats`
pub async fn stats(
    State(kernel): State<AuthKernel>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>> {
    let (count, bytes) = kernel.objects().stats_for_user(principal.id).await?;
    Ok(Json(json!({
        "objects": count,
        "total_bytes": bytes,
    })))
}

/// `GET /storage/direct/{token}` (public)
///
/// Consumes a download capability token and streams the object. The token
/// is retired with the served byte count once the stream finishes or the
/// client disconnects.
pub async fn direct_download(
    State(kernel): State<AuthKernel>,
    Path(token): Path<String>,
) -> Result<Response> {
    let record = kernel.capability_tokens().consume_download(&token).await?;

    let tokens = std::sync::Arc::clone(kernel.capability_tokens());
    let token_id = record.id;
    let on_complete = Box::new(move |bytes: u64| {
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = tokens.complete_download(token_id, bytes as i64).await {
                    tracing::warn!("download token completion failed: {}", e);
                }
            });
        }
    });

    let (object, body) = kernel
        .mediator()
        .download_for_token(record.object_id, record.user_id, on_complete)
        .await?;
    Ok((object_response_headers(&object), body).into_response())
}

/// `POST /storage/direct/{token}` (public)
///
/// Consumes an upload capability token: writes the body as the object the
/// token was minted for, attributed to the minting user.
pub async fn direct_upload(
    State(kernel): State<AuthKernel>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let record = kernel
        .capability_tokens()
        .consume_upload(&token, body.len() as i64)
        .await?;
    let owner = record
        .user_id
        .ok_or_else(|| Error::BadRequest("Token carries no owner".to_string()))?;

    let content_type = record
        .content_type
        .clone()
        .unwrap_or_else(|| request_content_type(&headers));

    let object = kernel
        .mediator()
        .upload_for_user(
            owner,
            &record.bucket,
            &record.object_key,
            &content_type,
            record.parent_folder_id,
            &body,
        )
        .await?;

    kernel
        .capability_tokens()
        .complete_upload(record.id, object.size)
        .await?;

    Ok((StatusCode::CREATED, Json(object)))
}
