//! Black-box tests over the full HTTP surface
//!
//! Drives the assembled router with in-memory stores: login and protected
//! reads, cross-user isolation, admin tiers, expired tokens, single-use
//! capability tokens, quota admission, and read-only mode.

use axum::body::{Body, Bytes};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use homebase_core::{build_router, AuthKernel, Config};

const KIB: usize = 1024;

async fn test_kernel() -> AuthKernel {
    let mut config = Config::default();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    config.auth.bcrypt_cost = 10;
    config.validate().unwrap();
    AuthKernel::in_memory(config).await.unwrap()
}

async fn test_app() -> (Router, AuthKernel) {
    let kernel = test_kernel().await;
    (build_router(kernel.clone()), kernel)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn bare_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn signup(app: &Router, email: &str, password: &str) -> Uuid {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/auth/signup",
            None,
            json!({ "email": email, "password": password, "display_name": email }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "signup failed: {}", body);
    body["id"].as_str().unwrap().parse().unwrap()
}

async fn login(app: &Router, email: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": email, "password": password }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["token"].as_str().unwrap().to_string()
}

async fn upload(
    app: &Router,
    token: &str,
    bucket: &str,
    filename: &str,
    data: Vec<u8>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/api/storage/buckets/{}/upload?filename={}",
            bucket, filename
        ))
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(Bytes::from(data)))
        .unwrap();
    send(app, request).await
}

/// Wait for detached accounting hooks to land
async fn wait_for_storage_used(kernel: &AuthKernel, user_id: Uuid, expected: i64) {
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let usage = kernel.quota().usage(user_id).await.unwrap();
            if usage.storage_used == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("storage_used never reached {}", expected));
}

#[tokio::test]
async fn test_login_then_protected_read() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    let (status, body) = send(&app, bare_request("GET", "/api/storage/quota", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["used"].is_number());
    assert!(body["total"].is_number());
    assert!(body["percentage"].is_number());
}

#[tokio::test]
async fn test_protected_read_without_credential() {
    let (app, _) = test_app().await;
    let (status, body) = send(&app, bare_request("GET", "/api/storage/quota", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "No authorization provided");
}

#[tokio::test]
async fn test_cross_user_access_is_forbidden() {
    let (app, _) = test_app().await;
    signup(&app, "a@x.test", "password123").await;
    signup(&app, "b@x.test", "password123").await;
    let token_a = login(&app, "a@x.test", "password123").await;
    let token_b = login(&app, "b@x.test", "password123").await;

    let (status, body) = upload(&app, &token_a, "int_storage", "a.bin", vec![1; 64]).await;
    assert_eq!(status, StatusCode::CREATED);
    let object_id = body["id"].as_str().unwrap();

    let uri = format!(
        "/api/storage/buckets/int_storage/objects/{}/download",
        object_id
    );
    let (status, body) = send(&app, bare_request("GET", &uri, Some(&token_b))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Access denied");

    // The owner still reads it fine.
    let (status, _) = send(&app, bare_request("GET", &uri, Some(&token_a))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_tiers() {
    let (app, kernel) = test_app().await;
    let target = signup(&app, "user@x.test", "password123").await;
    signup(&app, "admin@x.test", "password123").await;
    signup(&app, "viewer@x.test", "password123").await;

    let admin_id = kernel
        .users()
        .find_by_email("admin@x.test")
        .await
        .unwrap()
        .unwrap()
        .id;
    let viewer_id = kernel
        .users()
        .find_by_email("viewer@x.test")
        .await
        .unwrap()
        .unwrap()
        .id;
    kernel.iam().assign_role(admin_id, "admin", None).await.unwrap();
    kernel
        .iam()
        .assign_role(viewer_id, "admin_viewer", None)
        .await
        .unwrap();

    let admin_token = login(&app, "admin@x.test", "password123").await;
    let viewer_token = login(&app, "viewer@x.test", "password123").await;
    let user_token = login(&app, "user@x.test", "password123").await;

    // admin_viewer reads but cannot write.
    let (status, _) = send(&app, bare_request("GET", "/api/admin/users", Some(&viewer_token))).await;
    assert_eq!(status, StatusCode::OK);

    let patch_uri = format!("/api/admin/users/{}", target);
    let (status, body) = send(
        &app,
        json_request("PATCH", &patch_uri, Some(&viewer_token), json!({ "display_name": "X" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Write access requires full admin role");

    // Full admin writes succeed.
    let (status, body) = send(
        &app,
        json_request("PATCH", &patch_uri, Some(&admin_token), json!({ "display_name": "X" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["display_name"], "X");

    // Ordinary users are shut out entirely.
    let (status, body) = send(&app, bare_request("GET", "/api/admin/users", Some(&user_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Admin access required");
}

#[tokio::test]
async fn test_expired_token_is_refused() {
    let (app, kernel) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let user = kernel
        .users()
        .find_by_email("u@x.test")
        .await
        .unwrap()
        .unwrap();

    let (expired, _) = kernel
        .codec()
        .issue_with_lifetime(user.id, &user.email, vec!["user".to_string()], -1)
        .unwrap();

    let (status, body) = send(&app, bare_request("GET", "/auth/me", Some(&expired))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid token");
}

#[tokio::test]
async fn test_capability_upload_token_is_single_use() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/api/storage/buckets/int_storage/upload-url",
            Some(&token),
            json!({ "filename": "cap.bin", "max_size": 1024 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["type"], "token");
    let capability = body["token"].as_str().unwrap().to_string();

    let direct_uri = format!("/storage/direct/{}", capability);
    let first = Request::builder()
        .method("POST")
        .uri(&direct_uri)
        .body(Body::from("hello capability"))
        .unwrap();
    let (status, _) = send(&app, first).await;
    assert_eq!(status, StatusCode::CREATED);

    let second = Request::builder()
        .method("POST")
        .uri(&direct_uri)
        .body(Body::from("again"))
        .unwrap();
    let (status, body) = send(&app, second).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Token has already been used");
}

#[tokio::test]
async fn test_capability_download_flow() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    let (status, body) = upload(&app, &token, "int_storage", "shared.txt", b"shareable".to_vec()).await;
    assert_eq!(status, StatusCode::CREATED);
    let object_id = body["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        bare_request(
            "GET",
            &format!(
                "/api/storage/buckets/int_storage/objects/{}/download-url",
                object_id
            ),
            Some(&token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let capability = body["token"].as_str().unwrap().to_string();

    // No bearer credential on the direct path.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/storage/direct/{}", capability))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"shareable");

    // Second consumption conflicts.
    let (status, _) = send(
        &app,
        bare_request("GET", &format!("/storage/direct/{}", capability), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_quota_admission_and_release() {
    let (app, kernel) = test_app().await;
    let user_id = signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    kernel
        .quota()
        .set_user_override(user_id, Some((1024 * KIB) as i64), None)
        .await
        .unwrap();

    let (status, first) = upload(&app, &token, "int_storage", "big.bin", vec![0; 900 * KIB]).await;
    assert_eq!(status, StatusCode::CREATED);
    wait_for_storage_used(&kernel, user_id, (900 * KIB) as i64).await;

    // 200 KiB does not fit into the remaining 124 KiB.
    let (status, body) = upload(&app, &token, "int_storage", "more.bin", vec![0; 200 * KIB]).await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE, "{}", body);

    // Delete the big object, then the same upload fits.
    let (status, _) = send(
        &app,
        bare_request(
            "DELETE",
            &format!(
                "/api/storage/buckets/int_storage/objects/{}",
                first["id"].as_str().unwrap()
            ),
            Some(&token),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    wait_for_storage_used(&kernel, user_id, 0).await;

    let (status, _) = upload(&app, &token, "int_storage", "more.bin", vec![0; 200 * KIB]).await;
    assert_eq!(status, StatusCode::CREATED);
    wait_for_storage_used(&kernel, user_id, (200 * KIB) as i64).await;
}

#[tokio::test]
async fn test_read_only_mode_gates_writes() {
    let (app, kernel) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    kernel.set_read_only(true);

    // Writes are rejected...
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/signup",
            None,
            json!({ "email": "new@x.test", "password": "password123" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // ...but safe methods and the allow-listed auth paths still work.
    let (status, _) = send(&app, bare_request("GET", "/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    let token = login(&app, "u@x.test", "password123").await;
    assert!(!token.is_empty());

    kernel.set_read_only(false);
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/signup",
            None,
            json!({ "email": "new@x.test", "password": "password123" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let mut config = Config::default();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    config.auth.bcrypt_cost = 10;
    config.rate_limit.requests_per_window = 2;
    let kernel = AuthKernel::in_memory(config).await.unwrap();
    let app = build_router(kernel);

    for _ in 0..2 {
        let (status, _) = send(&app, bare_request("GET", "/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(bare_request("GET", "/healthz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
}

#[tokio::test]
async fn test_cookie_credential_is_accepted() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    let request = Request::builder()
        .method("GET")
        .uri("/auth/me")
        .header(header::COOKIE, format!("auth_token={}", token))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "u@x.test");
}

#[tokio::test]
async fn test_api_key_round_trip_and_one_shot_visibility() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;
    let token = login(&app, "u@x.test", "password123").await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/auth/api-keys",
            Some(&token),
            json!({ "display_name": "ci" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let plaintext = body["key"].as_str().unwrap().to_string();
    let key_id = body["id"].as_str().unwrap().to_string();

    // The key authenticates as the owner.
    let (status, body) = send(&app, bare_request("GET", "/auth/me", Some(&plaintext))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "u@x.test");

    // Listing never shows the plaintext again.
    let (status, body) = send(&app, bare_request("GET", "/auth/api-keys", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get("key").is_none());
    assert!(listed[0].get("key_hash").is_none());

    // Revocation invalidates the key; revoking twice is a no-op success.
    for _ in 0..2 {
        let (status, _) = send(
            &app,
            bare_request("DELETE", &format!("/auth/api-keys/{}", key_id), Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (status, _) = send(&app, bare_request("GET", "/auth/me", Some(&plaintext))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_flow_over_http() {
    let (app, _) = test_app().await;
    signup(&app, "u@x.test", "password123").await;

    let (_, body) = send(
        &app,
        json_request(
            "POST",
            "/auth/login",
            None,
            json!({ "email": "u@x.test", "password": "password123" }),
        ),
    )
    .await;
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some());

    // The rotated-out token no longer works.
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/auth/refresh",
            None,
            json!({ "refresh_token": refresh_token }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
