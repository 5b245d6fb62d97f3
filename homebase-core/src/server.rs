//! Router assembly and the middleware pipeline
//!
//! Stage order, outermost first: security headers, read-only gate, CORS,
//! metrics, rate limit, then per-scope authentication and authorization.
//! Every request carries a deadline via the timeout layer and a request id
//! for log correlation.

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use std::time::Duration;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers::{admin, auth, misc, oauth, storage};
use crate::middleware::{
    apply_security_headers, authenticate, check_policy, cors_layer, metrics::track_metrics,
    rate_limit, read_only_gate, require_admin,
};
use crate::state::AuthKernel;

/// Build the full HTTP surface over one kernel
pub fn build_router(kernel: AuthKernel) -> Router {
    let public = Router::new()
        .route("/healthz", get(misc::health))
        .route("/auth/login", post(auth::login))
        .route("/auth/signup", post(auth::signup))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/oauth/{provider}", get(oauth::authorize))
        .route("/auth/oauth/callback/{provider}", get(oauth::callback))
        .route(
            "/storage/direct/{token}",
            get(storage::direct_download).post(storage::direct_upload),
        );

    // Self-service operations need a principal but no route policy.
    let authed = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me).patch(auth::update_me))
        .route("/auth/change-password", post(auth::change_password))
        .route(
            "/auth/api-keys",
            get(auth::list_api_keys).post(auth::create_api_key),
        )
        .route("/auth/api-keys/{id}", delete(auth::revoke_api_key))
        .route("/auth/oauth-links", get(auth::list_oauth_links))
        .route(
            "/auth/oauth-links/{provider}",
            delete(auth::unlink_oauth_provider),
        )
        .layer(from_fn_with_state(kernel.clone(), authenticate));

    // Generic API routes go through the IAM policy check.
    let api = Router::new()
        .nest("/api/storage", storage_routes())
        .route("/api/settings", get(misc::settings))
        .route("/api/dashboard/stats", get(misc::dashboard_stats))
        .layer(from_fn_with_state(kernel.clone(), check_policy))
        .layer(from_fn_with_state(kernel.clone(), authenticate));

    let admin_api = Router::new()
        .nest("/api/admin", admin_routes())
        .layer(from_fn(require_admin))
        .layer(from_fn_with_state(kernel.clone(), authenticate));

    let app = Router::new()
        .merge(public)
        .merge(authed)
        .merge(api)
        .merge(admin_api)
        .layer(DefaultBodyLimit::max(kernel.config().storage.max_upload_bytes))
        .with_state(kernel.clone());

    // Outer pipeline; the last layer added runs first.
    let app = app
        .layer(TimeoutLayer::new(Duration::from_secs(
            kernel.config().server.request_timeout_secs,
        )))
        .layer(from_fn_with_state(kernel.clone(), rate_limit))
        .layer(from_fn_with_state(kernel.clone(), track_metrics))
        .layer(cors_layer(&kernel.config().cors))
        .layer(from_fn_with_state(kernel.clone(), read_only_gate))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    apply_security_headers(app, kernel.config().server.is_production())
}

fn storage_routes() -> Router<AuthKernel> {
    Router::new()
        .route("/buckets", get(storage::list_buckets))
        .route("/buckets/{bucket}", get(storage::list_objects))
        .route("/buckets/{bucket}/upload", post(storage::upload))
        .route("/buckets/{bucket}/upload-url", post(storage::upload_url))
        .route(
            "/buckets/{bucket}/objects/{id}",
            get(storage::object_metadata).delete(storage::delete_object),
        )
        .route(
            "/buckets/{bucket}/objects/{id}/download",
            get(storage::download),
        )
        .route(
            "/buckets/{bucket}/objects/{id}/download-url",
            get(storage::download_url),
        )
        .route(
            "/buckets/{bucket}/objects/{id}/rename",
            post(storage::rename_object),
        )
        .route(
            "/buckets/{bucket}/objects/{id}/metadata",
            get(storage::object_metadata),
        )
        .route("/quota", get(storage::quota))
        .route("/stats", get(storage::stats))
}

fn admin_routes() -> Router<AuthKernel> {
    Router::new()
        .route("/users", get(admin::list_users))
        .route(
            "/users/{id}",
            get(admin::get_user)
                .patch(admin::update_user)
                .delete(admin::deactivate_user),
        )
        .route("/users/{id}/roles", post(admin::assign_role))
        .route("/users/{id}/roles/{role}", delete(admin::remove_role))
        .route("/roles", get(admin::list_roles).post(admin::create_role))
        .route(
            "/roles/{id}",
            axum::routing::patch(admin::update_role).delete(admin::delete_role),
        )
        .route(
            "/policies",
            get(admin::list_policies)
                .post(admin::add_policy)
                .delete(admin::remove_policy),
        )
        .route("/logs", get(admin::list_audit_logs))
        .route("/quotas", get(admin::list_quotas))
        .route("/quotas/users/{id}", put(admin::set_user_quota))
        .route("/quotas/roles/{role}", put(admin::set_role_quota))
        .route(
            "/settings",
            get(admin::get_settings).patch(admin::update_settings),
        )
        .route("/stats", get(admin::stats))
}
