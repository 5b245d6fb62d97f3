//! CORS layer built from configuration
//!
//! The caller's `Origin` is echoed only when it matches the configured
//! allow-list; config validation already forbids a wildcard because
//! credentials (cookies) are always in play.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::CorsConfig;

pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    let methods: Vec<Method> = if config.allowed_methods.is_empty() {
        vec![
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ]
    } else {
        config
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect()
    };

    let headers: Vec<HeaderName> = if config.allowed_headers.is_empty() {
        vec![
            http::header::CONTENT_TYPE,
            http::header::AUTHORIZATION,
            HeaderName::from_static("x-app-id"),
        ]
    } else {
        config
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect()
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}
