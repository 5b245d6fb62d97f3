//! Authentication middleware
//!
//! Resolves the presented credential to a [`Principal`] and attaches it to
//! the request. Credentials arrive as the `auth_token` cookie (browsers) or
//! the `Authorization: Bearer` header (API callers); the cookie is tried
//! first. A bearer value shaped like an API key goes through the key
//! verifier, anything else through the signed-token verifier.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::api_keys::{hash_key, looks_like_api_key};
use crate::auth::{AuthMethod, Principal};
use crate::error::Error;
use crate::state::AuthKernel;

/// Cookie carrying the access token for browser sessions
pub const AUTH_COOKIE: &str = "auth_token";

/// Read one cookie value out of the `Cookie` header
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookies = headers.get(http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Extract the bearer credential: cookie first, then the header
pub fn extract_credential(headers: &HeaderMap) -> Result<String, Error> {
    if let Some(token) = cookie_value(headers, AUTH_COOKIE) {
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }

    let auth_header = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(Error::no_authorization)?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(Error::no_authorization)
}

/// Client IP as reported by the proxy
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// User agent header, empty when absent
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn app_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-app-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn authenticate(
    State(kernel): State<AuthKernel>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let headers = request.headers().clone();
    let credential = extract_credential(&headers)?;

    let principal = if looks_like_api_key(&credential) {
        verify_api_key(&kernel, &credential, &headers).await?
    } else {
        verify_bearer(&kernel, &credential, &headers).await?
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

async fn verify_api_key(
    kernel: &AuthKernel,
    credential: &str,
    headers: &HeaderMap,
) -> Result<Principal, Error> {
    let key = kernel
        .api_keys()
        .find_by_hash(&hash_key(credential))
        .await?
        .ok_or_else(Error::invalid_token)?;
    if !key.is_valid() {
        return Err(Error::invalid_token());
    }

    let user = kernel
        .users()
        .find_by_id(key.user_id)
        .await?
        .filter(|u| u.active)
        .ok_or_else(Error::invalid_token)?;

    // Roles come from the store only; an outage leaves the key holder
    // roleless (fail-closed) rather than unauthenticated.
    let roles = match kernel.iam().effective_roles(user.id, &[]).await {
        Ok(roles) => roles,
        Err(e) => {
            tracing::warn!("role lookup failed for API key auth: {}", e);
            Vec::new()
        }
    };

    // Usage bookkeeping happens off the request path.
    let repo = Arc::clone(kernel.api_keys());
    let key_id = key.id;
    let ip = client_ip(headers);
    tokio::spawn(async move {
        if let Err(e) = repo.touch_usage(key_id, &ip).await {
            tracing::debug!("api key usage update failed: {}", e);
        }
    });

    Ok(Principal {
        id: user.id,
        email: user.email,
        roles,
        app_id: app_id(headers),
        method: AuthMethod::ApiKey,
    })
}

async fn verify_bearer(
    kernel: &AuthKernel,
    credential: &str,
    headers: &HeaderMap,
) -> Result<Principal, Error> {
    let claims = kernel.codec().verify(credential)?;

    // The policy store is authoritative for roles, but the claims were
    // signed by this process at login time; fall back to them so a
    // transient read failure doesn't lock the whole API.
    let roles = match kernel
        .iam()
        .effective_roles(claims.user_id, &claims.roles)
        .await
    {
        Ok(roles) => roles,
        Err(e) => {
            tracing::warn!("role lookup failed, using token claims: {}", e);
            claims.roles.clone()
        }
    };

    Ok(Principal {
        id: claims.user_id,
        email: claims.email,
        roles,
        app_id: app_id(headers),
        method: AuthMethod::Password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_cookie_takes_precedence_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("theme=dark; auth_token=from-cookie"),
        );
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );

        assert_eq!(extract_credential(&headers).unwrap(), "from-cookie");
    }

    #[test]
    fn test_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(extract_credential(&headers).unwrap(), "from-header");
    }

    #[test]
    fn test_missing_credential() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_credential(&headers),
            Err(Error::Unauthorized(msg)) if msg == "No authorization provided"
        ));
    }

    #[test]
    fn test_malformed_authorization_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwdw=="),
        );
        assert!(extract_credential(&headers).is_err());
    }

    #[test]
    fn test_client_ip_first_forwarded_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
