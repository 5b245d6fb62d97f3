//! OAuth authorization-code endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{AppendHeaders, IntoResponse},
};
use serde::Deserialize;

use crate::auth::oauth::{
    clear_state_cookie, generate_state, state_cookie, verify_state, STATE_COOKIE,
};
use crate::error::Result;
use crate::middleware::authn::cookie_value;
use crate::middleware::AUTH_COOKIE;
use crate::state::AuthKernel;

/// `GET /auth/oauth/{provider}`
///
/// Stores the CSRF state in a short-lived cookie and redirects to the
/// provider's authorization URL.
pub async fn authorize(
    State(kernel): State<AuthKernel>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse> {
    let provider = kernel.oauth().provider(&provider)?;
    let state = generate_state();
    let url = provider.authorization_url(&state);

    Ok((
        StatusCode::FOUND,
        AppendHeaders([
            (header::SET_COOKIE, state_cookie(&state)),
            (header::LOCATION, url),
        ]),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
}

/// `GET /auth/oauth/callback/{provider}`
///
/// Verifies the state cookie, exchanges the code, resolves the platform
/// user, and hands out the platform's own access token as a cookie before
/// redirecting to the configured post-login page. Provider failures are
/// never detailed to the client.
pub async fn callback(
    State(kernel): State<AuthKernel>,
    Path(provider_name): Path<String>,
    Query(query): Query<CallbackQuery>,
    headers: axum::http::HeaderMap,
) -> Result<impl IntoResponse> {
    verify_state(cookie_value(&headers, STATE_COOKIE), &query.state)?;

    let provider = kernel.oauth().provider(&provider_name)?;
    let tokens = provider.exchange_code(&query.code).await?;
    let info = provider.get_user_info(&tokens.access_token).await?;

    let user = kernel.oauth().resolve_user(&info, &tokens).await?;
    let pair = kernel.auth().issue_for_user(&user).await?;

    let auth_cookie = format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        AUTH_COOKIE, pair.access_token, pair.expires_in
    );

    Ok((
        StatusCode::FOUND,
        AppendHeaders([
            (header::SET_COOKIE, clear_state_cookie()),
            (header::SET_COOKIE, auth_cookie),
            (
                header::LOCATION,
                kernel.config().server.post_login_redirect.clone(),
            ),
        ]),
    ))
}
