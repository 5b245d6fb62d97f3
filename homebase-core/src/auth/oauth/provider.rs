//! OAuth provider trait and normalized types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Tokens received from a provider after the code exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds, when the provider reports one
    pub expires_in: Option<i64>,
}

/// Normalized user info across providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthUserInfo {
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
}

/// One configured OAuth provider
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider name as it appears in routes ("google", "microsoft", ...)
    fn name(&self) -> &str;

    /// Authorization URL carrying the CSRF `state`
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for provider tokens
    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens, Error>;

    /// Fetch user info with a provider access token
    async fn get_user_info(&self, access_token: &str) -> Result<OAuthUserInfo, Error>;
}
