//! Facebook OAuth provider

use async_trait::async_trait;
use oauth2::{AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenResponse, TokenUrl};
use reqwest::Client as HttpClient;

use super::ConfiguredClient;
use crate::auth::oauth::provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
use crate::config::OAuthProviderConfig;
use crate::error::Error;

/// Facebook OAuth provider
#[derive(Clone)]
pub struct FacebookProvider {
    client: ConfiguredClient,
    http_client: HttpClient,
    scopes: Vec<String>,
}

impl FacebookProvider {
    pub fn new(config: &OAuthProviderConfig, redirect_uri: &str) -> Result<Self, Error> {
        let client = oauth2::Client::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new("https://www.facebook.com/v18.0/dialog/oauth".to_string())
                    .map_err(|e| Error::Internal(format!("Invalid Facebook auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new("https://graph.facebook.com/v18.0/oauth/access_token".to_string())
                    .map_err(|e| Error::Internal(format!("Invalid Facebook token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|e| Error::Internal(format!("Invalid redirect URI: {}", e)))?,
            );

        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let scopes = if config.scopes.is_empty() {
            vec!["email".to_string(), "public_profile".to_string()]
        } else {
            config.scopes.clone()
        };

        Ok(Self {
            client,
            http_client,
            scopes,
        })
    }
}

#[async_trait]
impl OAuthProvider for FacebookProvider {
    fn name(&self) -> &str {
        "facebook"
    }

    fn authorization_url(&self, state: &str) -> String {
        let mut request = self
            .client
            .authorize_url(|| CsrfToken::new(state.to_string()));
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, _) = request.url();
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthTokens, Error> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|e| Error::External(format!("Facebook token exchange failed: {}", e)))?;

        Ok(OAuthTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_in: token_result.expires_in().map(|d| d.as_secs() as i64),
        })
    }

    async fn get_user_info(&self, access_token: &str) -> Result<OAuthUserInfo, Error> {
        let response = self
            .http_client
            .get("https://graph.facebook.com/me")
            .query(&[("fields", "id,name,email")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::External(format!("Failed to fetch Facebook user info: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::External(format!(
                "Facebook user info request failed: {}",
                response.status()
            )));
        }

        let info: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::External(format!("Failed to parse Facebook user info: {}", e)))?;

        Ok(OAuthUserInfo {
            provider: "facebook".to_string(),
            provider_user_id: info["id"]
                .as_str()
                .ok_or_else(|| Error::External("Missing id in Facebook response".to_string()))?
                .to_string(),
            email: info["email"].as_str().map(|s| s.to_string()),
            // Graph only returns addresses Facebook has verified.
            email_verified: info["email"].as_str().is_some(),
            name: info["name"].as_str().map(|s| s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url() {
        let config = OAuthProviderConfig {
            client_id: "fb-client".to_string(),
            client_secret: "fb-secret".to_string(),
            scopes: vec![],
        };
        let provider =
            FacebookProvider::new(&config, "https://example.com/auth/oauth/callback/facebook")
                .unwrap();
        let url = provider.authorization_url("fb-state");

        assert!(url.contains("facebook.com"));
        assert!(url.contains("state=fb-state"));
        assert!(url.contains("client_id=fb-client"));
    }
}
