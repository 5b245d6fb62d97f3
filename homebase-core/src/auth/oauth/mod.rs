//! OAuth2 authorization-code flow
//!
//! One provider module per provider; a missing client id/secret pair
//! disables that provider. The callback resolves the platform user by
//! `(provider, provider_user_id)` first, then by email, then creates a new
//! confirmed user with the default role.

pub mod provider;
pub mod providers;
pub mod state;

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub use provider::{OAuthProvider, OAuthTokens, OAuthUserInfo};
pub use state::{clear_state_cookie, generate_state, state_cookie, verify_state, STATE_COOKIE};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::iam::IamService;
use crate::repository::{OAuthLink, OAuthLinkRepo, User, UserRepo};

use providers::{FacebookProvider, GoogleProvider, MicrosoftProvider};

/// Registry of configured providers plus the callback resolution logic
pub struct OAuthManager {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
    users: Arc<dyn UserRepo>,
    links: Arc<dyn OAuthLinkRepo>,
    iam: Arc<IamService>,
}

impl OAuthManager {
    /// Build the registry from configuration; unconfigured providers are
    /// simply absent
    pub fn from_config(
        config: &Config,
        users: Arc<dyn UserRepo>,
        links: Arc<dyn OAuthLinkRepo>,
        iam: Arc<IamService>,
    ) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn OAuthProvider>> = HashMap::new();

        for (name, provider_config) in &config.oauth {
            if !provider_config.is_enabled() {
                continue;
            }
            let redirect_uri = config.oauth_redirect_uri(name);
            let provider: Arc<dyn OAuthProvider> = match name.as_str() {
                "google" => Arc::new(GoogleProvider::new(provider_config, &redirect_uri)?),
                "microsoft" => Arc::new(MicrosoftProvider::new(provider_config, &redirect_uri)?),
                "facebook" => Arc::new(FacebookProvider::new(provider_config, &redirect_uri)?),
                other => {
                    tracing::warn!("unknown OAuth provider {} ignored", other);
                    continue;
                }
            };
            providers.insert(name.clone(), provider);
        }

        Ok(Self {
            providers,
            users,
            links,
            iam,
        })
    }

    /// Look up a configured provider by route name
    pub fn provider(&self, name: &str) -> Result<&Arc<dyn OAuthProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown OAuth provider: {}", name)))
    }

    /// Names of the providers that are configured
    pub fn enabled_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the platform user for a completed callback and store or
    /// refresh the provider linkage
    pub async fn resolve_user(
        &self,
        info: &OAuthUserInfo,
        tokens: &OAuthTokens,
    ) -> Result<User> {
        let email = info
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                Error::BadRequest("OAuth provider returned no email address".to_string())
            })?;

        let user = if let Some(link) = self
            .links
            .find(&info.provider, &info.provider_user_id)
            .await?
        {
            self.users
                .find_by_id(link.user_id)
                .await?
                .filter(|u| u.active)
                .ok_or_else(Error::invalid_credentials)?
        } else if let Some(mut existing) = self.users.find_by_email(email).await? {
            if !existing.active {
                return Err(Error::invalid_credentials());
            }
            // A provider-verified address confirms the account.
            if !existing.confirmed && info.email_verified {
                self.users.set_confirmed(existing.id, true).await?;
                existing.confirmed = true;
            }
            existing
        } else {
            let display_name = info.name.clone().unwrap_or_else(|| email.to_string());
            let mut user = User::new(email, None, &display_name);
            user.confirmed = true;
            self.users.create(&user).await?;
            self.iam.assign_role(user.id, "user", None).await?;
            self.iam
                .record_event(Some(user.id), "auth.oauth.signup", &info.provider);
            user
        };

        self.links
            .upsert(&OAuthLink {
                user_id: user.id,
                provider: info.provider.clone(),
                provider_user_id: info.provider_user_id.clone(),
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone(),
                expires_at: tokens
                    .expires_in
                    .map(|secs| Utc::now() + Duration::seconds(secs)),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;

        self.iam
            .record_event(Some(user.id), "auth.oauth.callback", &info.provider);
        Ok(user)
    }

    /// Unlink a provider from a user account
    pub async fn unlink(&self, user_id: Uuid, provider: &str) -> Result<()> {
        Ok(self.links.delete(user_id, provider).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{
        InMemoryAuditLogRepo, InMemoryOAuthLinkRepo, InMemoryPolicyRepo, InMemoryRoleRepo,
        InMemoryUserRepo,
    };

    async fn manager() -> (OAuthManager, Arc<InMemoryUserRepo>) {
        let users = Arc::new(InMemoryUserRepo::default());
        let iam = Arc::new(IamService::new(
            Arc::new(InMemoryRoleRepo::default()),
            Arc::new(InMemoryPolicyRepo::default()),
            Arc::new(InMemoryAuditLogRepo::default()),
        ));
        iam.seed_defaults().await.unwrap();
        let manager = OAuthManager {
            providers: HashMap::new(),
            users: Arc::clone(&users) as _,
            links: Arc::new(InMemoryOAuthLinkRepo::default()),
            iam,
        };
        (manager, users)
    }

    fn info(provider_user_id: &str, email: Option<&str>) -> OAuthUserInfo {
        OAuthUserInfo {
            provider: "google".to_string(),
            provider_user_id: provider_user_id.to_string(),
            email: email.map(String::from),
            email_verified: true,
            name: Some("Pat".to_string()),
        }
    }

    fn tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_in: Some(3600),
        }
    }

    #[tokio::test]
    async fn test_first_callback_creates_confirmed_user() {
        let (manager, _) = manager().await;

        let user = manager
            .resolve_user(&info("g-1", Some("pat@example.com")), &tokens())
            .await
            .unwrap();
        assert!(user.confirmed);
        assert!(user.password_hash.is_none());

        let roles = manager.iam.roles_for_user(user.id).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "user");
    }

    #[tokio::test]
    async fn test_repeat_callback_resolves_same_user() {
        let (manager, _) = manager().await;

        let first = manager
            .resolve_user(&info("g-1", Some("pat@example.com")), &tokens())
            .await
            .unwrap();
        // Same provider identity, even with a changed email, maps to the
        // linked user.
        let second = manager
            .resolve_user(&info("g-1", Some("new@example.com")), &tokens())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_email_match_links_existing_account() {
        let (manager, users) = manager().await;
        let existing = User::new("pat@example.com", None, "Pat");
        users.create(&existing).await.unwrap();

        let resolved = manager
            .resolve_user(&info("g-9", Some("pat@example.com")), &tokens())
            .await
            .unwrap();
        assert_eq!(resolved.id, existing.id);
    }

    #[tokio::test]
    async fn test_blank_email_fails_the_flow() {
        let (manager, _) = manager().await;
        assert!(matches!(
            manager.resolve_user(&info("g-1", None), &tokens()).await,
            Err(Error::BadRequest(_))
        ));
        assert!(matches!(
            manager
                .resolve_user(&info("g-1", Some("  ")), &tokens())
                .await,
            Err(Error::BadRequest(_))
        ));
    }
}
