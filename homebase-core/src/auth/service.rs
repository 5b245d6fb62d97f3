//! Password login, signup, and session lifecycle
//!
//! Login failures reveal only "Invalid credentials": unknown email, wrong
//! password, and deactivated account are indistinguishable to the caller.
//! Refresh tokens are opaque, stored hashed, and rotate on every use; a
//! replayed refresh token revokes its whole session family.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::api_keys::{hash_key, random_urlsafe_token};
use crate::auth::jwt::TokenCodec;
use crate::auth::password::PasswordHasher;
use crate::error::{Error, Result};
use crate::hooks::{HookBus, HookContext, HookPoint};
use crate::iam::IamService;
use crate::repository::{RefreshSession, SessionRepo, User, UserRepo};

/// Access + refresh credential pair returned by login and refresh
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

/// Password verifier and session minter
pub struct AuthService {
    users: Arc<dyn UserRepo>,
    sessions: Arc<dyn SessionRepo>,
    iam: Arc<IamService>,
    codec: TokenCodec,
    hasher: PasswordHasher,
    hooks: Arc<HookBus>,
    refresh_lifetime_secs: i64,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserRepo>,
        sessions: Arc<dyn SessionRepo>,
        iam: Arc<IamService>,
        codec: TokenCodec,
        hasher: PasswordHasher,
        hooks: Arc<HookBus>,
        refresh_lifetime_secs: i64,
    ) -> Self {
        Self {
            users,
            sessions,
            iam,
            codec,
            hasher,
            hooks,
            refresh_lifetime_secs,
        }
    }

    /// Register a new user and seed the default `user` role
    pub async fn signup(&self, email: &str, password: &str, display_name: &str) -> Result<User> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::ValidationError("Invalid email address".to_string()));
        }

        let hash = self.hasher.hash(password)?;
        let user = User::new(email, Some(hash), display_name);
        self.users.create(&user).await.map_err(|e| match e {
            crate::repository::RepositoryError::Conflict(_) => {
                Error::Conflict("Email already registered".to_string())
            }
            other => other.into(),
        })?;

        self.iam.assign_role(user.id, "user", None).await?;
        self.iam.record_event(Some(user.id), "auth.signup", email);
        Ok(user)
    }

    /// Password login: verify, fire `PostLogin` hooks, mint a token pair
    pub async fn login(&self, email: &str, password: &str) -> Result<(TokenPair, User)> {
        let user = match self.users.find_by_email(email).await? {
            Some(user) if user.active => user,
            _ => {
                self.iam.record_event(None, "auth.login.failed", email);
                return Err(Error::invalid_credentials());
            }
        };
        let Some(stored_hash) = user.password_hash.clone() else {
            self.iam.record_event(Some(user.id), "auth.login.failed", email);
            return Err(Error::invalid_credentials());
        };
        if !self.hasher.verify(password, &stored_hash)? {
            self.iam.record_event(Some(user.id), "auth.login.failed", email);
            return Err(Error::invalid_credentials());
        }

        // Transparent cost upgrade after a config change.
        if self.hasher.needs_rehash(&stored_hash) {
            if let Ok(new_hash) = self.hasher.hash(password) {
                let _ = self.users.set_password_hash(user.id, &new_hash).await;
            }
        }

        let ctx = HookContext::for_user(user.id);
        self.hooks
            .dispatch(HookPoint::PostLogin, &ctx)
            .await
            .map_err(|veto| Error::Forbidden(veto.message))?;

        let roles = self.iam.effective_roles(user.id, &[]).await?;
        let pair = self.mint_pair(&user, roles, Uuid::new_v4()).await?;
        self.iam
            .record_event(Some(user.id), "auth.login.success", email);
        Ok((pair, user))
    }

    /// Rotate a refresh token
    ///
    /// A replayed (already-rotated) token is treated as theft: the whole
    /// session family is revoked.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let session = self
            .sessions
            .find_by_token_hash(&hash_key(refresh_token))
            .await?
            .ok_or_else(Error::invalid_token)?;

        if session.revoked_at.is_some() {
            let revoked = self.sessions.revoke_family(session.family_id).await?;
            self.iam.record_event(
                Some(session.user_id),
                "auth.refresh.reuse_detected",
                &format!("revoked {} sessions", revoked),
            );
            return Err(Error::invalid_token());
        }
        if !session.is_active() {
            return Err(Error::invalid_token());
        }

        let user = match self.users.find_by_id(session.user_id).await? {
            Some(user) if user.active => user,
            _ => return Err(Error::invalid_token()),
        };

        self.sessions.revoke(session.id).await?;
        let roles = self.iam.effective_roles(user.id, &[]).await?;
        let pair = self.mint_pair(&user, roles, session.family_id).await?;
        self.iam
            .record_event(Some(user.id), "auth.token.refresh", "");
        Ok(pair)
    }

    /// Retire one session (when the refresh token is presented) or all of
    /// the user's sessions
    pub async fn logout(&self, user_id: Uuid, refresh_token: Option<&str>) -> Result<()> {
        match refresh_token {
            Some(token) => {
                if let Some(session) = self
                    .sessions
                    .find_by_token_hash(&hash_key(token))
                    .await?
                {
                    if session.user_id == user_id {
                        self.sessions.revoke(session.id).await?;
                    }
                }
            }
            None => {
                self.sessions.revoke_all_for_user(user_id).await?;
            }
        }
        self.iam.record_event(Some(user_id), "auth.logout", "");
        Ok(())
    }

    /// Change the password and retire every refresh session
    pub async fn change_password(
        &self,
        user: &User,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let Some(stored_hash) = user.password_hash.as_deref() else {
            return Err(Error::invalid_credentials());
        };
        if !self.hasher.verify(current_password, stored_hash)? {
            return Err(Error::invalid_credentials());
        }

        let new_hash = self.hasher.hash(new_password)?;
        self.users.set_password_hash(user.id, &new_hash).await?;
        self.sessions.revoke_all_for_user(user.id).await?;
        self.iam
            .record_event(Some(user.id), "auth.password.changed", "");
        Ok(())
    }

    /// Issue a token pair for an externally verified user (OAuth callback)
    pub async fn issue_for_user(&self, user: &User) -> Result<TokenPair> {
        let ctx = HookContext::for_user(user.id);
        self.hooks
            .dispatch(HookPoint::PostLogin, &ctx)
            .await
            .map_err(|veto| Error::Forbidden(veto.message))?;

        let roles = self.iam.effective_roles(user.id, &[]).await?;
        self.mint_pair(user, roles, Uuid::new_v4()).await
    }

    async fn mint_pair(
        &self,
        user: &User,
        roles: Vec<String>,
        family_id: Uuid,
    ) -> Result<TokenPair> {
        let (access_token, _) = self.codec.issue(user.id, &user.email, roles)?;

        let refresh_token = random_urlsafe_token();
        let now = Utc::now();
        self.sessions
            .create(&RefreshSession {
                id: Uuid::new_v4(),
                user_id: user.id,
                family_id,
                refresh_token_hash: hash_key(&refresh_token),
                created_at: now,
                expires_at: now + Duration::seconds(self.refresh_lifetime_secs),
                revoked_at: None,
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.codec.access_lifetime_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::hooks::{HookError, HookHandler};
    use crate::repository::memory::{
        InMemoryAuditLogRepo, InMemoryPolicyRepo, InMemoryRoleRepo, InMemorySessionRepo,
        InMemoryUserRepo,
    };

    fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".to_string(),
            bcrypt_cost: 10,
            ..AuthConfig::default()
        }
    }

    async fn service_with_hooks(hooks: Arc<HookBus>) -> AuthService {
        let iam = Arc::new(IamService::new(
            Arc::new(InMemoryRoleRepo::default()),
            Arc::new(InMemoryPolicyRepo::default()),
            Arc::new(InMemoryAuditLogRepo::default()),
        ));
        iam.seed_defaults().await.unwrap();

        let config = auth_config();
        AuthService::new(
            Arc::new(InMemoryUserRepo::default()),
            Arc::new(InMemorySessionRepo::default()),
            iam,
            TokenCodec::new(&config.jwt_secret, config.access_token_lifetime_secs),
            PasswordHasher::new(&config),
            hooks,
            config.refresh_token_lifetime_secs,
        )
    }

    async fn service() -> AuthService {
        service_with_hooks(Arc::new(HookBus::new())).await
    }

    #[tokio::test]
    async fn test_signup_then_login() {
        let service = service().await;
        let user = service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        assert!(user.password_hash.is_some());

        let (pair, logged_in) = service.login("u@example.com", "password123").await.unwrap();
        assert_eq!(logged_in.id, user.id);
        assert!(!pair.access_token.is_empty());
        assert_eq!(pair.expires_in, 86_400);

        // The default role was seeded into the claims.
        let claims = service.codec.verify(&pair.access_token).unwrap();
        assert!(claims.has_role("user"));
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let service = service().await;
        service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();

        let unknown = service.login("ghost@example.com", "password123").await;
        let wrong = service.login("u@example.com", "wrong-password").await;

        for result in [unknown, wrong] {
            assert!(matches!(
                result,
                Err(Error::Unauthorized(msg)) if msg == "Invalid credentials"
            ));
        }
    }

    #[tokio::test]
    async fn test_duplicate_signup_conflicts() {
        let service = service().await;
        service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        assert!(matches!(
            service.signup("U@EXAMPLE.COM", "password456", "U2").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_detects_reuse() {
        let service = service().await;
        service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        let (pair, _) = service.login("u@example.com", "password123").await.unwrap();

        let rotated = service.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);

        // Replaying the rotated-out token kills the family.
        assert!(service.refresh(&pair.refresh_token).await.is_err());
        assert!(service.refresh(&rotated.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_password_change_revokes_sessions() {
        let service = service().await;
        let user = service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        let (pair, _) = service.login("u@example.com", "password123").await.unwrap();

        let user = service.users.find_by_id(user.id).await.unwrap().unwrap();
        service
            .change_password(&user, "password123", "new-password-1")
            .await
            .unwrap();

        assert!(service.refresh(&pair.refresh_token).await.is_err());
        assert!(service.login("u@example.com", "password123").await.is_err());
        assert!(service
            .login("u@example.com", "new-password-1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_post_login_hook_can_veto() {
        struct Veto;

        #[async_trait::async_trait]
        impl HookHandler for Veto {
            fn name(&self) -> &str {
                "maintenance-gate"
            }
            async fn handle(&self, _ctx: &HookContext) -> std::result::Result<(), HookError> {
                Err(HookError::new("logins disabled"))
            }
        }

        let hooks = Arc::new(HookBus::new());
        hooks.register(HookPoint::PostLogin, Arc::new(Veto));
        let service = service_with_hooks(hooks).await;

        service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        assert!(matches!(
            service.login("u@example.com", "password123").await,
            Err(Error::Forbidden(msg)) if msg == "logins disabled"
        ));
    }

    #[tokio::test]
    async fn test_soft_deleted_user_cannot_login() {
        let service = service().await;
        let user = service
            .signup("u@example.com", "password123", "U")
            .await
            .unwrap();
        service.users.set_active(user.id, false).await.unwrap();

        assert!(matches!(
            service.login("u@example.com", "password123").await,
            Err(Error::Unauthorized(msg)) if msg == "Invalid credentials"
        ));
    }
}
