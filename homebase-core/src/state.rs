//! The auth kernel: every shared handle the middleware and handlers need
//!
//! Start-up constructs the kernel once; middleware factories and handlers
//! receive it as state. There is no global mutable process state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::{ApiKeyGenerator, AuthService, PasswordHasher, TokenCodec};
use crate::auth::oauth::OAuthManager;
use crate::config::Config;
use crate::error::Result;
use crate::hooks::{HookBus, HookPoint};
use crate::iam::IamService;
use crate::middleware::{MetricsRegistry, RateLimiter};
use crate::repository::memory::{
    InMemoryApiKeyRepo, InMemoryAuditLogRepo, InMemoryCapabilityTokenRepo, InMemoryOAuthLinkRepo,
    InMemoryObjectRepo, InMemoryPolicyRepo, InMemoryQuotaRepo, InMemoryRoleRepo,
    InMemorySessionRepo, InMemoryUserRepo,
};
use crate::repository::pg::{
    PgApiKeyRepo, PgAuditLogRepo, PgCapabilityTokenRepo, PgOAuthLinkRepo, PgObjectRepo,
    PgPolicyRepo, PgQuotaRepo, PgRoleRepo, PgSessionRepo, PgUserRepo,
};
use crate::repository::{
    ApiKeyRepo, AuditLogRepo, CapabilityTokenRepo, OAuthLinkRepo, ObjectRepo, PolicyRepo,
    QuotaRepo, RoleRepo, SessionRepo, UserRepo,
};
use crate::storage::{
    AdmissionHook, CapabilityTokens, DownloadAccountingHook, InMemoryBackend, ObjectMediator,
    QuotaDefaults, QuotaEnforcer, StorageBackend, UploadAccountingHook,
};

/// One repository handle per aggregate
pub struct Repositories {
    pub users: Arc<dyn UserRepo>,
    pub oauth_links: Arc<dyn OAuthLinkRepo>,
    pub sessions: Arc<dyn SessionRepo>,
    pub api_keys: Arc<dyn ApiKeyRepo>,
    pub roles: Arc<dyn RoleRepo>,
    pub policies: Arc<dyn PolicyRepo>,
    pub audit: Arc<dyn AuditLogRepo>,
    pub objects: Arc<dyn ObjectRepo>,
    pub capability_tokens: Arc<dyn CapabilityTokenRepo>,
    pub quotas: Arc<dyn QuotaRepo>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: Arc::new(PgUserRepo::new(pool.clone())),
            oauth_links: Arc::new(PgOAuthLinkRepo::new(pool.clone())),
            sessions: Arc::new(PgSessionRepo::new(pool.clone())),
            api_keys: Arc::new(PgApiKeyRepo::new(pool.clone())),
            roles: Arc::new(PgRoleRepo::new(pool.clone())),
            policies: Arc::new(PgPolicyRepo::new(pool.clone())),
            audit: Arc::new(PgAuditLogRepo::new(pool.clone())),
            objects: Arc::new(PgObjectRepo::new(pool.clone())),
            capability_tokens: Arc::new(PgCapabilityTokenRepo::new(pool.clone())),
            quotas: Arc::new(PgQuotaRepo::new(pool)),
        }
    }

    /// In-memory repositories (tests, ephemeral deployments)
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserRepo::default()),
            oauth_links: Arc::new(InMemoryOAuthLinkRepo::default()),
            sessions: Arc::new(InMemorySessionRepo::default()),
            api_keys: Arc::new(InMemoryApiKeyRepo::default()),
            roles: Arc::new(InMemoryRoleRepo::default()),
            policies: Arc::new(InMemoryPolicyRepo::default()),
            audit: Arc::new(InMemoryAuditLogRepo::default()),
            objects: Arc::new(InMemoryObjectRepo::default()),
            capability_tokens: Arc::new(InMemoryCapabilityTokenRepo::default()),
            quotas: Arc::new(InMemoryQuotaRepo::default()),
        }
    }
}

struct KernelInner {
    config: Config,
    users: Arc<dyn UserRepo>,
    oauth_links: Arc<dyn OAuthLinkRepo>,
    sessions: Arc<dyn SessionRepo>,
    api_keys: Arc<dyn ApiKeyRepo>,
    objects: Arc<dyn ObjectRepo>,
    iam: Arc<IamService>,
    hooks: Arc<HookBus>,
    quota: Arc<QuotaEnforcer>,
    tokens: Arc<CapabilityTokens>,
    mediator: Arc<ObjectMediator>,
    auth: Arc<AuthService>,
    oauth: Arc<OAuthManager>,
    codec: TokenCodec,
    api_key_generator: ApiKeyGenerator,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
    read_only: AtomicBool,
}

/// Shared application state; cheap to clone
#[derive(Clone)]
pub struct AuthKernel {
    inner: Arc<KernelInner>,
}

impl AuthKernel {
    /// Assemble the kernel: wire services, register the quota hooks, seed
    /// IAM defaults, and warm the policy cache.
    pub async fn bootstrap(
        config: Config,
        repos: Repositories,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let codec = TokenCodec::new(
            &config.auth.jwt_secret,
            config.auth.access_token_lifetime_secs,
        );
        let hasher = PasswordHasher::new(&config.auth);
        let api_key_generator = ApiKeyGenerator::new(&config.auth.api_key_prefix);

        let iam = Arc::new(IamService::new(
            Arc::clone(&repos.roles),
            Arc::clone(&repos.policies),
            Arc::clone(&repos.audit),
        ));
        iam.seed_defaults().await?;

        let hooks = Arc::new(HookBus::new());
        let quota = Arc::new(QuotaEnforcer::new(
            Arc::clone(&repos.quotas),
            Arc::clone(&repos.roles),
            QuotaDefaults {
                storage_bytes: config.storage.default_storage_bytes,
                bandwidth_bytes: config.storage.default_bandwidth_bytes,
            },
        ));
        // Seed the default role's quota row so the admin surface shows it.
        quota
            .set_role_default(
                "user",
                Some(config.storage.default_storage_bytes),
                Some(config.storage.default_bandwidth_bytes),
            )
            .await?;

        // Quota is core: admission vetoes uploads, accounting charges the
        // counters. Optional extensions register after these.
        hooks.register(
            HookPoint::BeforeUpload,
            Arc::new(AdmissionHook::new(Arc::clone(&quota))),
        );
        hooks.register(
            HookPoint::AfterUpload,
            Arc::new(UploadAccountingHook::new(Arc::clone(&quota))),
        );
        hooks.register(
            HookPoint::AfterDownload,
            Arc::new(DownloadAccountingHook::new(Arc::clone(&quota))),
        );

        let tokens = Arc::new(CapabilityTokens::new(
            Arc::clone(&repos.capability_tokens),
            config.storage.capability_token_ttl_secs,
        ));
        let mediator = Arc::new(ObjectMediator::new(
            Arc::clone(&repos.objects),
            backend,
            Arc::clone(&hooks),
        ));

        let auth = Arc::new(AuthService::new(
            Arc::clone(&repos.users),
            Arc::clone(&repos.sessions),
            Arc::clone(&iam),
            codec.clone(),
            hasher,
            Arc::clone(&hooks),
            config.auth.refresh_token_lifetime_secs,
        ));
        let oauth = Arc::new(OAuthManager::from_config(
            &config,
            Arc::clone(&repos.users),
            Arc::clone(&repos.oauth_links),
            Arc::clone(&iam),
        )?);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        rate_limiter.spawn_sweeper();

        let read_only = AtomicBool::new(config.server.read_only);

        Ok(Self {
            inner: Arc::new(KernelInner {
                config,
                users: repos.users,
                oauth_links: repos.oauth_links,
                sessions: repos.sessions,
                api_keys: repos.api_keys,
                objects: repos.objects,
                iam,
                hooks,
                quota,
                tokens,
                mediator,
                auth,
                oauth,
                codec,
                api_key_generator,
                rate_limiter,
                metrics: Arc::new(MetricsRegistry::new()),
                read_only,
            }),
        })
    }

    /// Kernel over in-memory stores (tests, ephemeral deployments)
    pub async fn in_memory(config: Config) -> Result<Self> {
        Self::bootstrap(
            config,
            Repositories::in_memory(),
            Arc::new(InMemoryBackend::default()),
        )
        .await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn users(&self) -> &Arc<dyn UserRepo> {
        &self.inner.users
    }

    pub fn oauth_links(&self) -> &Arc<dyn OAuthLinkRepo> {
        &self.inner.oauth_links
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRepo> {
        &self.inner.sessions
    }

    pub fn api_keys(&self) -> &Arc<dyn ApiKeyRepo> {
        &self.inner.api_keys
    }

    pub fn objects(&self) -> &Arc<dyn ObjectRepo> {
        &self.inner.objects
    }

    pub fn iam(&self) -> &Arc<IamService> {
        &self.inner.iam
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.inner.hooks
    }

    pub fn quota(&self) -> &Arc<QuotaEnforcer> {
        &self.inner.quota
    }

    pub fn capability_tokens(&self) -> &Arc<CapabilityTokens> {
        &self.inner.tokens
    }

    pub fn mediator(&self) -> &Arc<ObjectMediator> {
        &self.inner.mediator
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.inner.auth
    }

    pub fn oauth(&self) -> &Arc<OAuthManager> {
        &self.inner.oauth
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.inner.codec
    }

    pub fn api_key_generator(&self) -> &ApiKeyGenerator {
        &self.inner.api_key_generator
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Relaxed)
    }

    /// Flip read-only mode at runtime (admin settings)
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::Relaxed);
    }
}
