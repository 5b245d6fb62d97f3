//! IAM policy engine
//!
//! Stores roles, user-role bindings, and `(subject, object, action, effect)`
//! rules; answers allow/deny queries with deny-overrides and an
//! administrator bypass. Rules live in the policy store and are served from
//! a process-local read-through cache that is invalidated on every mutating
//! call. The store is authoritative; the cache never outlives a mutation.
//!
//! Failure semantics are fail-closed: when the policy store cannot be read
//! and no cache exists, principals are treated as roleless and every
//! non-administrative decision is a deny.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::iam::matcher::{match_action, match_path};
use crate::iam::model::{
    AuditEntry, AuditFilter, Effect, EffectiveMetadata, Grouping, Role, RoleMetadata, RoleType,
    Rule, UserRole,
};
use crate::repository::{AuditLogRepo, PolicyRepo, RoleRepo};

/// Snapshot of the policy store held in memory
#[derive(Debug, Clone, Default)]
struct PolicyCache {
    rules: Vec<Rule>,
    groupings_by_user: HashMap<Uuid, Vec<String>>,
}

/// The policy engine
pub struct IamService {
    roles: Arc<dyn RoleRepo>,
    policies: Arc<dyn PolicyRepo>,
    audit: Arc<dyn AuditLogRepo>,
    cache: RwLock<Option<PolicyCache>>,
}

impl IamService {
    pub fn new(
        roles: Arc<dyn RoleRepo>,
        policies: Arc<dyn PolicyRepo>,
        audit: Arc<dyn AuditLogRepo>,
    ) -> Self {
        Self {
            roles,
            policies,
            audit,
            cache: RwLock::new(None),
        }
    }

    // -- cache ---------------------------------------------------------------

    /// Eagerly load the policy cache; called at start-up and after mutations
    pub async fn reload(&self) -> Result<()> {
        let rules = self.policies.load_rules().await?;
        let groupings = self.policies.load_groupings().await?;

        let mut groupings_by_user: HashMap<Uuid, Vec<String>> = HashMap::new();
        for Grouping { user_id, role } in groupings {
            groupings_by_user.entry(user_id).or_default().push(role);
        }

        *self.cache.write().unwrap() = Some(PolicyCache {
            rules,
            groupings_by_user,
        });
        Ok(())
    }

    async fn invalidate(&self) {
        if let Err(e) = self.reload().await {
            // Drop the stale cache so decisions fail closed instead of
            // reading rules the store no longer holds.
            *self.cache.write().unwrap() = None;
            tracing::warn!("policy cache reload failed: {}", e);
        }
    }

    fn cached(&self) -> Option<PolicyCache> {
        self.cache.read().unwrap().clone()
    }

    async fn cache_or_load(&self) -> Result<PolicyCache> {
        if let Some(cache) = self.cached() {
            return Ok(cache);
        }
        self.reload().await?;
        self.cached()
            .ok_or_else(|| Error::Internal("policy cache empty after reload".to_string()))
    }

    // -- decisions -----------------------------------------------------------

    /// Roles effective for a user: stored groupings plus token-claim roles
    ///
    /// Fails when the policy store is unreachable; the authentication
    /// middleware then falls back to the claim roles alone (they were signed
    /// by this process at login time).
    pub async fn effective_roles(
        &self,
        user_id: Uuid,
        claim_roles: &[String],
    ) -> Result<Vec<String>> {
        let cache = self.cache_or_load().await?;
        let mut roles = cache
            .groupings_by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        for role in claim_roles {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        Ok(roles)
    }

    /// The decision function: may `principal` perform `action` on `path`?
    ///
    /// Writes one audit entry per call; the write is best-effort and never
    /// blocks the decision.
    pub async fn check_permission(
        &self,
        principal: &Principal,
        path: &str,
        action: &str,
        ip: &str,
        user_agent: &str,
    ) -> bool {
        let (allowed, reason) = self.decide(principal, path, action).await;
        self.audit_detached(
            AuditEntry::decision(Some(principal.id), path, action, allowed, &reason)
                .with_client(ip, user_agent),
        );
        allowed
    }

    async fn decide(&self, principal: &Principal, path: &str, action: &str) -> (bool, String) {
        if principal.is_admin() {
            return (true, "admin bypass".to_string());
        }

        let cache = match self.cache_or_load().await {
            Ok(cache) => cache,
            Err(e) => {
                tracing::error!("policy store unreachable, denying: {}", e);
                return (false, "policy store unavailable".to_string());
            }
        };

        let matching: Vec<&Rule> = cache
            .rules
            .iter()
            .filter(|r| principal.roles.iter().any(|role| role == &r.subject))
            .filter(|r| match_path(&r.object, path) && match_action(&r.action, action))
            .collect();

        let denied = matching.iter().any(|r| r.effect == Effect::Deny);
        let allowed = matching.iter().any(|r| r.effect == Effect::Allow);

        if denied {
            (false, "matched deny rule".to_string())
        } else if allowed {
            (true, "matched allow rule".to_string())
        } else {
            (false, "no matching rule".to_string())
        }
    }

    fn audit_detached(&self, entry: AuditEntry) {
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            if let Err(e) = audit.append(&entry).await {
                tracing::warn!("audit write failed: {}", e);
            }
        });
    }

    /// Record an auth lifecycle event (login, logout, key revocation, ...)
    pub fn record_event(&self, user_id: Option<Uuid>, action: &str, reason: &str) {
        self.audit_detached(AuditEntry::event(user_id, action, reason));
    }

    pub async fn list_audit_logs(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        Ok(self.audit.list(filter).await?)
    }

    // -- role management -----------------------------------------------------

    pub async fn create_role(
        &self,
        name: &str,
        display_name: &str,
        description: &str,
        metadata: RoleMetadata,
    ) -> Result<Role> {
        if self.roles.find_by_name(name).await?.is_some() {
            return Err(Error::Conflict(format!("Role {} already exists", name)));
        }
        let now = Utc::now();
        let role = Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            role_type: RoleType::Custom,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.roles.create(&role).await?;
        Ok(role)
    }

    pub async fn update_role(
        &self,
        role_id: Uuid,
        display_name: Option<String>,
        description: Option<String>,
        metadata: Option<RoleMetadata>,
    ) -> Result<Role> {
        let mut role = self
            .roles
            .find_by_id(role_id)
            .await?
            .ok_or_else(|| Error::NotFound("Role not found".to_string()))?;
        if role.is_system() {
            return Err(Error::Forbidden(
                "System roles cannot be modified".to_string(),
            ));
        }
        if let Some(display_name) = display_name {
            role.display_name = display_name;
        }
        if let Some(description) = description {
            role.description = description;
        }
        if let Some(metadata) = metadata {
            role.metadata = metadata;
        }
        role.updated_at = Utc::now();
        self.roles.update(&role).await?;
        Ok(role)
    }

    /// Delete a custom role, cascading to its rules and user assignments
    pub async fn delete_role(&self, role_id: Uuid) -> Result<()> {
        let role = self
            .roles
            .find_by_id(role_id)
            .await?
            .ok_or_else(|| Error::NotFound("Role not found".to_string()))?;
        if role.is_system() {
            return Err(Error::Forbidden(
                "System roles cannot be deleted".to_string(),
            ));
        }

        self.policies.remove_rules_for_subject(&role.name).await?;
        self.policies.remove_groupings_for_role(&role.name).await?;
        self.roles.remove_assignments_for_role(role.id).await?;
        self.roles.delete(role.id).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.list().await?)
    }

    /// Bind a user to a role; writes both the binding and the grouping row.
    /// Assigning twice is a no-op.
    pub async fn assign_role(
        &self,
        user_id: Uuid,
        role_name: &str,
        granted_by: Option<Uuid>,
    ) -> Result<()> {
        let role = self
            .roles
            .find_by_name(role_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", role_name)))?;

        self.roles
            .assign(&UserRole {
                user_id,
                role_id: role.id,
                granted_by,
                granted_at: Utc::now(),
                expires_at: None,
            })
            .await?;
        self.policies
            .add_grouping(&Grouping {
                user_id,
                role: role.name.clone(),
            })
            .await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn remove_role(&self, user_id: Uuid, role_name: &str) -> Result<()> {
        let role = self
            .roles
            .find_by_name(role_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Role {} not found", role_name)))?;

        self.roles.unassign(user_id, role.id).await?;
        self.policies
            .remove_grouping(&Grouping {
                user_id,
                role: role.name.clone(),
            })
            .await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>> {
        Ok(self.roles.roles_for_user(user_id).await?)
    }

    // -- rule management -----------------------------------------------------

    pub async fn add_rule(&self, rule: &Rule) -> Result<()> {
        if self.roles.find_by_name(&rule.subject).await?.is_none() {
            return Err(Error::ValidationError(format!(
                "Rule subject {} does not name a role",
                rule.subject
            )));
        }
        self.policies.add_rule(rule).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn remove_rule(&self, rule: &Rule) -> Result<()> {
        if rule.subject == "admin"
            && rule.object == "*"
            && rule.action == "*"
            && rule.effect == Effect::Allow
        {
            return Err(Error::ValidationError(
                "The admin allow-all rule cannot be removed".to_string(),
            ));
        }
        self.policies.remove_rule(rule).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.cache_or_load().await?.rules)
    }

    // -- effective metadata --------------------------------------------------

    /// Union of `allowed_ips` and intersection of `disabled_features`
    /// across all of the user's roles
    pub async fn user_effective_metadata(&self, user_id: Uuid) -> Result<EffectiveMetadata> {
        let roles = self.roles.roles_for_user(user_id).await?;

        let mut allowed_ips: Vec<String> = Vec::new();
        for role in &roles {
            for ip in &role.metadata.allowed_ips {
                if !allowed_ips.contains(ip) {
                    allowed_ips.push(ip.clone());
                }
            }
        }

        let mut disabled_features: Vec<String> = roles
            .first()
            .map(|r| r.metadata.disabled_features.clone())
            .unwrap_or_default();
        for role in roles.iter().skip(1) {
            disabled_features.retain(|f| role.metadata.disabled_features.contains(f));
        }

        Ok(EffectiveMetadata {
            allowed_ips,
            disabled_features,
        })
    }

    // -- seeding -------------------------------------------------------------

    /// Seed default roles and rules on first run (empty role table).
    /// Individual writes are idempotent, so a crashed partial seed heals on
    /// the next start.
    pub async fn seed_defaults(&self) -> Result<()> {
        if self.roles.count().await? > 0 {
            self.reload().await?;
            return Ok(());
        }

        for (name, display_name, description) in [
            ("admin", "Administrator", "Full access to every resource"),
            (
                "admin_viewer",
                "Administrator (read-only)",
                "Read-only access to the admin surface",
            ),
            ("user", "User", "Self-service access to owned resources"),
        ] {
            let now = Utc::now();
            let role = Role {
                id: Uuid::new_v4(),
                name: name.to_string(),
                display_name: display_name.to_string(),
                description: description.to_string(),
                role_type: RoleType::System,
                metadata: RoleMetadata::default(),
                created_at: now,
                updated_at: now,
            };
            if self.roles.find_by_name(name).await?.is_none() {
                self.roles.create(&role).await?;
            }
        }

        let seed_rules = [
            Rule::allow("admin", "*", "*"),
            Rule::allow("admin_viewer", "/api/admin/*", "GET"),
            Rule::allow("admin_viewer", "/auth/me", "GET|PATCH"),
            Rule::allow("admin_viewer", "/auth/change-password", "POST"),
            Rule::allow("user", "/auth/me", "GET|PATCH"),
            Rule::allow("user", "/auth/change-password", "POST"),
            Rule::allow("user", "/auth/api-keys*", "*"),
            Rule::allow("user", "/api/storage/**", "*"),
            Rule::allow("user", "/api/settings", "GET"),
            Rule::allow("user", "/api/dashboard/stats", "GET"),
            Rule::allow("user", "/api/ext/**", "*"),
        ];
        for rule in &seed_rules {
            self.policies.add_rule(rule).await?;
        }

        self.reload().await?;
        tracing::info!("seeded default roles and policies");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::repository::memory::{InMemoryAuditLogRepo, InMemoryPolicyRepo, InMemoryRoleRepo};

    fn service() -> (IamService, Arc<InMemoryPolicyRepo>, Arc<InMemoryAuditLogRepo>) {
        let roles = Arc::new(InMemoryRoleRepo::default());
        let policies = Arc::new(InMemoryPolicyRepo::default());
        let audit = Arc::new(InMemoryAuditLogRepo::default());
        let service = IamService::new(roles, Arc::clone(&policies) as _, Arc::clone(&audit) as _);
        (service, policies, audit)
    }

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            email: "p@example.com".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            app_id: None,
            method: AuthMethod::Password,
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();
        service.seed_defaults().await.unwrap();

        let roles = service.list_roles().await.unwrap();
        assert_eq!(roles.len(), 3);
        assert!(roles.iter().all(Role::is_system));

        let rules = service.list_rules().await.unwrap();
        let admin_all = rules
            .iter()
            .filter(|r| r.subject == "admin" && r.object == "*" && r.action == "*")
            .count();
        assert_eq!(admin_all, 1);
    }

    #[tokio::test]
    async fn test_admin_bypass_allows_everything() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        let admin = principal(&["admin"]);
        for (path, action) in [
            ("/api/admin/users", "DELETE"),
            ("/anything/at/all", "PATCH"),
            ("/api/storage/buckets/b/objects/1", "GET"),
        ] {
            assert!(
                service
                    .check_permission(&admin, path, action, "127.0.0.1", "test")
                    .await
            );
        }
    }

    #[tokio::test]
    async fn test_deny_overrides_allow() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();
        service
            .add_rule(&Rule::deny("user", "/api/storage/**", "DELETE"))
            .await
            .unwrap();

        let user = principal(&["user"]);
        assert!(
            service
                .check_permission(&user, "/api/storage/buckets/b", "GET", "", "")
                .await
        );
        assert!(
            !service
                .check_permission(&user, "/api/storage/buckets/b", "DELETE", "", "")
                .await
        );
    }

    #[tokio::test]
    async fn test_roleless_principal_is_denied() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        let nobody = principal(&[]);
        assert!(
            !service
                .check_permission(&nobody, "/api/storage/buckets", "GET", "", "")
                .await
        );
    }

    #[tokio::test]
    async fn test_fail_closed_when_store_unavailable() {
        let (service, policies, _) = service();
        service.seed_defaults().await.unwrap();

        // Simulate a store outage with no warm cache.
        policies.set_unavailable(true);
        *service.cache.write().unwrap() = None;

        let user = principal(&["user"]);
        assert!(
            !service
                .check_permission(&user, "/api/storage/buckets", "GET", "", "")
                .await
        );

        // Admin bypass still applies; it never consults the store.
        let admin = principal(&["admin"]);
        assert!(
            service
                .check_permission(&admin, "/api/storage/buckets", "GET", "", "")
                .await
        );
    }

    #[tokio::test]
    async fn test_decisions_are_audited() {
        let (service, _, audit) = service();
        service.seed_defaults().await.unwrap();

        let user = principal(&["user"]);
        service
            .check_permission(&user, "/api/admin/users", "GET", "10.0.0.1", "curl")
            .await;

        // The audit write is detached; wait for it to land.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while audit.entries().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let entries = audit.entries();
        assert_eq!(entries[0].result, "deny");
        assert_eq!(entries[0].path, "/api/admin/users");
        assert_eq!(entries[0].ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_system_roles_are_immutable() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        let roles = service.list_roles().await.unwrap();
        let admin = roles.iter().find(|r| r.name == "admin").unwrap();

        assert!(matches!(
            service.update_role(admin.id, Some("x".into()), None, None).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            service.delete_role(admin.id).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_role_delete_cascades() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        let role = service
            .create_role("reporter", "Reporter", "", RoleMetadata::default())
            .await
            .unwrap();
        service
            .add_rule(&Rule::allow("reporter", "/api/reports/*", "GET"))
            .await
            .unwrap();
        let user_id = Uuid::new_v4();
        service.assign_role(user_id, "reporter", None).await.unwrap();

        service.delete_role(role.id).await.unwrap();

        assert!(service.list_rules().await.unwrap().iter().all(|r| r.subject != "reporter"));
        assert!(service.roles_for_user(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_allow_all_rule_is_protected() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        assert!(matches!(
            service.remove_rule(&Rule::allow("admin", "*", "*")).await,
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_rule_subject_must_name_a_role() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        assert!(matches!(
            service.add_rule(&Rule::allow("ghost", "/x", "GET")).await,
            Err(Error::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_effective_metadata_union_and_intersection() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        service
            .create_role(
                "branch-a",
                "A",
                "",
                RoleMetadata {
                    allowed_ips: vec!["10.0.0.0/8".into()],
                    disabled_features: vec!["export".into(), "sql".into()],
                },
            )
            .await
            .unwrap();
        service
            .create_role(
                "branch-b",
                "B",
                "",
                RoleMetadata {
                    allowed_ips: vec!["192.168.0.0/16".into(), "10.0.0.0/8".into()],
                    disabled_features: vec!["sql".into()],
                },
            )
            .await
            .unwrap();

        let user_id = Uuid::new_v4();
        service.assign_role(user_id, "branch-a", None).await.unwrap();
        service.assign_role(user_id, "branch-b", None).await.unwrap();

        let meta = service.user_effective_metadata(user_id).await.unwrap();
        assert_eq!(meta.allowed_ips.len(), 2);
        assert_eq!(meta.disabled_features, vec!["sql".to_string()]);
    }

    #[tokio::test]
    async fn test_effective_roles_merges_claims() {
        let (service, _, _) = service();
        service.seed_defaults().await.unwrap();

        let user_id = Uuid::new_v4();
        service.assign_role(user_id, "user", None).await.unwrap();

        let roles = service
            .effective_roles(user_id, &["admin_viewer".to_string(), "user".to_string()])
            .await
            .unwrap();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&"user".to_string()));
        assert!(roles.contains(&"admin_viewer".to_string()));
    }
}
