//! IAM aggregates: roles, user-role bindings, policy rows, audit log

use async_trait::async_trait;
use uuid::Uuid;

use super::error::RepositoryResult;
use crate::iam::model::{AuditEntry, AuditFilter, Grouping, Role, Rule, UserRole};

/// Repository for roles and user-role bindings
#[async_trait]
pub trait RoleRepo: Send + Sync {
    async fn create(&self, role: &Role) -> RepositoryResult<()>;

    async fn update(&self, role: &Role) -> RepositoryResult<()>;

    async fn delete(&self, id: Uuid) -> RepositoryResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Role>>;

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Role>>;

    async fn list(&self) -> RepositoryResult<Vec<Role>>;

    async fn count(&self) -> RepositoryResult<i64>;

    /// Insert a binding; assigning twice leaves a single binding
    async fn assign(&self, binding: &UserRole) -> RepositoryResult<()>;

    async fn unassign(&self, user_id: Uuid, role_id: Uuid) -> RepositoryResult<()>;

    async fn roles_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<Role>>;

    /// Drop all bindings of a role (role deletion cascade)
    async fn remove_assignments_for_role(&self, role_id: Uuid) -> RepositoryResult<u64>;
}

/// Repository for policy rows (`ptype = "p"` rules, `ptype = "g"` groupings)
#[async_trait]
pub trait PolicyRepo: Send + Sync {
    async fn load_rules(&self) -> RepositoryResult<Vec<Rule>>;

    async fn load_groupings(&self) -> RepositoryResult<Vec<Grouping>>;

    /// Insert a rule; inserting an identical row is a no-op
    async fn add_rule(&self, rule: &Rule) -> RepositoryResult<()>;

    async fn remove_rule(&self, rule: &Rule) -> RepositoryResult<()>;

    /// Drop every rule for a subject (role deletion cascade)
    async fn remove_rules_for_subject(&self, subject: &str) -> RepositoryResult<u64>;

    /// Insert a grouping; inserting an identical row is a no-op
    async fn add_grouping(&self, grouping: &Grouping) -> RepositoryResult<()>;

    async fn remove_grouping(&self, grouping: &Grouping) -> RepositoryResult<()>;

    /// Drop every grouping naming a role (role deletion cascade)
    async fn remove_groupings_for_role(&self, role: &str) -> RepositoryResult<u64>;

    async fn groupings_for_user(&self, user_id: Uuid) -> RepositoryResult<Vec<String>>;
}

/// Repository for the audit log
#[async_trait]
pub trait AuditLogRepo: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> RepositoryResult<()>;

    async fn list(&self, filter: &AuditFilter) -> RepositoryResult<Vec<AuditEntry>>;
}
