//! IAM domain types: roles, bindings, policy rows, audit entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role kind; system roles cannot be updated or deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    System,
    Custom,
}

impl RoleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "system" {
            Self::System
        } else {
            Self::Custom
        }
    }
}

/// Access-control metadata attached to a role
///
/// Merged across a user's roles into [`EffectiveMetadata`]: allowed IPs are
/// unioned, disabled features intersected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMetadata {
    /// CIDR/IP allow-list; empty means unrestricted
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Feature flags switched off for holders of this role
    #[serde(default)]
    pub disabled_features: Vec<String>,
}

/// A role row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub role_type: RoleType,
    pub metadata: RoleMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn is_system(&self) -> bool {
        self.role_type == RoleType::System
    }
}

/// A user-to-role binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Rule effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "deny" {
            Self::Deny
        } else {
            Self::Allow
        }
    }
}

/// A `ptype = "p"` policy row: `(role, path pattern, action pattern, effect)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub subject: String,
    pub object: String,
    pub action: String,
    pub effect: Effect,
}

impl Rule {
    pub fn allow(subject: &str, object: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            object: object.to_string(),
            action: action.to_string(),
            effect: Effect::Allow,
        }
    }

    pub fn deny(subject: &str, object: &str, action: &str) -> Self {
        Self {
            subject: subject.to_string(),
            object: object.to_string(),
            action: action.to_string(),
            effect: Effect::Deny,
        }
    }
}

/// A `ptype = "g"` policy row binding a user id to a role name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub user_id: Uuid,
    pub role: String,
}

/// One audit-log entry per policy decision or auth lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Database id; zero before insertion
    #[serde(default)]
    pub id: i64,
    pub user_id: Option<Uuid>,
    pub path: String,
    pub action: String,
    pub result: String,
    pub reason: String,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn decision(
        user_id: Option<Uuid>,
        path: &str,
        action: &str,
        allowed: bool,
        reason: &str,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            path: path.to_string(),
            action: action.to_string(),
            result: if allowed { "allow" } else { "deny" }.to_string(),
            reason: reason.to_string(),
            ip: String::new(),
            user_agent: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn event(user_id: Option<Uuid>, action: &str, reason: &str) -> Self {
        Self {
            id: 0,
            user_id,
            path: String::new(),
            action: action.to_string(),
            result: "event".to_string(),
            reason: reason.to_string(),
            ip: String::new(),
            user_agent: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_client(mut self, ip: &str, user_agent: &str) -> Self {
        self.ip = ip.to_string();
        self.user_agent = user_agent.to_string();
        self
    }
}

/// Audit log query filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<Uuid>,
    pub result: Option<String>,
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_audit_limit() -> i64 {
    100
}

/// Merged access-control configuration across all of a user's roles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveMetadata {
    /// Union of per-role IP allow-lists
    pub allowed_ips: Vec<String>,

    /// Intersection of per-role disabled feature sets
    pub disabled_features: Vec<String>,
}
