//! IAM: role assignment, rule storage, and allow/deny decisions
//!
//! The rule shape is fixed (`subject = role name`, `object = path pattern`,
//! `action = method pattern`, `effect = allow | deny`), so the engine
//! implements path and action matching directly; the data model is the
//! contract.

pub mod engine;
pub mod matcher;
pub mod model;

pub use engine::IamService;
pub use model::{
    AuditEntry, AuditFilter, Effect, EffectiveMetadata, Grouping, Role, RoleMetadata, RoleType,
    Rule, UserRole,
};
