//! Authentication: credential ingestion, session minting, principals
//!
//! Three parallel verifiers turn a presented credential into a [`Principal`]:
//! password login ([`service`]), the OAuth2 authorization-code flow
//! ([`oauth`]), and API keys (recognized by shape in the authentication
//! middleware). Capability tokens bypass this module entirely; the principal
//! they act for is recorded in the token itself.

pub mod api_keys;
pub mod jwt;
pub mod oauth;
pub mod password;
pub mod service;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use api_keys::{ApiKey, ApiKeyGenerator};
pub use jwt::{Claims, TokenCodec};
pub use password::PasswordHasher;
pub use service::{AuthService, TokenPair};

/// How the request was authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    OAuth,
    ApiKey,
    Capability,
}

/// The authenticated identity attached to one request
///
/// Constructed by the authentication middleware (or the capability-token
/// service) and lives only for the duration of the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub roles: Vec<String>,
    pub app_id: Option<String>,
    pub method: AuthMethod,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Administrators bypass policy and ownership checks
    pub fn is_admin(&self) -> bool {
        self.has_role("admin")
    }

    pub fn is_admin_viewer(&self) -> bool {
        self.has_role("admin_viewer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_detection() {
        let principal = Principal {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            roles: vec!["admin".to_string(), "user".to_string()],
            app_id: None,
            method: AuthMethod::Password,
        };
        assert!(principal.is_admin());
        assert!(!principal.is_admin_viewer());
        assert!(principal.has_role("user"));
        assert!(!principal.has_role("manager"));
    }
}
