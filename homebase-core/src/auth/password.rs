//! Password hashing using bcrypt
//!
//! Verification compares in constant time inside the bcrypt implementation.
//! Password length policy is enforced here at the boundary, not inside the
//! hash function, so stored hashes stay policy-independent.

use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Password hasher with a configurable cost factor
#[derive(Clone)]
pub struct PasswordHasher {
    cost: u32,
    min_password_length: usize,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(&AuthConfig::default())
    }
}

impl PasswordHasher {
    /// Create a new password hasher from the auth configuration
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            cost: config.bcrypt_cost.max(10),
            min_password_length: config.min_password_length,
        }
    }

    /// Hash a password
    ///
    /// Returns a modular-crypt hash string that embeds the cost and salt.
    /// Rejects passwords shorter than the configured minimum.
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.chars().count() < self.min_password_length {
            return Err(Error::ValidationError(format!(
                "Password must be at least {} characters",
                self.min_password_length
            )));
        }

        bcrypt::hash(password, self.cost)
            .map_err(|e| Error::Internal(format!("Failed to hash password: {}", e)))
    }

    /// Verify a password against a stored hash
    ///
    /// Returns `false` for a mismatch; an error only for an unparseable hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        bcrypt::verify(password, hash)
            .map_err(|e| Error::Internal(format!("Invalid password hash: {}", e)))
    }

    /// Check whether a stored hash uses a different cost than configured
    ///
    /// Used to transparently upgrade hashes on successful login after a
    /// configuration change.
    pub fn needs_rehash(&self, hash: &str) -> bool {
        match parse_cost(hash) {
            Some(cost) => cost != self.cost,
            None => true,
        }
    }

    /// Get the minimum password length requirement
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }
}

/// Extract the cost factor from a modular-crypt bcrypt hash (`$2b$12$...`)
fn parse_cost(hash: &str) -> Option<u32> {
    let mut parts = hash.split('$');
    parts.next()?; // leading empty segment
    parts.next()?; // version
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_hasher() -> PasswordHasher {
        // Cost floor is 10; keep tests at the floor so they stay quick.
        PasswordHasher {
            cost: 10,
            min_password_length: 8,
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = fast_hasher();
        let hash = hasher.hash("correct horse battery").unwrap();

        assert!(hash.starts_with("$2"));
        assert!(hasher.verify("correct horse battery", &hash).unwrap());
        assert!(!hasher.verify("wrong password", &hash).unwrap());
    }

    #[test]
    fn test_short_password_rejected_at_boundary() {
        let hasher = fast_hasher();
        let result = hasher.hash("short");

        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_different_hashes_for_same_password() {
        let hasher = fast_hasher();
        let hash1 = hasher.hash("same password").unwrap();
        let hash2 = hasher.hash("same password").unwrap();

        assert_ne!(hash1, hash2);
        assert!(hasher.verify("same password", &hash1).unwrap());
        assert!(hasher.verify("same password", &hash2).unwrap());
    }

    #[test]
    fn test_needs_rehash_on_cost_change() {
        let hasher = fast_hasher();
        let hash = hasher.hash("some password").unwrap();
        assert!(!hasher.needs_rehash(&hash));

        let stronger = PasswordHasher {
            cost: 12,
            min_password_length: 8,
        };
        assert!(stronger.needs_rehash(&hash));
        assert!(stronger.needs_rehash("not a bcrypt hash"));
    }

    #[test]
    fn test_invalid_hash_is_an_error() {
        let hasher = fast_hasher();
        assert!(hasher.verify("password", "garbage").is_err());
    }
}
