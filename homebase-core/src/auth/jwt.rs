//! HMAC-signed bearer token encode/verify
//!
//! Compact three-segment tokens (HS256). The signing secret is loaded once at
//! start-up and is the single source of trust; verification rejects expired
//! tokens, bad signatures, and unexpected header algorithms.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Access token claims
///
/// Wire names are part of the platform API contract and must stay stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject user id
    #[serde(rename = "userId")]
    pub user_id: Uuid,

    /// Subject email
    pub email: String,

    /// Role names at issue time
    #[serde(default)]
    pub roles: Vec<String>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Check if the claims carry a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Token encoder/verifier bound to the process-wide signing secret
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_lifetime_secs: i64,
}

impl TokenCodec {
    /// Create a codec from the signing secret and access-token lifetime
    ///
    /// The caller guarantees a non-empty secret (config validation is fatal
    /// on an empty one).
    pub fn new(secret: &str, access_lifetime_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is a hard boundary; no clock leeway.
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_lifetime_secs,
        }
    }

    /// Issue an access token for a user
    pub fn issue(&self, user_id: Uuid, email: &str, roles: Vec<String>) -> Result<(String, Claims)> {
        self.issue_with_lifetime(user_id, email, roles, self.access_lifetime_secs)
    }

    /// Issue a token with an explicit lifetime in seconds
    pub fn issue_with_lifetime(
        &self,
        user_id: Uuid,
        email: &str,
        roles: Vec<String>,
        lifetime_secs: i64,
    ) -> Result<(String, Claims)> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id,
            email: email.to_string(),
            roles,
            iat: now,
            exp: now + lifetime_secs,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok((token, claims))
    }

    /// Verify a token and return its claims
    ///
    /// Fails on bad signature, expiry, malformed input, or a header that
    /// names any algorithm other than HS256.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| Error::invalid_token())
    }

    /// Access token lifetime in seconds
    pub fn access_lifetime_secs(&self) -> i64 {
        self.access_lifetime_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("unit-test-secret", 3600)
    }

    #[test]
    fn test_issue_then_verify_round_trips_claims() {
        let codec = codec();
        let user_id = Uuid::new_v4();
        let (token, issued) = codec
            .issue(user_id, "u@example.com", vec!["user".to_string()])
            .unwrap();

        let verified = codec.verify(&token).unwrap();
        assert_eq!(verified, issued);
        assert_eq!(verified.user_id, user_id);
        assert!(verified.has_role("user"));
        assert!(!verified.has_role("admin"));
    }

    #[test]
    fn test_wire_names_are_stable() {
        let claims = Claims {
            user_id: Uuid::nil(),
            email: "u@example.com".to_string(),
            roles: vec!["user".to_string()],
            iat: 1,
            exp: 2,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("email").is_some());
        assert!(json.get("roles").is_some());
        assert!(json.get("iat").is_some());
        assert!(json.get("exp").is_some());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let codec = codec();
        let (token, _) = codec
            .issue(Uuid::new_v4(), "u@example.com", vec![])
            .unwrap();

        // Flip one character in every segment in turn.
        for (i, _) in token.char_indices() {
            if token.as_bytes()[i] == b'.' {
                continue;
            }
            let mut tampered = token.clone().into_bytes();
            tampered[i] = if tampered[i] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(tampered).unwrap();
            if tampered == token {
                continue;
            }
            assert!(codec.verify(&tampered).is_err(), "byte {} accepted", i);
        }
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let codec = codec();
        let (token, _) = codec
            .issue_with_lifetime(Uuid::new_v4(), "u@example.com", vec![], -1)
            .unwrap();

        assert!(matches!(
            codec.verify(&token),
            Err(Error::Unauthorized(msg)) if msg == "Invalid token"
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let codec = codec();
        let other = TokenCodec::new("another-secret", 3600);
        let (token, _) = codec
            .issue(Uuid::new_v4(), "u@example.com", vec![])
            .unwrap();

        assert!(other.verify(&token).is_err());
    }
}
