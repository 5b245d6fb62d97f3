//! OAuth CSRF state, carried in a short-lived cookie
//!
//! The state value is 256 bits of randomness stored client-side in an
//! `HttpOnly; SameSite=Lax` cookie for at most ten minutes; the callback
//! compares the returned `state` query parameter against it.

use crate::auth::api_keys::random_urlsafe_token;
use crate::error::{Error, Result};

/// Cookie holding the pending state value
pub const STATE_COOKIE: &str = "oauth_state";

/// State cookie lifetime in seconds
pub const STATE_TTL_SECS: u64 = 600;

/// Generate a fresh state value
pub fn generate_state() -> String {
    random_urlsafe_token()
}

/// `Set-Cookie` value storing the state for the callback
pub fn state_cookie(state: &str) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/auth/oauth; HttpOnly; SameSite=Lax",
        STATE_COOKIE, state, STATE_TTL_SECS
    )
}

/// `Set-Cookie` value clearing the state cookie after the callback
pub fn clear_state_cookie() -> String {
    format!("{}=; Max-Age=0; Path=/auth/oauth; HttpOnly; SameSite=Lax", STATE_COOKIE)
}

/// Verify that the returned state matches the cookie value
pub fn verify_state(cookie_value: Option<&str>, returned: &str) -> Result<()> {
    match cookie_value {
        Some(expected) if !returned.is_empty() && expected == returned => Ok(()),
        _ => Err(Error::BadRequest(
            "Invalid or expired OAuth state".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_uniqueness_and_length() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn test_verify_state() {
        let state = generate_state();
        assert!(verify_state(Some(&state), &state).is_ok());
        assert!(verify_state(Some(&state), "other").is_err());
        assert!(verify_state(None, &state).is_err());
        assert!(verify_state(Some(""), "").is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = state_cookie("abc");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=600"));
    }
}
