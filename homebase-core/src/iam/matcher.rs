//! Policy pattern matching
//!
//! The rule shape is fixed, so matching is implemented directly instead of
//! going through a policy DSL:
//!
//! - `*` matches anything
//! - a pattern ending in `*` matches every path with that prefix
//! - `:segment` matches exactly one non-empty path segment
//! - otherwise, exact match
//!
//! Actions match by equality, `*`, or pipe-separated alternation.

/// Match a rule object pattern against a request path
pub fn match_path(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    // A trailing run of stars is a prefix wildcard; `**` has no extra
    // recursion semantics beyond the prefix match.
    if pattern.ends_with('*') {
        let prefix = pattern.trim_end_matches('*');
        return path.starts_with(prefix);
    }

    if pattern.contains(':') {
        return match_segments(pattern, path);
    }

    pattern == path
}

fn match_segments(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();

    if pattern_segments.len() != path_segments.len() {
        return false;
    }

    pattern_segments
        .iter()
        .zip(&path_segments)
        .all(|(pat, seg)| {
            if let Some(name) = pat.strip_prefix(':') {
                !name.is_empty() && !seg.is_empty()
            } else {
                pat == seg
            }
        })
}

/// Match a rule action pattern against a request action
pub fn match_action(pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    pattern
        .split('|')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(action))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_everything() {
        assert!(match_path("*", "/"));
        assert!(match_path("*", "/api/admin/users"));
        assert!(match_path("*", ""));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(match_path("/api/admin/*", "/api/admin/users"));
        assert!(match_path("/api/admin/*", "/api/admin/users/42/roles"));
        assert!(match_path("/api/admin/*", "/api/admin/"));
        assert!(!match_path("/api/admin/*", "/api/storage/buckets"));
    }

    #[test]
    fn test_double_star_is_a_prefix_match_too() {
        assert!(match_path("/api/storage/**", "/api/storage/buckets/b/objects/1"));
        assert!(!match_path("/api/storage/**", "/api/admin/users"));
    }

    #[test]
    fn test_named_segment_matches_exactly_one() {
        assert!(match_path("/api/users/:id", "/api/users/42"));
        assert!(match_path(
            "/api/users/:id/profile",
            "/api/users/42/profile"
        ));
        assert!(!match_path("/api/users/:id", "/api/users"));
        assert!(!match_path("/api/users/:id", "/api/users/42/profile"));
        assert!(!match_path("/api/users/:id", "/api/users/"));
    }

    #[test]
    fn test_exact_match() {
        assert!(match_path("/api/settings", "/api/settings"));
        assert!(!match_path("/api/settings", "/api/settings/"));
        assert!(!match_path("/api/settings", "/api/settings/general"));
    }

    #[test]
    fn test_action_equality_and_star() {
        assert!(match_action("*", "GET"));
        assert!(match_action("GET", "GET"));
        assert!(match_action("get", "GET"));
        assert!(!match_action("GET", "POST"));
    }

    #[test]
    fn test_action_alternation() {
        assert!(match_action("GET|POST", "GET"));
        assert!(match_action("GET|POST", "POST"));
        assert!(!match_action("GET|POST", "DELETE"));
        assert!(match_action("GET | HEAD", "HEAD"));
    }
}
