//! In-memory sliding-window rate limiting
//!
//! Counters are keyed on the authenticated principal when one is known,
//! otherwise on the client IP. The window is the classic two-bucket sliding
//! approximation: the previous window's count is weighted by how much of it
//! still overlaps the sliding window. Expensive endpoints get a stricter
//! bucket. A background task sweeps idle keys every minute.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::Principal;
use crate::config::RateLimitConfig;
use crate::error::Error;
use crate::state::AuthKernel;

#[derive(Debug, Clone, Copy)]
struct Window {
    /// Start of the current fixed window, as an offset from the limiter epoch
    window_index: u64,
    current: u32,
    previous: u32,
    last_seen: Instant,
}

/// Sliding-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    fn limit_for(&self, path: &str) -> u32 {
        if self
            .config
            .strict_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            self.config.strict_requests_per_window
        } else {
            self.config.requests_per_window
        }
    }

    /// Record one hit for `key`; `false` means the limit is exhausted
    pub fn check(&self, key: &str, path: &str) -> bool {
        let limit = self.limit_for(path);
        let now = Instant::now();
        let elapsed = now.duration_since(self.epoch).as_secs();
        let window_secs = self.config.window_secs.max(1);
        let window_index = elapsed / window_secs;
        let offset_in_window = (elapsed % window_secs) as f64 / window_secs as f64;

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            window_index,
            current: 0,
            previous: 0,
            last_seen: now,
        });

        if entry.window_index != window_index {
            entry.previous = if entry.window_index + 1 == window_index {
                entry.current
            } else {
                0
            };
            entry.current = 0;
            entry.window_index = window_index;
        }
        entry.last_seen = now;

        let weighted =
            entry.current as f64 + entry.previous as f64 * (1.0 - offset_in_window);
        if weighted >= limit as f64 {
            return false;
        }
        entry.current += 1;
        true
    }

    /// Drop keys idle for more than two windows
    pub fn sweep(&self) {
        let idle = Duration::from_secs(self.config.window_secs.max(1) * 2);
        let now = Instant::now();
        self.windows
            .retain(|_, window| now.duration_since(window.last_seen) < idle);
    }

    /// Spawn the minute sweeper
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Rate-limit key: principal when known, client IP otherwise
fn client_key(request: &Request) -> String {
    if let Some(principal) = request.extensions().get::<Principal>() {
        return format!("user:{}", principal.id);
    }
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown");
    format!("ip:{}", ip)
}

pub async fn rate_limit(
    State(kernel): State<AuthKernel>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let key = client_key(&request);
    let path = request.uri().path().to_string();
    if !kernel.rate_limiter().check(&key, &path) {
        tracing::warn!(key = %key, path = %path, "rate limit exceeded");
        return Err(Error::RateLimitExceeded);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_window: requests,
            window_secs,
            strict_requests_per_window: 2,
            strict_prefixes: vec!["/api/admin/logs/export".to_string()],
        })
    }

    #[test]
    fn test_limit_enforced_within_window() {
        let limiter = limiter(3, 60);
        assert!(limiter.check("ip:1.2.3.4", "/api/storage/quota"));
        assert!(limiter.check("ip:1.2.3.4", "/api/storage/quota"));
        assert!(limiter.check("ip:1.2.3.4", "/api/storage/quota"));
        assert!(!limiter.check("ip:1.2.3.4", "/api/storage/quota"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.check("ip:1.2.3.4", "/"));
        assert!(!limiter.check("ip:1.2.3.4", "/"));
        assert!(limiter.check("ip:5.6.7.8", "/"));
        assert!(limiter.check("user:abc", "/"));
    }

    #[test]
    fn test_strict_bucket_for_expensive_routes() {
        let limiter = limiter(100, 60);
        assert!(limiter.check("ip:1.2.3.4", "/api/admin/logs/export"));
        assert!(limiter.check("ip:1.2.3.4", "/api/admin/logs/export"));
        assert!(!limiter.check("ip:1.2.3.4", "/api/admin/logs/export"));
        // The default bucket is unaffected.
        assert!(limiter.check("ip:1.2.3.4", "/api/storage/quota"));
    }

    #[test]
    fn test_sweep_drops_idle_keys() {
        let limiter = limiter(5, 0);
        // window_secs is clamped to 1; idle cutoff is 2 s, nothing sleeps
        // that long here, so this just proves sweep keeps live keys.
        assert!(limiter.check("ip:1.2.3.4", "/"));
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
