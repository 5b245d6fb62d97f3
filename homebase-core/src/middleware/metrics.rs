//! Request metrics middleware
//!
//! Records latency, count, and response size per
//! `(route template, method, status)` in an in-process registry. The admin
//! stats endpoint serves snapshots of this registry.

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Instant;

use crate::state::AuthKernel;

/// Key for one route/method/status series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    route: String,
    method: String,
    status: u16,
}

#[derive(Debug, Default, Clone)]
struct SeriesStats {
    count: u64,
    total_millis: u64,
    max_millis: u64,
    response_bytes: u64,
}

/// One series in a metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsEntry {
    pub route: String,
    pub method: String,
    pub status: u16,
    pub count: u64,
    pub total_millis: u64,
    pub mean_millis: f64,
    pub max_millis: u64,
    pub response_bytes: u64,
}

/// In-process metrics registry
#[derive(Default)]
pub struct MetricsRegistry {
    series: DashMap<SeriesKey, SeriesStats>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, route: &str, method: &str, status: u16, millis: u64, bytes: u64) {
        let key = SeriesKey {
            route: route.to_string(),
            method: method.to_string(),
            status,
        };
        let mut stats = self.series.entry(key).or_default();
        stats.count += 1;
        stats.total_millis += millis;
        stats.max_millis = stats.max_millis.max(millis);
        stats.response_bytes += bytes;
    }

    /// Snapshot of every series, sorted by count descending
    pub fn snapshot(&self) -> Vec<MetricsEntry> {
        let mut entries: Vec<MetricsEntry> = self
            .series
            .iter()
            .map(|entry| {
                let key = entry.key();
                let stats = entry.value();
                MetricsEntry {
                    route: key.route.clone(),
                    method: key.method.clone(),
                    status: key.status,
                    count: stats.count,
                    total_millis: stats.total_millis,
                    mean_millis: if stats.count > 0 {
                        stats.total_millis as f64 / stats.count as f64
                    } else {
                        0.0
                    },
                    max_millis: stats.max_millis,
                    response_bytes: stats.response_bytes,
                }
            })
            .collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count));
        entries
    }

    /// Total request count across all series
    pub fn total_requests(&self) -> u64 {
        self.series.iter().map(|entry| entry.value().count).sum()
    }
}

/// Middleware recording one sample per request
pub async fn track_metrics(State(kernel): State<AuthKernel>, request: Request, next: Next) -> Response {
    // Prefer the route template so IDs don't explode the cardinality.
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let millis = start.elapsed().as_millis() as u64;

    let bytes = response
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    kernel
        .metrics()
        .record(&route, &method, response.status().as_u16(), millis, bytes);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_aggregates_by_series() {
        let registry = MetricsRegistry::new();
        registry.record("/api/storage/quota", "GET", 200, 3, 120);
        registry.record("/api/storage/quota", "GET", 200, 5, 120);
        registry.record("/api/storage/quota", "GET", 403, 1, 40);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);

        let ok = snapshot
            .iter()
            .find(|e| e.status == 200)
            .expect("200 series");
        assert_eq!(ok.count, 2);
        assert_eq!(ok.total_millis, 8);
        assert_eq!(ok.max_millis, 5);
        assert!((ok.mean_millis - 4.0).abs() < f64::EPSILON);
        assert_eq!(ok.response_bytes, 240);

        assert_eq!(registry.total_requests(), 3);
    }
}
