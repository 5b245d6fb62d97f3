//! Middleware pipeline
//!
//! Fixed stage order, outermost first: security headers, read-only gate,
//! CORS, metrics, rate limit, authentication, then the route-scoped
//! admin/IAM authorization. Extensions may not re-order stages; they hook
//! in only at the named hook points of the hook bus.

pub mod authn;
pub mod authz;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod read_only;
pub mod security_headers;

pub use authn::{authenticate, extract_credential, AUTH_COOKIE};
pub use authz::{check_policy, require_admin};
pub use cors::cors_layer;
pub use metrics::{MetricsEntry, MetricsRegistry};
pub use rate_limit::{rate_limit, RateLimiter};
pub use read_only::read_only_gate;
pub use security_headers::apply_security_headers;
