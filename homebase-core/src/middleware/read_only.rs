//! Read-only mode gate
//!
//! When the platform is in read-only mode every non-safe request is
//! rejected, except the three auth paths users need to keep (or end) a
//! session.

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};

use crate::error::Error;
use crate::state::AuthKernel;

/// Paths writable even in read-only mode
const ALLOWED_WRITE_PATHS: [&str; 3] = ["/auth/login", "/auth/logout", "/auth/refresh"];

pub async fn read_only_gate(
    State(kernel): State<AuthKernel>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if kernel.is_read_only() {
        let method = request.method();
        let safe = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
        let allowed = ALLOWED_WRITE_PATHS.contains(&request.uri().path());
        if !safe && !allowed {
            return Err(Error::Forbidden("Server is in read-only mode".to_string()));
        }
    }
    Ok(next.run(request).await)
}
