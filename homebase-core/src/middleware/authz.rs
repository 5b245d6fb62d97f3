//! Authorization middleware
//!
//! Two flavors, mounted after authentication: the admin gate for the
//! `/api/admin` surface (`admin`, or `admin_viewer` on safe methods), and
//! the generic IAM policy check for everything else.

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};

use crate::auth::Principal;
use crate::error::Error;
use crate::middleware::authn::{client_ip, user_agent};
use crate::state::AuthKernel;

fn principal(request: &Request) -> Result<&Principal, Error> {
    request
        .extensions()
        .get::<Principal>()
        .ok_or_else(Error::no_authorization)
}

/// Gate for the admin surface
pub async fn require_admin(request: Request, next: Next) -> Result<Response, Error> {
    let principal = principal(&request)?;

    if principal.is_admin() {
        return Ok(next.run(request).await);
    }
    if principal.is_admin_viewer() {
        let safe = matches!(
            *request.method(),
            Method::GET | Method::HEAD | Method::OPTIONS
        );
        if safe {
            return Ok(next.run(request).await);
        }
        return Err(Error::Forbidden(
            "Write access requires full admin role".to_string(),
        ));
    }
    Err(Error::Forbidden("Admin access required".to_string()))
}

/// Generic route-level policy check
pub async fn check_policy(
    State(kernel): State<AuthKernel>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let principal = principal(&request)?.clone();
    let path = request.uri().path().to_string();
    let action = request.method().to_string();
    let headers = request.headers();
    let ip = client_ip(headers);
    let agent = user_agent(headers);

    if !kernel
        .iam()
        .check_permission(&principal, &path, &action, &ip, &agent)
        .await
    {
        return Err(Error::access_denied());
    }
    Ok(next.run(request).await)
}
