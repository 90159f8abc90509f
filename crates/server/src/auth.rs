//! Authentication and authorization middleware.

use crate::error::{ApiResult, ErrorCode, RegistryError};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;
use wharf_core::token::Claims;

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    /// Verified token claims. `sub` is the username, `jti` the session id.
    pub claims: Claims,
    /// Row id of the owning user.
    pub user_id: Uuid,
}

/// Extract a bearer token from the Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Token verification middleware.
///
/// Verifies the signature and expiry, then confirms the session still
/// exists and its owner is active. A valid token yields an
/// [`AuthenticatedUser`] extension; anything else passes through
/// unauthenticated and the ACL decides whether that matters.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, RegistryError> {
    if let Some(token) = extract_bearer_token(&req)
        && let Ok(claims) = state.signer.verify(token)
    {
        match state.metadata.get_user_with_session(claims.jti).await {
            Ok(user) if user.username == claims.sub => {
                req.extensions_mut().insert(AuthenticatedUser {
                    claims,
                    user_id: user.id,
                });
            }
            Ok(_) | Err(wharf_metadata::MetadataError::NotFound(_)) => {
                tracing::debug!(session_id = %claims.jti, "token references a dead session");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(next.run(req).await)
}

/// Access control for registry routes.
///
/// `GET` and `HEAD` are always allowed. Any other method requires a token
/// whose subject equals the `<username>` path parameter.
pub async fn acl_middleware(
    params: axum::extract::RawPathParams,
    req: Request,
    next: Next,
) -> Result<Response, RegistryError> {
    if req.method() == Method::GET || req.method() == Method::HEAD {
        return Ok(next.run(req).await);
    }

    let Some(auth) = req.extensions().get::<AuthenticatedUser>() else {
        return Err(RegistryError::unauthorized(
            "authentication required for mutating requests",
        ));
    };

    let username = params
        .iter()
        .find(|(name, _)| *name == "username")
        .map(|(_, value)| value);

    match username {
        Some(username) if username == auth.claims.sub => Ok(next.run(req).await),
        Some(_) => Err(RegistryError::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized,
            "token subject does not own this namespace",
        )),
        // No username parameter means a non-repository route slipped in
        // under the ACL; nothing to authorize against.
        None => Err(RegistryError::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Denied,
            "mutating requests are not allowed on this route",
        )),
    }
}

/// Require authentication in a handler.
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| RegistryError::unauthorized("authentication required"))
}
