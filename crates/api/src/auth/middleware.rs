//! Authentication middleware for Axum

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::jwt::JwtManager;

/// Cookie carrying the access token for browser clients
pub const AUTH_COOKIE: &str = "subledger_auth_token";

/// Authenticated user extracted from the access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub email: String,
}

/// Caller identity on routes behind `optional_auth`
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthUser>().cloned()))
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(str::to_owned)
        })
}

/// Extract bearer token from Authorization header or cookie
/// Prefers Authorization header but falls back to cookie for form posts
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            AuthError::InvalidToken
        })?;

    if claims.email.trim().is_empty() {
        return Err(AuthError::InvalidToken);
    }

    Ok(AuthUser {
        subject: claims.sub,
        email: claims.email.trim().to_ascii_lowercase(),
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate(&auth_state, &token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(path = %path, email = %auth_user.email, "require_auth: authentication successful");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that optionally authenticates (for public endpoints that benefit from auth)
pub async fn optional_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = extract_bearer_token(&request) {
        if let Ok(auth_user) = authenticate(&auth_state, &token) {
            request.extensions_mut().insert(auth_user);
        }
    }

    next.run(request).await
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        };

        let body = Json(json!({
            "error": message,
            "code": "unauthorized"
        }));

        (status, body).into_response()
    }
}
