//! Authentication middleware
//!
//! Accepts `Authorization: Bearer <jwt>` and inserts an [`AuthUser`] into the
//! request extensions for handlers to pick up with `Extension<AuthUser>`.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use myhealthguide_shared::UserId;
use serde_json::json;

use super::jwt::JwtManager;

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: Option<String>,
}

/// State the auth middleware needs
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => auth_state
            .jwt_manager
            .validate_token(token)
            .map_err(|e| {
                tracing::debug!(path = %path, error = %e, "require_auth: token rejected");
                AuthError::InvalidToken
            }),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(claims) => {
            let auth_user = AuthUser {
                user_id: UserId(claims.sub),
                email: claims.email,
            };
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
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
        let (code, message) = match self {
            AuthError::MissingAuth => ("UNAUTHORIZED", "Authentication required"),
            AuthError::InvalidToken => ("INVALID_TOKEN", "Invalid or expired token"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}
