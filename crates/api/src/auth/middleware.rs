//! Bearer authentication middleware

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use bulldogo_shared::AccountId;

use crate::{auth::jwt::JwtError, error::ApiError, state::AppState};

/// Authenticated account, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: AccountId,
    pub email: Option<String>,
}

/// Reject requests without a valid identity provider bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.validate_token(token).map_err(|e| {
        match &e {
            JwtError::Validation(msg) => tracing::warn!(error = %msg, "JWT validation error"),
            _ => tracing::debug!(error = %e, "Rejected bearer token"),
        }
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        account_id: AccountId::new(claims.sub),
        email: claims.email,
    });

    Ok(next.run(request).await)
}
