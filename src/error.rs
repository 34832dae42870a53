use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::{
    auth::{jwt::TokenError, revocation::RevocationError},
    cache::CacheError,
    store::StoreError,
};

/// Failure outcomes of session and profile operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredential,

    #[error("too many login attempts, try again later")]
    RateLimited,

    #[error("email already registered")]
    DuplicateIdentity,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token")]
    TokenInvalid,

    #[error("refresh token does not match this device")]
    TokenMismatch,

    #[error("session not found")]
    SessionNotFound,

    #[error("revocation link has expired")]
    ExpiredRevocationLink,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    ValidationFailed(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AuthError::NotFound,
            StoreError::Duplicate => AuthError::DuplicateIdentity,
            other => AuthError::Store(other),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Expired => AuthError::TokenExpired,
            TokenError::Invalid => AuthError::TokenInvalid,
        }
    }
}

impl From<RevocationError> for AuthError {
    fn from(e: RevocationError) -> Self {
        match e {
            RevocationError::Malformed | RevocationError::Forged => AuthError::TokenInvalid,
            RevocationError::Seal => AuthError::Internal(anyhow::anyhow!(e)),
        }
    }
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredential
            | AuthError::TokenExpired
            | AuthError::TokenInvalid
            | AuthError::TokenMismatch
            | AuthError::SessionNotFound
            | AuthError::ExpiredRevocationLink => StatusCode::UNAUTHORIZED,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::DuplicateIdentity => StatusCode::CONFLICT,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            AuthError::Store(_) | AuthError::Cache(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            // internals stay in the log
            error!(error = %self, "request failed");
            return (status, "internal server error".to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_domain_errors() {
        assert!(matches!(AuthError::from(StoreError::NotFound), AuthError::NotFound));
        assert!(matches!(
            AuthError::from(StoreError::Duplicate),
            AuthError::DuplicateIdentity
        ));
    }

    #[test]
    fn statuses() {
        assert_eq!(AuthError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AuthError::TokenMismatch.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::ValidationFailed("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AuthError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let res = AuthError::Internal(anyhow::anyhow!("db password is hunter2")).into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
