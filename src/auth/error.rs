use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{api_types::ErrorResponse, observability::metrics};

#[derive(Debug, Error)]
pub enum AuthError {
    /// No token on a route that requires one
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("Authentication token has expired")]
    ExpiredToken,

    /// Authenticated but lacking a required role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated => "UNAUTHORIZED",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::ExpiredToken => "TOKEN_EXPIRED",
            AuthError::Forbidden(_) => "FORBIDDEN",
            AuthError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthenticated | AuthError::InvalidToken | AuthError::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated | AuthError::InvalidToken | AuthError::ExpiredToken => {
                "authentication_error"
            }
            AuthError::Forbidden(_) => "permission_error",
            AuthError::Internal(_) => "server_error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (code, error_type) = (self.code(), self.error_type());
        let message = match &self {
            AuthError::Forbidden(reason) => reason.clone(),
            AuthError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal authentication error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        metrics::record_gateway_error(error_type, code);

        (
            self.status(),
            Json(ErrorResponse::with_type(error_type, code, message)),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(AuthError::ExpiredToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::ExpiredToken.error_type(), "authentication_error");
        assert_eq!(
            AuthError::Forbidden("admin only".into()).error_type(),
            "permission_error"
        );
        assert_eq!(AuthError::Internal("x".into()).code(), "internal_error");
    }
}
