use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    api_types::ErrorResponse,
    auth::AuthError,
    db::DbError,
    observability::metrics,
    services::{CredentialError, QUOTA_EXCEEDED_MESSAGE, QuotaError},
};

/// Error returned by route handlers.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Validation(String),
    BadRequest(String),
    /// The route needs the database and none is configured
    DatabaseRequired,
    Auth(AuthError),
    QuotaExceeded,
    Database(DbError),
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => ApiError::NotFound("Resource not found".to_string()),
            DbError::NotConfigured => ApiError::DatabaseRequired,
            _ => ApiError::Database(err),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded => ApiError::QuotaExceeded,
            QuotaError::Database(db) => db.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotFound => {
                ApiError::NotFound("Provider credential not found".to_string())
            }
            CredentialError::Cipher(e) => {
                tracing::error!(error = %e, "Provider credential integrity failure");
                ApiError::Internal("An internal error occurred".to_string())
            }
            CredentialError::Database(db) => db.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match self {
            ApiError::Auth(err) => return err.into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found_error", "not_found", msg),
            ApiError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "validation_error",
                msg,
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                msg,
            ),
            ApiError::DatabaseRequired => (
                StatusCode::NOT_IMPLEMENTED,
                "server_error",
                "feature_not_available",
                "This endpoint requires a database. Configure [database] to enable it.".to_string(),
            ),
            ApiError::QuotaExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "QUOTA_EXCEEDED",
                QUOTA_EXCEEDED_MESSAGE.to_string(),
            ),
            ApiError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "database_error",
                    "An internal database error occurred".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        metrics::record_gateway_error(error_type, code);

        (status, Json(ErrorResponse::with_type(error_type, code, message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::CipherError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(DbError::NotFound), StatusCode::NOT_FOUND),
            (ApiError::from(DbError::NotConfigured), StatusCode::NOT_IMPLEMENTED),
            (ApiError::from(QuotaError::Exceeded), StatusCode::TOO_MANY_REQUESTS),
            (
                ApiError::from(CredentialError::NotFound),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(CredentialError::Cipher(CipherError::Authentication)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(AuthError::Forbidden("no".into())),
                StatusCode::FORBIDDEN,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
