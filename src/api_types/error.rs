use serde::{Deserialize, Serialize};

/// JSON body for every rejection the gateway produces.
///
/// ```json
/// {"error": {"type": "rate_limit_error", "message": "...", "param": null, "code": "QUOTA_EXCEEDED"}}
/// ```
///
/// `type` is the coarse class a client switches on; `code` is the precise
/// reason. `request_id` is filled in on the way out by the request ID
/// middleware.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub param: Option<String>,
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// `error_type` is one of `authentication_error`, `permission_error`,
    /// `invalid_request_error`, `not_found_error`, `rate_limit_error` or
    /// `server_error`.
    pub fn with_type(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorInfo {
                error_type: error_type.into(),
                message: message.into(),
                param: None,
                code: Some(code.into()),
                request_id: None,
            },
        }
    }
}
