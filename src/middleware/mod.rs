mod auth;
mod csrf;
mod gateway;
mod rate_limit;
mod recovery;
mod request_id;

pub use auth::{RequireAuth, RequireRole, require_role};
pub use csrf::{CsrfCheck, CsrfError, ForgeryGuard, generate_token};
pub use gateway::{
    MODEL_USED_HEADER, MeteredRequest, RESOURCE_ID_HEADER, TOKENS_INPUT_HEADER,
    TOKENS_OUTPUT_HEADER, UsageReport, gateway_middleware, is_metered_path,
};
pub use rate_limit::{RateLimitError, add_rate_limit_headers, extract_client_ip_from_parts};
pub use recovery::panic_response;
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
