pub mod api_keys;
pub mod auth;
pub mod error;
pub mod health;
pub mod usage;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
};
pub use error::ApiError;

use crate::{
    AppState,
    auth::{AuthError, Identity},
    middleware::{RequireRole, require_role},
    services::Services,
};

fn get_services(state: &AppState) -> Result<&Services, ApiError> {
    state.services.as_ref().ok_or(ApiError::DatabaseRequired)
}

/// User a request acts for: the caller, or `requested` when the caller is an admin.
fn acting_user(identity: &Identity, requested: Option<&str>) -> Result<String, ApiError> {
    match requested {
        Some(target) if target != identity.user_id => {
            if identity.is_admin() {
                Ok(target.to_string())
            } else {
                Err(AuthError::Forbidden(
                    "Only admins may act on behalf of another user".to_string(),
                )
                .into())
            }
        }
        _ => Ok(identity.user_id.clone()),
    }
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
}

/// `/api/v1` routes.
pub fn api_routes() -> Router<AppState> {
    let usage_admin = Router::new()
        .route("/quota/{user_id}", put(usage::update_quota))
        .route_layer(from_fn_with_state(RequireRole::admin(), require_role));

    let usage = Router::new()
        .route("/quota", get(usage::quota))
        .route("/summary", get(usage::summary))
        .route("/track", post(usage::track))
        .route("/check-quota", post(usage::check_quota))
        .route("/dashboard", get(usage::dashboard))
        .merge(usage_admin);

    let api_keys_internal = Router::new()
        .route("/{provider}/secret", get(api_keys::secret))
        .route_layer(from_fn_with_state(RequireRole::internal(), require_role));

    let api_keys = Router::new()
        .route("/", get(api_keys::list).post(api_keys::upsert))
        .route("/{provider}", delete(api_keys::delete))
        .route("/{provider}/permanent", delete(api_keys::hard_delete))
        .route("/{provider}/restore", post(api_keys::restore))
        .merge(api_keys_internal);

    Router::new()
        .route("/auth/refresh", post(auth::refresh))
        .nest("/usage", usage)
        .nest("/api-keys", api_keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: &str, roles: &[&str]) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            email: format!("{user_id}@example.com"),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_acting_user() {
        let user = identity("alice", &[]);
        let admin = identity("root", &["admin"]);

        assert_eq!(acting_user(&user, None).unwrap(), "alice");
        assert_eq!(acting_user(&user, Some("alice")).unwrap(), "alice");
        assert!(matches!(
            acting_user(&user, Some("bob")),
            Err(ApiError::Auth(AuthError::Forbidden(_)))
        ));
        assert_eq!(acting_user(&admin, Some("bob")).unwrap(), "bob");
    }
}
