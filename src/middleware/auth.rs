//! Route guards over the [`Identity`] the gateway middleware attaches.
//!
//! Token validation itself happens in the pipeline and lets anonymous
//! requests through. Routes that need a caller use [`RequireAuth`] as an
//! extractor; routes that need a role are wrapped with [`require_role`].

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

use crate::auth::{AuthError, Identity, ROLE_ADMIN, ROLE_INTERNAL};

/// Extractor that fails with 401 `UNAUTHORIZED` for anonymous requests.
#[derive(Debug, Clone)]
pub struct RequireAuth(pub Identity);

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(RequireAuth)
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Roles any one of which admits a request.
#[derive(Debug, Clone, Copy)]
pub struct RequireRole {
    roles: &'static [&'static str],
}

impl RequireRole {
    pub const fn any_of(roles: &'static [&'static str]) -> Self {
        Self { roles }
    }

    pub const fn admin() -> Self {
        Self::any_of(&[ROLE_ADMIN])
    }

    /// Service-to-service callers, or an admin acting for them.
    pub const fn internal() -> Self {
        Self::any_of(&[ROLE_INTERNAL, ROLE_ADMIN])
    }

    pub fn check(&self, identity: Option<&Identity>) -> Result<(), AuthError> {
        let identity = identity.ok_or(AuthError::Unauthenticated)?;
        if identity.has_any_role(self.roles) {
            Ok(())
        } else {
            tracing::debug!(
                user_id = %identity.user_id,
                required = ?self.roles,
                "Caller lacks required role"
            );
            Err(AuthError::Forbidden(format!(
                "Requires one of the roles: {}",
                self.roles.join(", ")
            )))
        }
    }
}

/// Middleware form of [`RequireRole`], for `route_layer(from_fn_with_state(..))`.
pub async fn require_role(
    State(guard): State<RequireRole>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    guard.check(req.extensions().get::<Identity>())?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::get,
    };
    use tower::ServiceExt;

    use super::*;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            user_id: "user-1".to_string(),
            email: "u@example.com".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    async fn whoami(RequireAuth(identity): RequireAuth) -> String {
        identity.user_id
    }

    async fn call(app: Router, identity: Option<Identity>) -> StatusCode {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        if let Some(identity) = identity {
            req.extensions_mut().insert(identity);
        }
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn test_role_checks() {
        let admin = identity(&["admin"]);
        let internal = identity(&["internal"]);
        let user = identity(&["user"]);

        assert!(RequireRole::admin().check(Some(&admin)).is_ok());
        assert!(matches!(
            RequireRole::admin().check(Some(&internal)),
            Err(AuthError::Forbidden(_))
        ));
        assert!(RequireRole::internal().check(Some(&internal)).is_ok());
        assert!(RequireRole::internal().check(Some(&admin)).is_ok());
        assert!(RequireRole::internal().check(Some(&user)).is_err());
        assert!(matches!(
            RequireRole::admin().check(None),
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_require_auth_extractor() {
        let app = Router::new().route("/", get(whoami));
        assert_eq!(call(app.clone(), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(call(app, Some(identity(&[]))).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_require_role_layer() {
        let app = Router::new()
            .route("/", get(whoami))
            .route_layer(from_fn_with_state(RequireRole::admin(), require_role));

        assert_eq!(call(app.clone(), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            call(app.clone(), Some(identity(&["user"]))).await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(call(app, Some(identity(&["admin"]))).await, StatusCode::OK);
    }
}
