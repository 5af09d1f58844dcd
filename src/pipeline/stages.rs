use std::sync::Arc;

use async_trait::async_trait;

use super::{Rejection, RequestContext, Stage, StageName, StageOutcome};
use crate::{
    auth::{Identity, TokenValidator, cookie_value, extract_token},
    middleware::{ForgeryGuard, RateLimitError},
    observability::metrics,
    pricing::DEFAULT_MODEL,
    rate_limiter::RateLimiter,
    services::QuotaService,
};

/// Header a client may send with its expected token usage.
pub const ESTIMATED_TOKENS_HEADER: &str = "X-Estimated-Tokens";
/// Header naming the model the request will use.
pub const MODEL_HEADER: &str = "X-Model";

/// Bucket key for requests whose client address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

pub struct ForgeryGuardStage {
    guard: ForgeryGuard,
}

impl ForgeryGuardStage {
    pub fn new(guard: ForgeryGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Stage for ForgeryGuardStage {
    fn name(&self) -> StageName {
        StageName::ForgeryGuard
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        let cookie = cookie_value(&ctx.headers, self.guard.cookie_name());
        let check = self.guard.check(
            &ctx.method,
            &ctx.path,
            cookie.as_deref(),
            ctx.header(self.guard.header_name()),
        );

        if let Some(cookie) = check.set_cookie {
            ctx.set_cookies.push(cookie);
        }
        match check.outcome {
            Ok(()) => StageOutcome::Continue,
            Err(e) => StageOutcome::Reject(Rejection::Csrf(e)),
        }
    }
}

/// Throttles by client IP.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> StageName {
        StageName::RateLimit
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        let key = ctx
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

        let decision = self.limiter.allow(&key);
        metrics::record_rate_limit(decision.allowed);
        ctx.rate_limit = Some(decision);

        if decision.allowed {
            StageOutcome::Continue
        } else {
            tracing::debug!(client = %key, retry_after = decision.retry_after_secs, "Rate limited");
            StageOutcome::Reject(Rejection::RateLimited(RateLimitError::from(decision)))
        }
    }
}

/// Verifies a bearer token when one is supplied. Requests without a token
/// continue anonymously; routes that need a caller enforce it themselves.
pub struct TokenValidationStage {
    validator: Arc<TokenValidator>,
    cookie_name: String,
}

impl TokenValidationStage {
    pub fn new(validator: Arc<TokenValidator>, cookie_name: impl Into<String>) -> Self {
        Self {
            validator,
            cookie_name: cookie_name.into(),
        }
    }
}

#[async_trait]
impl Stage for TokenValidationStage {
    fn name(&self) -> StageName {
        StageName::TokenValidation
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        let Some(token) = extract_token(&ctx.headers, &self.cookie_name) else {
            return StageOutcome::Continue;
        };

        match self.validator.validate(&token) {
            Ok(claims) => {
                ctx.identity = Some(Identity::from(claims));
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Reject(Rejection::Auth(e)),
        }
    }
}

/// Reserves estimated usage for authenticated requests to metered paths.
pub struct QuotaAdmissionStage {
    quotas: Arc<QuotaService>,
    default_estimate_tokens: i64,
}

impl QuotaAdmissionStage {
    pub fn new(quotas: Arc<QuotaService>, default_estimate_tokens: i64) -> Self {
        Self {
            quotas,
            default_estimate_tokens,
        }
    }

    fn estimate(&self, ctx: &RequestContext) -> i64 {
        ctx.header(ESTIMATED_TOKENS_HEADER)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|tokens| *tokens > 0)
            .unwrap_or(self.default_estimate_tokens)
    }
}

#[async_trait]
impl Stage for QuotaAdmissionStage {
    fn name(&self) -> StageName {
        StageName::QuotaAdmission
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        if ctx.request_type.is_none() {
            return StageOutcome::Continue;
        }
        let Some(user_id) = ctx.identity.as_ref().map(|i| i.user_id.clone()) else {
            return StageOutcome::Continue;
        };

        let tokens = self.estimate(ctx);
        let model = ctx
            .header(MODEL_HEADER)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
            .to_string();

        match self.quotas.reserve(&user_id, tokens, &model).await {
            Ok(reservation) => {
                ctx.reservation = Some(reservation);
                StageOutcome::Continue
            }
            Err(e) => StageOutcome::Reject(Rejection::Quota(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, time::Duration};

    use axum::http::{HeaderMap, HeaderValue, Method, header};

    use super::*;
    use crate::{
        auth::{AuthError, TokenIssuer},
        config::{CsrfConfig, JwtConfig},
        middleware::CsrfError,
        pipeline::Pipeline,
        rate_limiter::BucketLimits,
    };

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            secret: "0123456789abcdef0123456789abcdef".to_string(),
            ..Default::default()
        }
    }

    fn request(method: Method, path: &str, pairs: &[(&str, &str)]) -> RequestContext {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestContext::new(method, path, headers)
    }

    #[tokio::test]
    async fn test_forgery_guard_stage() {
        let stage = ForgeryGuardStage::new(ForgeryGuard::new(CsrfConfig::default()));

        let mut ok = request(
            Method::POST,
            "/api/v1/chat",
            &[("cookie", "_csrf=abc123"), ("X-CSRF-Token", "abc123")],
        );
        assert!(matches!(stage.run(&mut ok).await, StageOutcome::Continue));
        assert!(ok.set_cookies.is_empty());

        let mut bad = request(
            Method::POST,
            "/api/v1/chat",
            &[("cookie", "_csrf=abc123"), ("X-CSRF-Token", "abc124")],
        );
        assert!(matches!(
            stage.run(&mut bad).await,
            StageOutcome::Reject(Rejection::Csrf(CsrfError::Invalid))
        ));

        let mut fresh = request(Method::GET, "/api/v1/chat", &[]);
        assert!(matches!(stage.run(&mut fresh).await, StageOutcome::Continue));
        assert_eq!(fresh.set_cookies.len(), 1);
        assert_eq!(fresh.set_cookies[0].name(), "_csrf");
    }

    #[tokio::test]
    async fn test_rate_limit_stage_per_ip() {
        let limiter = Arc::new(RateLimiter::new(
            BucketLimits {
                rate: 0.001,
                burst: 2,
            },
            100,
            Duration::from_secs(60),
        ));
        let stage = RateLimitStage::new(limiter);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..2 {
            let mut ctx = request(Method::GET, "/", &[]).with_client_ip(Some(ip));
            assert!(matches!(stage.run(&mut ctx).await, StageOutcome::Continue));
        }
        let mut ctx = request(Method::GET, "/", &[]).with_client_ip(Some(ip));
        assert!(matches!(
            stage.run(&mut ctx).await,
            StageOutcome::Reject(Rejection::RateLimited(_))
        ));
        assert_eq!(ctx.rate_limit.map(|d| d.remaining), Some(0));

        let other: IpAddr = "203.0.113.10".parse().unwrap();
        let mut ctx = request(Method::GET, "/", &[]).with_client_ip(Some(other));
        assert!(matches!(stage.run(&mut ctx).await, StageOutcome::Continue));
    }

    #[tokio::test]
    async fn test_token_validation_stage() {
        let config = jwt_config();
        let stage = TokenValidationStage::new(Arc::new(TokenValidator::new(&config)), "auth_token");
        let token = TokenIssuer::new(&config)
            .issue("user-1", "u@example.com", &["admin".to_string()])
            .unwrap();

        let mut anonymous = request(Method::GET, "/api/v1/chat", &[]);
        assert!(matches!(stage.run(&mut anonymous).await, StageOutcome::Continue));
        assert!(anonymous.identity.is_none());

        let bearer = format!("Bearer {token}");
        let mut authed = request(Method::GET, "/api/v1/chat", &[("authorization", &bearer)]);
        assert!(matches!(stage.run(&mut authed).await, StageOutcome::Continue));
        let identity = authed.identity.unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.roles, vec!["admin"]);

        let cookie = format!("auth_token={token}");
        let mut from_cookie = request(Method::GET, "/api/v1/chat", &[("cookie", &cookie)]);
        assert!(matches!(stage.run(&mut from_cookie).await, StageOutcome::Continue));
        assert!(from_cookie.identity.is_some());

        let mut invalid = request(Method::GET, "/", &[("authorization", "Bearer not-a-jwt")]);
        assert!(matches!(
            stage.run(&mut invalid).await,
            StageOutcome::Reject(Rejection::Auth(AuthError::InvalidToken))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_by_chain() {
        let config = jwt_config();
        let token = TokenIssuer::new(&config)
            .issue_with_ttl("user-1", "u@example.com", &[], -3600)
            .unwrap();
        let pipeline = Pipeline::new(vec![Box::new(TokenValidationStage::new(
            Arc::new(TokenValidator::new(&config)),
            "auth_token",
        ))]);

        let bearer = format!("Bearer {token}");
        let mut ctx = request(Method::GET, "/api/v1/chat", &[("authorization", &bearer)]);
        let (stage, rejection) = pipeline.evaluate(&mut ctx).await.unwrap_err();
        assert_eq!(stage, StageName::TokenValidation);
        assert!(matches!(rejection, Rejection::Auth(AuthError::ExpiredToken)));
    }

    #[cfg(feature = "database-sqlite")]
    mod quota {
        use super::*;
        use crate::{
            db::tests::harness::create_sqlite_db,
            models::QuotaLimits,
            pricing::PricingTable,
            services::QuotaError,
        };

        async fn stage(limits: QuotaLimits) -> QuotaAdmissionStage {
            let db = Arc::new(create_sqlite_db().await);
            let quotas = Arc::new(QuotaService::new(db, PricingTable::default(), limits));
            QuotaAdmissionStage::new(quotas, 4000)
        }

        fn identity() -> Identity {
            Identity {
                user_id: "user-1".to_string(),
                email: "u@example.com".to_string(),
                roles: vec![],
            }
        }

        #[tokio::test]
        async fn test_reserves_default_estimate() {
            let stage = stage(QuotaLimits::default()).await;
            let mut ctx = request(Method::POST, "/api/v1/chat", &[]);
            ctx.identity = Some(identity());

            assert!(matches!(stage.run(&mut ctx).await, StageOutcome::Continue));
            assert_eq!(ctx.reservation.as_ref().unwrap().amount().tokens, 4000);
        }

        #[tokio::test]
        async fn test_estimate_header_and_denial() {
            let stage = stage(QuotaLimits {
                daily_token_limit: 1_000,
                ..QuotaLimits::default()
            })
            .await;

            let mut small = request(
                Method::POST,
                "/api/v1/chat",
                &[("X-Estimated-Tokens", "500"), ("X-Model", "gpt-4")],
            );
            small.identity = Some(identity());
            assert!(matches!(stage.run(&mut small).await, StageOutcome::Continue));

            // Default estimate of 4000 does not fit
            let mut big = request(Method::POST, "/api/v1/chat", &[]);
            big.identity = Some(identity());
            assert!(matches!(
                stage.run(&mut big).await,
                StageOutcome::Reject(Rejection::Quota(QuotaError::Exceeded))
            ));
        }

        #[tokio::test]
        async fn test_skips_anonymous_and_unmetered() {
            let stage = stage(QuotaLimits {
                daily_token_limit: 0,
                ..QuotaLimits::default()
            })
            .await;

            let mut anonymous = request(Method::POST, "/api/v1/chat", &[]);
            assert!(matches!(stage.run(&mut anonymous).await, StageOutcome::Continue));

            let mut unmetered = request(Method::GET, "/api/v1/usage/quota", &[]);
            unmetered.identity = Some(identity());
            assert!(matches!(stage.run(&mut unmetered).await, StageOutcome::Continue));
            assert!(unmetered.reservation.is_none());
        }
    }
}
