//! Admission chain run before every handler.
//!
//! Stages run in a fixed order and operate on a [`RequestContext`] that holds
//! only what they need from the request, so the chain can be driven without a
//! router or a socket. The first stage to reject stops the chain.

mod stages;

use std::net::IpAddr;

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};
pub use stages::{ForgeryGuardStage, QuotaAdmissionStage, RateLimitStage, TokenValidationStage};
use tower_cookies::Cookie;

use crate::{
    auth::{AuthError, Identity},
    middleware::{CsrfError, RateLimitError},
    models::RequestType,
    rate_limiter::RateLimitDecision,
    services::{QuotaError, QuotaReservation},
};

/// Stage identity. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageName {
    ForgeryGuard,
    RateLimit,
    TokenValidation,
    QuotaAdmission,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::ForgeryGuard => "forgery_guard",
            StageName::RateLimit => "rate_limit",
            StageName::TokenValidation => "token_validation",
            StageName::QuotaAdmission => "quota_admission",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request state visible to the stages.
///
/// Stages read the request fields and fill in the derived ones: the caller's
/// identity, the limiter decision, a quota reservation and cookies to set on
/// the response.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    /// Metered request family, if the path is metered at all
    pub request_type: Option<RequestType>,
    pub identity: Option<Identity>,
    pub rate_limit: Option<RateLimitDecision>,
    pub reservation: Option<QuotaReservation>,
    pub set_cookies: Vec<Cookie<'static>>,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, headers: HeaderMap) -> Self {
        let path = path.into();
        Self {
            request_type: RequestType::from_path(&path),
            method,
            path,
            headers,
            client_ip: None,
            identity: None,
            rate_limit: None,
            reservation: None,
            set_cookies: Vec::new(),
        }
    }

    pub fn with_client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Why a stage refused the request.
#[derive(Debug)]
pub enum Rejection {
    Csrf(CsrfError),
    RateLimited(RateLimitError),
    Auth(AuthError),
    Quota(QuotaError),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Csrf(e) => e.into_response(),
            Rejection::RateLimited(e) => e.into_response(),
            Rejection::Auth(e) => e.into_response(),
            Rejection::Quota(e) => e.into_response(),
        }
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    Continue,
    Reject(Rejection),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome;
}

/// Ordered chain of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Build a chain. Stages are sorted into their fixed order regardless of
    /// the order given.
    pub fn new(mut stages: Vec<Box<dyn Stage>>) -> Self {
        stages.sort_by_key(|stage| stage.name());
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage in order until one rejects.
    pub async fn evaluate(&self, ctx: &mut RequestContext) -> Result<(), (StageName, Rejection)> {
        for stage in &self.stages {
            if let StageOutcome::Reject(rejection) = stage.run(ctx).await {
                tracing::debug!(
                    stage = %stage.name(),
                    method = %ctx.method,
                    path = %ctx.path,
                    "Request rejected"
                );
                return Err((stage.name(), rejection));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct Recording {
        name: StageName,
        reject: bool,
        calls: Arc<AtomicUsize>,
        order: Arc<parking_lot::Mutex<Vec<StageName>>>,
    }

    #[async_trait]
    impl Stage for Recording {
        fn name(&self) -> StageName {
            self.name
        }

        async fn run(&self, _ctx: &mut RequestContext) -> StageOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(self.name);
            if self.reject {
                StageOutcome::Reject(Rejection::Auth(AuthError::InvalidToken))
            } else {
                StageOutcome::Continue
            }
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "/api/v1/chat", HeaderMap::new())
    }

    #[tokio::test]
    async fn test_stages_sorted_into_fixed_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stage = |name| -> Box<dyn Stage> {
            Box::new(Recording {
                name,
                reject: false,
                calls: Arc::clone(&calls),
                order: Arc::clone(&order),
            })
        };

        let pipeline = Pipeline::new(vec![
            stage(StageName::QuotaAdmission),
            stage(StageName::TokenValidation),
            stage(StageName::ForgeryGuard),
            stage(StageName::RateLimit),
        ]);
        assert_eq!(
            pipeline.stage_names(),
            vec![
                StageName::ForgeryGuard,
                StageName::RateLimit,
                StageName::TokenValidation,
                StageName::QuotaAdmission,
            ]
        );

        pipeline.evaluate(&mut ctx()).await.unwrap();
        assert_eq!(*order.lock(), pipeline.stage_names());
    }

    #[tokio::test]
    async fn test_rejection_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Box::new(Recording {
                name: StageName::RateLimit,
                reject: true,
                calls: Arc::clone(&calls),
                order: Arc::clone(&order),
            }),
            Box::new(Recording {
                name: StageName::QuotaAdmission,
                reject: false,
                calls: Arc::clone(&calls),
                order: Arc::clone(&order),
            }),
        ]);

        let (stage, rejection) = pipeline.evaluate(&mut ctx()).await.unwrap_err();
        assert_eq!(stage, StageName::RateLimit);
        assert!(matches!(rejection, Rejection::Auth(AuthError::InvalidToken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_context_classifies_path() {
        let ctx = RequestContext::new(Method::POST, "/api/v1/code/generate", HeaderMap::new());
        assert_eq!(ctx.request_type, Some(RequestType::CodeGeneration));
        let ctx = RequestContext::new(Method::GET, "/health", HeaderMap::new());
        assert_eq!(ctx.request_type, None);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(StageName::ForgeryGuard.to_string(), "forgery_guard");
        assert_eq!(StageName::QuotaAdmission.as_str(), "quota_admission");
    }
}
