pub mod cors;
pub mod csrf;
pub mod rate_limit;
pub mod security_headers;

use async_trait::async_trait;

use crate::error::ApiResult;
use crate::types::{ApiRequest, ApiResponse};

/// Middleware trait for request/response processing.
///
/// `before_request` runs outermost-first and may short-circuit with a
/// response; `after_request` runs in reverse order and may decorate the
/// response (headers, cookies). Both see every request, including those that
/// ended in an error envelope.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Human-readable name for logging / debugging.
    fn name(&self) -> &'static str;

    /// Return `Ok(Some(response))` to short-circuit, `Ok(None)` to continue.
    /// Returning `Err` aborts with a structured error envelope.
    async fn before_request(&self, req: &ApiRequest) -> ApiResult<Option<ApiResponse>>;

    /// Decorate the outgoing response. Default is a pass-through.
    async fn after_request(
        &self,
        _req: &ApiRequest,
        response: ApiResponse,
    ) -> ApiResult<ApiResponse> {
        Ok(response)
    }
}

/// Run the before-request chain in declared order.
pub async fn run_before(
    middlewares: &[Box<dyn Middleware>],
    req: &ApiRequest,
) -> ApiResult<Option<ApiResponse>> {
    for mw in middlewares {
        if let Some(response) = mw.before_request(req).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

/// Run the after-request chain in reverse order.
pub async fn run_after(
    middlewares: &[Box<dyn Middleware>],
    req: &ApiRequest,
    mut response: ApiResponse,
) -> ApiResult<ApiResponse> {
    for mw in middlewares.iter().rev() {
        response = mw.after_request(req, response).await?;
    }
    Ok(response)
}

pub use cors::CorsMiddleware;
pub use csrf::CsrfMiddleware;
pub use rate_limit::{MemoryRateLimitStore, RateLimitDecision, RateLimitMiddleware, RateLimitStore};
pub use security_headers::SecurityHeadersMiddleware;
