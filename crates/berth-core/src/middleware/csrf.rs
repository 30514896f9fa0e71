use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use subtle::ConstantTimeEq;

use super::Middleware;
use crate::cookie::{SameSite, build_cookie};
use crate::error::{ApiError, ApiResult};
use crate::types::{ApiRequest, ApiResponse};

pub const CSRF_COOKIE_NAME: &str = "__csrf_token";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

const CSRF_TOKEN_BYTES: usize = 32;
const CSRF_COOKIE_MAX_AGE: i64 = 86400;

/// Double-submit cookie CSRF protection.
///
/// Every response carries a `__csrf_token` cookie (JS-readable, `Lax`,
/// `Secure` in production). State-changing requests must echo the cookie's
/// value in the `X-CSRF-Token` header; the server only compares the two, in
/// constant time. Safe methods are skipped, as are exempt path prefixes:
/// webhook endpoints are called by providers that cannot hold cookies and
/// are protected by payload signatures instead.
pub struct CsrfMiddleware {
    secure_cookie: bool,
    exempt_prefixes: Vec<String>,
}

impl CsrfMiddleware {
    pub fn new(secure_cookie: bool) -> Self {
        Self {
            secure_cookie,
            exempt_prefixes: Vec::new(),
        }
    }

    pub fn exempt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exempt_prefixes.push(prefix.into());
        self
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|p| path.starts_with(p))
    }
}

#[async_trait]
impl Middleware for CsrfMiddleware {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn before_request(&self, req: &ApiRequest) -> ApiResult<Option<ApiResponse>> {
        if req.method.is_safe() || self.is_exempt(&req.path) {
            return Ok(None);
        }

        let cookie_token = req.cookie(CSRF_COOKIE_NAME).unwrap_or_default();
        let header_token = req.header(CSRF_HEADER_NAME).unwrap_or_default();

        if cookie_token.is_empty() || header_token.is_empty() {
            return Err(ApiError::CsrfMismatch);
        }
        if cookie_token.as_bytes().ct_eq(header_token.as_bytes()).into() {
            Ok(None)
        } else {
            Err(ApiError::CsrfMismatch)
        }
    }

    async fn after_request(
        &self,
        req: &ApiRequest,
        response: ApiResponse,
    ) -> ApiResult<ApiResponse> {
        // Refresh the existing token or mint a fresh one on every response so
        // first-time visitors can make their first unsafe request.
        let token = req
            .cookie(CSRF_COOKIE_NAME)
            .unwrap_or_else(generate_csrf_token_string);
        Ok(response.with_cookie(build_cookie(
            CSRF_COOKIE_NAME,
            &token,
            CSRF_COOKIE_MAX_AGE,
            false, // readable by JS so the SPA can mirror it into the header
            self.secure_cookie,
            SameSite::Lax,
        )))
    }
}

fn generate_csrf_token_string() -> String {
    let mut bytes = [0u8; CSRF_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;

    fn post_with(cookie: Option<&str>, header: Option<&str>) -> ApiRequest {
        let mut req = ApiRequest::new(HttpMethod::Post, "/api/v1/auth/login");
        if let Some(c) = cookie {
            req.headers
                .insert("cookie".to_string(), format!("{}={}", CSRF_COOKIE_NAME, c));
        }
        if let Some(h) = header {
            req.headers
                .insert(CSRF_HEADER_NAME.to_string(), h.to_string());
        }
        req
    }

    #[tokio::test]
    async fn test_matching_tokens_pass() {
        let mw = CsrfMiddleware::new(false);
        let req = post_with(Some("tok123"), Some("tok123"));
        assert!(mw.before_request(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let mw = CsrfMiddleware::new(false);
        let req = post_with(Some("tok123"), None);
        match mw.before_request(&req).await {
            Err(ApiError::CsrfMismatch) => {}
            other => panic!("expected csrf mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_tokens_rejected() {
        let mw = CsrfMiddleware::new(false);
        let req = post_with(Some("tok123"), Some("tok456"));
        assert!(mw.before_request(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_cookie_rejected_even_with_header() {
        let mw = CsrfMiddleware::new(false);
        let req = post_with(None, Some("tok123"));
        assert!(mw.before_request(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_safe_methods_skip_validation() {
        let mw = CsrfMiddleware::new(false);
        let req = ApiRequest::new(HttpMethod::Get, "/healthz");
        assert!(mw.before_request(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cookie_set_on_every_response() {
        let mw = CsrfMiddleware::new(true);
        let req = ApiRequest::new(HttpMethod::Get, "/healthz");
        let response = mw
            .after_request(&req, ApiResponse::new(200))
            .await
            .unwrap();

        assert_eq!(response.cookies.len(), 1);
        let cookie = &response.cookies[0];
        assert!(cookie.starts_with(CSRF_COOKIE_NAME));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Secure"));
        assert!(!cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn test_exempt_prefix_skips_validation() {
        let mw = CsrfMiddleware::new(false).exempt_prefix("/api/v1/webhooks/");
        let req = ApiRequest::new(HttpMethod::Post, "/api/v1/webhooks/xendit");
        assert!(mw.before_request(&req).await.unwrap().is_none());

        let req = post_with(None, None);
        assert!(mw.before_request(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_existing_cookie_value_is_preserved() {
        let mw = CsrfMiddleware::new(false);
        let req = post_with(Some("keepme"), Some("keepme"));
        let response = mw
            .after_request(&req, ApiResponse::new(200))
            .await
            .unwrap();
        assert!(response.cookies[0].starts_with("__csrf_token=keepme"));
    }
}
