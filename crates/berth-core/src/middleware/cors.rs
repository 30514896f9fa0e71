use async_trait::async_trait;

use super::Middleware;
use crate::config::CorsConfig;
use crate::error::ApiResult;
use crate::types::{ApiRequest, ApiResponse, HttpMethod};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization, X-Requested-With, X-CSRF-Token, X-Request-ID";

/// CORS middleware.
///
/// Reflects the request `Origin` only when it is in the configured
/// allow-list (exact match, or the wildcard `*`). Preflight OPTIONS requests
/// short-circuit with 204. `X-Request-ID` is always exposed so clients can
/// correlate error envelopes with server logs.
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    fn is_origin_allowed(&self, origin: &str) -> bool {
        self.config
            .allowed_origins
            .iter()
            .any(|o| o == "*" || o == origin)
    }

    fn apply_headers(&self, origin: &str, response: &mut ApiResponse) {
        response
            .headers
            .insert("Access-Control-Allow-Origin".to_string(), origin.to_string());
        response.headers.insert(
            "Access-Control-Allow-Methods".to_string(),
            ALLOWED_METHODS.to_string(),
        );
        response.headers.insert(
            "Access-Control-Allow-Headers".to_string(),
            ALLOWED_HEADERS.to_string(),
        );
        response.headers.insert(
            "Access-Control-Expose-Headers".to_string(),
            "X-Request-ID".to_string(),
        );
        if self.config.allow_credentials {
            response.headers.insert(
                "Access-Control-Allow-Credentials".to_string(),
                "true".to_string(),
            );
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn before_request(&self, req: &ApiRequest) -> ApiResult<Option<ApiResponse>> {
        let origin = match req.header("origin") {
            Some(o) => o.to_string(),
            None => return Ok(None),
        };

        // Preflight short-circuits regardless of origin; headers are only
        // reflected for allowed origins.
        if req.method == HttpMethod::Options {
            let mut response = ApiResponse::new(204);
            if self.is_origin_allowed(&origin) {
                self.apply_headers(&origin, &mut response);
                response.headers.insert(
                    "Access-Control-Max-Age".to_string(),
                    self.config.max_age.to_string(),
                );
            }
            return Ok(Some(response));
        }

        Ok(None)
    }

    async fn after_request(
        &self,
        req: &ApiRequest,
        mut response: ApiResponse,
    ) -> ApiResult<ApiResponse> {
        if let Some(origin) = req.header("origin") {
            if self.is_origin_allowed(origin) {
                let origin = origin.to_string();
                self.apply_headers(&origin, &mut response);
            }
        }
        Ok(response)
    }
}
