use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::provider::Claims;
use crate::types::OrgRole;

/// Tenant scope attached to the request after the org resolver has verified
/// membership.
#[derive(Debug, Clone)]
pub struct OrgScope {
    pub org_id: Uuid,
    pub membership_id: Uuid,
    pub role: OrgRole,
}

/// Per-request state produced by the middleware pipeline and consumed by
/// handlers: request id, verified claims, and resolved tenant scope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub claims: Option<Claims>,
    pub org: Option<OrgScope>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            claims: None,
            org: None,
        }
    }

    /// Verified claims, or `UNAUTHORIZED` when the route reached a handler
    /// without passing token validation.
    pub fn claims(&self) -> ApiResult<&Claims> {
        self.claims.as_ref().ok_or(ApiError::Unauthenticated)
    }

    /// Authenticated principal id.
    pub fn user_id(&self) -> ApiResult<Uuid> {
        Ok(self.claims()?.user_id)
    }

    /// Resolved tenant scope, or `FORBIDDEN` when missing.
    pub fn org(&self) -> ApiResult<&OrgScope> {
        self.org
            .as_ref()
            .ok_or_else(|| ApiError::forbidden("Org context not resolved"))
    }
}
