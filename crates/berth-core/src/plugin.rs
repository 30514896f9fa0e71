use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::DatabaseAdapter;
use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::credential::CredentialTokenService;
use crate::email::EmailProvider;
use crate::error::{ApiError, ApiResult};
use crate::provider::AuthProvider;
use crate::secret::SecretStore;
use crate::token::TokenService;
use crate::types::{ApiRequest, ApiResponse, HttpMethod, OrgRole, QuotaResource};

/// Who may reach a route. The dispatcher enforces this before the plugin
/// handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// No token required (auth endpoints, webhooks, health).
    Public,
    /// Valid access token required.
    User,
    /// Valid access token carrying at least one of these system roles.
    SystemRole(&'static [&'static str]),
}

/// Route definition declared by a plugin.
///
/// Patterns use `:name` segments (`/api/v1/orgs/:orgId/projects`). A pattern
/// containing `:orgId` triggers tenancy resolution; `org_role`, `quota`, and
/// `feature` attach the corresponding gates, all evaluated in the declared
/// middleware order before the handler.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: HttpMethod,
    pub pattern: String,
    pub operation_id: String,
    pub access: Access,
    pub rate_limited: bool,
    pub org_role: Option<OrgRole>,
    pub quota: Option<QuotaResource>,
    pub feature: Option<&'static str>,
}

impl Route {
    pub fn new(
        method: HttpMethod,
        pattern: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            operation_id: operation_id.into(),
            access: Access::User,
            rate_limited: false,
            org_role: None,
            quota: None,
            feature: None,
        }
    }

    pub fn get(pattern: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, pattern, operation_id)
    }

    pub fn post(pattern: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, pattern, operation_id)
    }

    pub fn put(pattern: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, pattern, operation_id)
    }

    pub fn delete(pattern: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, pattern, operation_id)
    }

    pub fn public(mut self) -> Self {
        self.access = Access::Public;
        self
    }

    pub fn system_roles(mut self, roles: &'static [&'static str]) -> Self {
        self.access = Access::SystemRole(roles);
        self
    }

    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }

    pub fn org_role(mut self, role: OrgRole) -> Self {
        self.org_role = Some(role);
        self
    }

    pub fn quota(mut self, resource: QuotaResource) -> Self {
        self.quota = Some(resource);
        self
    }

    pub fn feature(mut self, feature: &'static str) -> Self {
        self.feature = Some(feature);
        self
    }

    /// Whether this route needs tenancy resolution.
    pub fn is_org_scoped(&self) -> bool {
        self.pattern.contains(":orgId")
    }

    /// Match a concrete method + path against this route, returning captured
    /// path parameters on a hit.
    pub fn matches(&self, method: HttpMethod, path: &str) -> Option<HashMap<String, String>> {
        if self.method != method {
            return None;
        }
        match_path(&self.pattern, path)
    }
}

/// Match a `:param` pattern against a concrete path.
pub fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (pattern_seg, path_seg) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pattern_seg.strip_prefix(':') {
            if path_seg.is_empty() {
                return None;
            }
            params.insert(name.to_string(), (*path_seg).to_string());
        } else if pattern_seg != path_seg {
            return None;
        }
    }
    Some(params)
}

/// Shared services handed to every plugin handler.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub database: Arc<dyn DatabaseAdapter>,
    pub tokens: Arc<TokenService>,
    pub credentials: Arc<CredentialTokenService>,
    pub provider: Arc<dyn AuthProvider>,
    pub email: Option<Arc<dyn EmailProvider>>,
    pub secrets: Arc<dyn SecretStore>,
}

impl AppContext {
    /// The email provider, or a config error when none is wired.
    pub fn email_provider(&self) -> ApiResult<&dyn EmailProvider> {
        self.email
            .as_deref()
            .ok_or_else(|| ApiError::config("No email provider configured"))
    }
}

/// Plugin trait: a feature area that declares routes and handles matched
/// operations. The dispatcher resolves access, tenancy, and gating before
/// calling [`ApiPlugin::handle`].
#[async_trait]
pub trait ApiPlugin: Send + Sync {
    /// Plugin name, unique within the app.
    fn name(&self) -> &'static str;

    /// Routes this plugin serves.
    fn routes(&self) -> Vec<Route>;

    /// Handle a matched operation. `operation` is the `operation_id` of the
    /// matched route; `req.params` holds the captured path parameters.
    async fn handle(
        &self,
        operation: &str,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_exact_path() {
        assert!(match_path("/api/v1/orgs", "/api/v1/orgs").is_some());
        assert!(match_path("/api/v1/orgs", "/api/v1/users").is_none());
    }

    #[test]
    fn test_match_captures_params() {
        let params = match_path(
            "/api/v1/orgs/:orgId/projects/:projectId",
            "/api/v1/orgs/abc/projects/def",
        )
        .unwrap();
        assert_eq!(params["orgId"], "abc");
        assert_eq!(params["projectId"], "def");
    }

    #[test]
    fn test_match_rejects_length_mismatch() {
        assert!(match_path("/api/v1/orgs/:orgId", "/api/v1/orgs").is_none());
        assert!(match_path("/api/v1/orgs/:orgId", "/api/v1/orgs/a/b").is_none());
    }

    #[test]
    fn test_route_builder_flags() {
        let route = Route::post("/api/v1/orgs/:orgId/projects", "create_project")
            .org_role(OrgRole::Developer)
            .quota(QuotaResource::Projects);
        assert!(route.is_org_scoped());
        assert_eq!(route.org_role, Some(OrgRole::Developer));
        assert_eq!(route.quota, Some(QuotaResource::Projects));
        assert_eq!(route.access, Access::User);

        let public = Route::post("/api/v1/auth/login", "login").public().rate_limited();
        assert_eq!(public.access, Access::Public);
        assert!(public.rate_limited);
    }

    #[test]
    fn test_route_matches_method_and_path() {
        let route = Route::get("/api/v1/orgs/:orgId", "get_org");
        assert!(route.matches(HttpMethod::Get, "/api/v1/orgs/123").is_some());
        assert!(route.matches(HttpMethod::Post, "/api/v1/orgs/123").is_none());
    }
}
