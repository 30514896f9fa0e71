use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use uuid::Uuid;

use berth_api::featuregate::{GateService, seed_default_plans};
use berth_api::plugins::{
    AuthPlugin, BillingPlugin, OAuthPlugin, OrgsPlugin, ProjectsPlugin, UsersPlugin,
};
use berth_api::provider::{ExternalIdpProvider, IdpWebhookPlugin, LocalProvider};
use berth_core::adapters::{DatabaseAdapter, MemoryDatabaseAdapter};
use berth_core::config::{AppConfig, AuthProviderKind};
use berth_core::context::{OrgScope, RequestContext};
use berth_core::credential::CredentialTokenService;
use berth_core::email::EmailProvider;
use berth_core::error::{ApiError, ApiResult};
use berth_core::middleware::{
    self, CorsMiddleware, CsrfMiddleware, Middleware, RateLimitMiddleware,
    SecurityHeadersMiddleware,
};
use berth_core::plugin::{Access, ApiPlugin, AppContext, Route};
use berth_core::provider::AuthProvider;
use berth_core::secret::{PlaintextSecretStore, SecretStore};
use berth_core::token::TokenService;
use berth_core::types::{ApiRequest, ApiResponse};

const DEV_FALLBACK_SECRET: &str = "dev-secret-change-in-production";

/// The assembled control plane: shared services, registered plugins, the
/// middleware chain, and a flattened routing table.
pub struct App {
    context: AppContext,
    gate: GateService,
    plugins: Vec<Box<dyn ApiPlugin>>,
    middlewares: Vec<Box<dyn Middleware>>,
    /// `(plugin index, route)` pairs, in registration order.
    routes: Vec<(usize, Route)>,
}

/// Builder wiring configuration, persistence, and optional providers into
/// an [`App`].
pub struct AppBuilder {
    config: AppConfig,
    database: Option<Arc<dyn DatabaseAdapter>>,
    email: Option<Arc<dyn EmailProvider>>,
    secrets: Option<Arc<dyn SecretStore>>,
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            database: None,
            email: None,
            secrets: None,
        }
    }

    pub fn database(mut self, database: Arc<dyn DatabaseAdapter>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn email(mut self, email: Arc<dyn EmailProvider>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub async fn build(self) -> ApiResult<App> {
        let mut config = self.config;
        config.validate()?;
        if config.jwt.secret.is_empty() {
            tracing::warn!("JWT_SECRET is not set; using the development fallback secret");
            config.jwt.secret = DEV_FALLBACK_SECRET.to_string();
        }
        let config = Arc::new(config);

        let database = self
            .database
            .unwrap_or_else(|| Arc::new(MemoryDatabaseAdapter::new()));

        let tokens = Arc::new(TokenService::new(
            config.jwt.secret.clone(),
            config.jwt.access_token_ttl,
            config.jwt.refresh_token_ttl,
            database.clone(),
        ));
        let credentials = Arc::new(CredentialTokenService::new(database.clone()));

        let provider: Arc<dyn AuthProvider> = match config.auth_provider {
            AuthProviderKind::Local => {
                Arc::new(LocalProvider::new(database.clone(), tokens.clone()))
            }
            AuthProviderKind::External => {
                Arc::new(ExternalIdpProvider::new(config.external_idp.clone()))
            }
        };

        seed_default_plans(database.as_ref()).await?;

        let context = AppContext {
            config: config.clone(),
            database: database.clone(),
            tokens,
            credentials,
            provider,
            email: self.email,
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(PlaintextSecretStore)),
        };

        let plugins: Vec<Box<dyn ApiPlugin>> = vec![
            Box::new(AuthPlugin),
            Box::new(UsersPlugin),
            Box::new(OrgsPlugin),
            Box::new(ProjectsPlugin),
            Box::new(BillingPlugin),
            Box::new(OAuthPlugin::from_config(&config)),
            Box::new(IdpWebhookPlugin),
        ];

        let mut routes = Vec::new();
        for (index, plugin) in plugins.iter().enumerate() {
            for route in plugin.routes() {
                routes.push((index, route));
            }
        }

        let rate_limited_paths: Vec<String> = routes
            .iter()
            .filter(|(_, route)| route.rate_limited)
            .map(|(_, route)| route.pattern.clone())
            .collect();
        let rate_limiter =
            RateLimitMiddleware::new(config.rate_limit.clone(), rate_limited_paths);
        rate_limiter.spawn_sweeper();

        let middlewares: Vec<Box<dyn Middleware>> = vec![
            Box::new(SecurityHeadersMiddleware),
            Box::new(CorsMiddleware::new(config.cors.clone())),
            Box::new(
                CsrfMiddleware::new(config.environment.is_production())
                    .exempt_prefix("/api/v1/webhooks/"),
            ),
            Box::new(rate_limiter),
        ];

        Ok(App {
            gate: GateService::new(database),
            context,
            plugins,
            middlewares,
            routes,
        })
    }
}

impl App {
    pub fn builder(config: AppConfig) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Handle one request through the full pipeline. Never fails: panics and
    /// errors alike are rendered as structured envelopes, and the request is
    /// logged on the way out.
    pub async fn handle_request(&self, mut req: ApiRequest) -> ApiResponse {
        let start = Instant::now();
        let request_id = req
            .header("x-request-id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut rctx = RequestContext::new(request_id.clone());
        let path = req.path.clone();

        // Recovery: a panicking handler becomes a 500 envelope, never a
        // dropped connection.
        let outcome = AssertUnwindSafe(self.dispatch(&mut req, &mut rctx))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                if err.status_code() >= 500 {
                    tracing::error!(request_id = %request_id, error = %err, "request failed");
                }
                err.into_response(&path, &request_id)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(request_id = %request_id, panic = %message, path = %path, "panic recovered");
                ApiError::internal("panic recovered").into_response(&path, &request_id)
            }
        };

        // Decoration middleware still runs for error envelopes, so security
        // headers, CORS, and the CSRF cookie are always present.
        let mut response = match middleware::run_after(&self.middlewares, &req, response).await {
            Ok(response) => response,
            Err(err) => err.into_response(&path, &request_id),
        };
        response
            .headers
            .insert("X-Request-ID".to_string(), request_id.clone());

        let status = response.status;
        let duration_ms = start.elapsed().as_millis();
        let method = req.method.as_str();
        let ip = req.client_ip();
        if status >= 500 {
            tracing::error!(%method, %path, status, duration_ms, %ip, %request_id, "request");
        } else if status >= 400 {
            tracing::warn!(%method, %path, status, duration_ms, %ip, %request_id, "request");
        } else {
            tracing::info!(%method, %path, status, duration_ms, %ip, %request_id, "request");
        }

        response
    }

    async fn dispatch(
        &self,
        req: &mut ApiRequest,
        rctx: &mut RequestContext,
    ) -> ApiResult<ApiResponse> {
        use berth_core::types::HttpMethod;

        // Health endpoints bypass the chain so probes never trip CSRF or
        // rate limits.
        if req.method == HttpMethod::Get && req.path == "/healthz" {
            return berth_core::error::success(200, &serde_json::json!({ "status": "ok" }));
        }
        if req.method == HttpMethod::Get && req.path == "/readyz" {
            self.context.database.ping().await?;
            return berth_core::error::success(200, &serde_json::json!({ "status": "ready" }));
        }

        if let Some(response) = middleware::run_before(&self.middlewares, req).await? {
            return Ok(response);
        }

        let Some((plugin_index, route, params)) = self.match_route(req) else {
            return Err(ApiError::not_found("No handler found for this request"));
        };
        req.params = params;

        // JWTAuth: bearer header first, cookie fallback.
        match route.access {
            Access::Public => {}
            Access::User => self.authenticate(req, rctx)?,
            Access::SystemRole(required) => {
                self.authenticate(req, rctx)?;
                let claims = rctx.claims()?;
                if !required.iter().any(|role| claims.has_role(role)) {
                    return Err(ApiError::forbidden("Insufficient permissions"));
                }
            }
        }

        // OrgResolver: membership is the only thing that grants visibility
        // into a tenant, so a miss is 403 and never reveals existence.
        if route.is_org_scoped() {
            let org_id = req.uuid_param("orgId")?;
            let user_id = rctx.user_id()?;
            let membership = self
                .context
                .database
                .get_membership(org_id, user_id)
                .await?
                .ok_or_else(|| {
                    ApiError::forbidden("You are not a member of this organization")
                })?;
            rctx.org = Some(OrgScope {
                org_id,
                membership_id: membership.id,
                role: membership.role,
            });
        }

        if let Some(required) = route.org_role {
            let role = rctx.org()?.role;
            if !role.has_permission(required) {
                return Err(ApiError::forbidden(format!(
                    "Requires {} role or higher",
                    required
                )));
            }
        }

        if let Some(resource) = route.quota {
            self.gate.check_quota(rctx.org()?.org_id, resource).await?;
        }
        if let Some(feature) = route.feature {
            self.gate
                .require_feature(rctx.org()?.org_id, feature)
                .await?;
        }

        self.plugins[plugin_index]
            .handle(&route.operation_id, req, rctx, &self.context)
            .await
    }

    fn match_route(
        &self,
        req: &ApiRequest,
    ) -> Option<(usize, &Route, std::collections::HashMap<String, String>)> {
        for (plugin_index, route) in &self.routes {
            if let Some(params) = route.matches(req.method, &req.path) {
                return Some((*plugin_index, route, params));
            }
        }
        None
    }

    fn authenticate(&self, req: &ApiRequest, rctx: &mut RequestContext) -> ApiResult<()> {
        let token = req
            .bearer_token()
            .or_else(|| req.cookie("access_token"))
            .ok_or(ApiError::Unauthenticated)?;
        let claims = self.context.provider.validate_token(&token)?;
        rctx.claims = Some(claims);
        Ok(())
    }
}
