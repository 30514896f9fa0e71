//! OAuth identity federation: authorization-code flow with a state cookie,
//! find-or-create-or-link on callback, and token hand-off to the SPA via the
//! URL fragment.

pub mod providers;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use subtle::ConstantTimeEq;

use berth_core::config::AppConfig;
use berth_core::context::RequestContext;
use berth_core::cookie::{SameSite, build_cookie, clear_cookie};
use berth_core::error::{ApiError, ApiResult};
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{ApiRequest, ApiResponse, CreateOAuthAccount, CreateUser, ROLE_USER, User};

use providers::{OAuthUserInfo, ProviderSpec, pick_email};

pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
const STATE_COOKIE_TTL_SECS: i64 = 300;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OAuthPlugin {
    providers: HashMap<&'static str, ProviderSpec>,
    client: reqwest::Client,
}

impl OAuthPlugin {
    /// Build the plugin from configuration; disabled providers are absent.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut providers = HashMap::new();
        if config.oauth.google.enabled {
            providers.insert(
                "google",
                ProviderSpec::google(
                    config.oauth.google.client_id.clone(),
                    config.oauth.google.client_secret.clone(),
                ),
            );
        }
        if config.oauth.github.enabled {
            providers.insert(
                "github",
                ProviderSpec::github(
                    config.oauth.github.client_id.clone(),
                    config.oauth.github.client_secret.clone(),
                ),
            );
        }
        Self {
            providers,
            client: reqwest::Client::builder()
                .timeout(EXCHANGE_TIMEOUT)
                .user_agent("berth-control-plane")
                .build()
                .expect("reqwest client"),
        }
    }

    fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.get(name)
    }

    fn redirect_uri(&self, ctx: &AppContext, provider: &str) -> String {
        format!(
            "{}/api/v1/auth/oauth/{}/callback",
            ctx.config.public_base_url, provider
        )
    }

    /// Error hand-off to the SPA. OAuth failures redirect rather than render
    /// JSON because the user is mid-browser-flow.
    fn redirect_error(&self, ctx: &AppContext, code: &str, message: &str) -> ApiResponse {
        ApiResponse::redirect(format!(
            "{}/auth/oauth/callback?error={}&error_description={}",
            ctx.config.oauth.frontend_url,
            urlencoding::encode(code),
            urlencoding::encode(message),
        ))
        .with_cookie(clear_cookie(OAUTH_STATE_COOKIE))
    }
}

#[async_trait]
impl ApiPlugin for OAuthPlugin {
    fn name(&self) -> &'static str {
        "oauth"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::get("/api/v1/auth/oauth/:provider", "oauth_initiate").public(),
            Route::get("/api/v1/auth/oauth/:provider/callback", "oauth_callback").public(),
        ]
    }

    async fn handle(
        &self,
        operation: &str,
        req: &ApiRequest,
        _rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        match operation {
            "oauth_initiate" => self.handle_initiate(req, ctx).await,
            "oauth_callback" => self.handle_callback(req, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl OAuthPlugin {
    async fn handle_initiate(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let provider_name = req
            .param("provider")
            .ok_or_else(|| ApiError::bad_request("Missing provider parameter"))?;
        let provider = self.provider(provider_name).ok_or_else(|| {
            ApiError::bad_request(format!("Unsupported provider: {}", provider_name))
        })?;

        let mut state_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = URL_SAFE.encode(state_bytes);

        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            provider.auth_url,
            urlencoding::encode(&provider.client_id),
            urlencoding::encode(&self.redirect_uri(ctx, provider.name)),
            urlencoding::encode(&provider.scopes.join(" ")),
            urlencoding::encode(&state),
        );
        for (key, value) in provider.extra_auth_params {
            url.push_str(&format!("&{}={}", key, value));
        }

        Ok(ApiResponse::redirect(url).with_cookie(build_cookie(
            OAUTH_STATE_COOKIE,
            &state,
            STATE_COOKIE_TTL_SECS,
            true, // HttpOnly: the state never needs to reach JS
            req.is_tls(),
            SameSite::Lax,
        )))
    }

    async fn handle_callback(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let provider_name = req
            .param("provider")
            .ok_or_else(|| ApiError::bad_request("Missing provider parameter"))?
            .to_string();
        let Some(provider) = self.provider(&provider_name) else {
            return Ok(self.redirect_error(
                ctx,
                "unsupported_provider",
                &format!("Unsupported provider: {}", provider_name),
            ));
        };

        // State must match the cookie exactly; everything else is a CSRF or
        // truncated flow.
        let query_state = req.query.get("state").cloned().unwrap_or_default();
        let cookie_state = req.cookie(OAUTH_STATE_COOKIE).unwrap_or_default();
        let state_ok = !query_state.is_empty()
            && bool::from(query_state.as_bytes().ct_eq(cookie_state.as_bytes()));
        if !state_ok {
            return Ok(self.redirect_error(ctx, "invalid_state", "Invalid or missing state token"));
        }

        if let Some(error) = req.query.get("error") {
            let description = req
                .query
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| "OAuth authorization was denied".to_string());
            return Ok(self.redirect_error(ctx, error, &description));
        }

        let Some(code) = req.query.get("code").filter(|c| !c.is_empty()) else {
            return Ok(self.redirect_error(ctx, "missing_code", "Authorization code is missing"));
        };

        let user_info = match self.exchange_code(ctx, provider, code).await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(provider = %provider_name, error = %err, "oauth code exchange failed");
                return Ok(self.redirect_error(
                    ctx,
                    "exchange_failed",
                    "Failed to exchange authorization code",
                ));
            }
        };

        if user_info.email.is_empty() {
            return Ok(self.redirect_error(
                ctx,
                "no_email",
                "No email address was provided by the OAuth provider",
            ));
        }

        let (user, roles) =
            match find_or_create_user(ctx, &provider_name, &user_info).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(provider = %provider_name, error = %err, "oauth user linking failed");
                    return Ok(self.redirect_error(
                        ctx,
                        "user_error",
                        "Failed to create or link user account",
                    ));
                }
            };

        let pair = ctx
            .tokens
            .issue_pair(user.id, &user.email, &user.name, roles)
            .await?;

        // Tokens travel in the fragment so they never hit server logs or
        // Referer headers.
        let redirect = format!(
            "{}/auth/oauth/callback#access_token={}&refresh_token={}&token_type={}&expires_in={}",
            ctx.config.oauth.frontend_url,
            pair.access_token,
            pair.refresh_token,
            pair.token_type,
            pair.expires_in,
        );
        Ok(ApiResponse::redirect(redirect).with_cookie(clear_cookie(OAUTH_STATE_COOKIE)))
    }

    async fn exchange_code(
        &self,
        ctx: &AppContext,
        provider: &ProviderSpec,
        code: &str,
    ) -> ApiResult<OAuthUserInfo> {
        let response = self
            .client
            .post(provider.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", &self.redirect_uri(ctx, provider.name)),
            ])
            .send()
            .await
            .map_err(|e| ApiError::internal(format!("Token exchange request failed: {}", e)))?;

        let token_body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::internal(format!("Token exchange parse failed: {}", e)))?;
        let access_token = token_body["access_token"]
            .as_str()
            .ok_or_else(|| ApiError::internal("Token exchange returned no access token"))?;

        let profile: serde_json::Value = self
            .client
            .get(provider.user_info_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ApiError::internal(format!("Profile request failed: {}", e)))?
            .json()
            .await
            .map_err(|e| ApiError::internal(format!("Profile parse failed: {}", e)))?;

        let mut info = (provider.map_user_info)(&profile)
            .ok_or_else(|| ApiError::internal("Profile response missing required fields"))?;

        if info.email.is_empty() {
            if let Some(emails_url) = provider.emails_url {
                let entries: serde_json::Value = self
                    .client
                    .get(emails_url)
                    .bearer_auth(access_token)
                    .send()
                    .await
                    .map_err(|e| ApiError::internal(format!("Email listing failed: {}", e)))?
                    .json()
                    .await
                    .map_err(|e| ApiError::internal(format!("Email listing parse failed: {}", e)))?;
                if let Some(email) = pick_email(&entries) {
                    info.email = email;
                }
            }
        }

        Ok(info)
    }
}

/// Find-or-create-or-link for a federated identity.
///
/// An existing `(provider, provider_id)` link wins; otherwise a matching
/// email auto-links (the provider already verified it); otherwise a fresh
/// principal is created with no password and the default role.
pub async fn find_or_create_user(
    ctx: &AppContext,
    provider: &str,
    info: &OAuthUserInfo,
) -> ApiResult<(User, Vec<String>)> {
    if let Some(account) = ctx.database.get_oauth_account(provider, &info.id).await? {
        let user = ctx
            .database
            .get_user_by_id(account.user_id)
            .await?
            .ok_or_else(|| ApiError::internal("OAuth account references a missing user"))?;
        let roles = ctx.database.get_user_roles(user.id).await?;
        return Ok((user, roles));
    }

    if let Some(mut user) = ctx.database.get_user_by_email(&info.email).await? {
        ctx.database
            .create_oauth_account(CreateOAuthAccount {
                user_id: user.id,
                provider: provider.to_string(),
                provider_id: info.id.clone(),
                email: info.email.clone(),
                avatar_url: info.avatar_url.clone(),
            })
            .await?;

        if !user.email_verified {
            ctx.database.set_email_verified(user.id, true).await?;
            user.email_verified = true;
        }
        if user.avatar_url.is_none() {
            if let Some(avatar_url) = &info.avatar_url {
                ctx.database.set_avatar_url(user.id, avatar_url).await?;
                user.avatar_url = Some(avatar_url.clone());
            }
        }

        let roles = ctx.database.get_user_roles(user.id).await?;
        tracing::info!(%provider, email = %info.email, "oauth account auto-linked to existing user");
        return Ok((user, roles));
    }

    let user = ctx
        .database
        .create_user_with_role(
            CreateUser {
                name: info.name.clone(),
                email: info.email.clone(),
                password_hash: String::new(),
                avatar_url: info.avatar_url.clone(),
                email_verified: true,
                ..CreateUser::default()
            },
            ROLE_USER,
        )
        .await?;
    ctx.database
        .create_oauth_account(CreateOAuthAccount {
            user_id: user.id,
            provider: provider.to_string(),
            provider_id: info.id.clone(),
            email: info.email.clone(),
            avatar_url: info.avatar_url.clone(),
        })
        .await?;

    tracing::info!(%provider, email = %info.email, user_id = %user.id, "new user created via oauth");
    Ok((user, vec![ROLE_USER.to_string()]))
}
