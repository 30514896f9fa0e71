//! Credential endpoints: register, login, refresh rotation, logout, email
//! verification, and password reset.

use async_trait::async_trait;
use serde::Deserialize;
use validator::Validate;

use berth_core::context::RequestContext;
use berth_core::error::{self, ApiError, ApiResult, validate_body};
use berth_core::password;
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::provider::{LoginRequest, RegisterRequest};
use berth_core::types::{ApiRequest, ApiResponse, TokenPurpose};

use crate::email as templates;

#[derive(Debug, Deserialize, Validate)]
struct RefreshRequest {
    #[validate(length(min = 1, message = "refresh_token is required"))]
    refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
struct VerifyEmailRequest {
    #[validate(length(min = 1, message = "token is required"))]
    token: String,
}

#[derive(Debug, Deserialize, Validate)]
struct RequestResetRequest {
    #[validate(email(message = "must be a valid email"))]
    email: String,
}

#[derive(Debug, Deserialize, Validate)]
struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "token is required"))]
    token: String,
    #[validate(length(min = 1, message = "password is required"))]
    password: String,
}

pub struct AuthPlugin;

#[async_trait]
impl ApiPlugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::post("/api/v1/auth/register", "register")
                .public()
                .rate_limited(),
            Route::post("/api/v1/auth/login", "login")
                .public()
                .rate_limited(),
            Route::post("/api/v1/auth/refresh", "refresh").public(),
            Route::post("/api/v1/auth/verify-email", "verify_email").public(),
            Route::post("/api/v1/auth/request-reset", "request_reset")
                .public()
                .rate_limited(),
            Route::post("/api/v1/auth/reset-password", "reset_password")
                .public()
                .rate_limited(),
            Route::post("/api/v1/auth/logout", "logout"),
        ]
    }

    async fn handle(
        &self,
        operation: &str,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        match operation {
            "register" => self.handle_register(req, ctx).await,
            "login" => self.handle_login(req, ctx).await,
            "refresh" => self.handle_refresh(req, ctx).await,
            "verify_email" => self.handle_verify_email(req, ctx).await,
            "request_reset" => self.handle_request_reset(req, ctx).await,
            "reset_password" => self.handle_reset_password(req, ctx).await,
            "logout" => self.handle_logout(rctx, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl AuthPlugin {
    async fn handle_register(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let body: RegisterRequest = validate_body(req)?;
        let tokens = ctx.provider.register(body).await?;

        // The local provider leaves verification to us; the external IdP
        // runs its own confirmation flow. Send failures are logged, never
        // surfaced: the account exists either way.
        if ctx.provider.name() == "local" {
            if let Err(err) = self.send_verification_email(ctx, &tokens.user).await {
                tracing::warn!(error = %err, email = %tokens.user.email, "failed to send verification email");
            }
        }

        error::success(200, &tokens)
    }

    async fn handle_login(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let body: LoginRequest = validate_body(req)?;
        let tokens = ctx.provider.login(body).await?;
        error::success(200, &tokens)
    }

    async fn handle_refresh(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let body: RefreshRequest = validate_body(req)?;
        let pair = ctx.provider.refresh(&body.refresh_token).await?;
        error::success(200, &pair)
    }

    async fn handle_verify_email(
        &self,
        req: &ApiRequest,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let body: VerifyEmailRequest = validate_body(req)?;
        ctx.credentials.verify_email(&body.token).await?;
        error::success(200, &serde_json::json!({ "message": "Email verified" }))
    }

    async fn handle_request_reset(
        &self,
        req: &ApiRequest,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let body: RequestResetRequest = validate_body(req)?;

        // The response is identical whether or not the account exists, and
        // send failures stay server-side. Anything else would let callers
        // enumerate registered emails.
        if let Some(user) = ctx.database.get_user_by_email(&body.email).await? {
            match ctx
                .credentials
                .issue(user.id, TokenPurpose::PasswordReset)
                .await
            {
                Ok(raw) => {
                    let message = templates::password_reset_email(
                        &ctx.config.email.app_url,
                        &user.name,
                        &user.email,
                        &raw,
                    );
                    let send = match ctx.email_provider() {
                        Ok(provider) => provider.send(message).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = send {
                        tracing::warn!(error = %err, "failed to send password reset email");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to issue password reset token");
                }
            }
        }

        error::success(
            200,
            &serde_json::json!({
                "message": "If an account exists for that email, a reset link has been sent."
            }),
        )
    }

    async fn handle_reset_password(
        &self,
        req: &ApiRequest,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let body: ResetPasswordRequest = validate_body(req)?;
        password::validate_password(&body.password)?;

        let new_hash = password::hash_password(&body.password)?;
        let user_id = ctx
            .credentials
            .reset_password(&body.token, &new_hash)
            .await?;

        // A fresh password invalidates every outstanding session.
        ctx.tokens.revoke_all_for_user(user_id).await?;

        error::success(200, &serde_json::json!({ "message": "Password updated" }))
    }

    async fn handle_logout(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        if let Err(err) = ctx.provider.logout(user_id).await {
            tracing::warn!(error = %err, %user_id, "logout revocation failed");
        }
        error::success(200, &serde_json::json!({ "message": "Logged out" }))
    }

    async fn send_verification_email(
        &self,
        ctx: &AppContext,
        user: &berth_core::types::UserProfile,
    ) -> ApiResult<()> {
        let raw = ctx
            .credentials
            .issue(user.id, TokenPurpose::EmailVerification)
            .await?;
        let message = templates::verification_email(
            &ctx.config.email.app_url,
            &user.name,
            &user.email,
            &raw,
        );
        ctx.email_provider()?.send(message).await
    }
}
