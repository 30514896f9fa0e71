//! Profile endpoints for the authenticated principal, linked OAuth account
//! management, and the system-admin user listing.

use async_trait::async_trait;
use serde::Deserialize;
use validator::Validate;

use berth_core::context::RequestContext;
use berth_core::error::{self, ApiError, ApiResult, DatabaseError, Meta, validate_body};
use berth_core::password;
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{
    ApiRequest, ApiResponse, ROLE_ADMIN, ROLE_SUPER_ADMIN, UpdateUser,
};

#[derive(Debug, Deserialize, Validate)]
struct UpdateMeRequest {
    #[validate(length(min = 2, max = 100, message = "name must be 2-100 characters"))]
    name: Option<String>,
    #[validate(email(message = "must be a valid email"))]
    email: Option<String>,
    #[validate(length(max = 512, message = "must be at most 512 characters"))]
    avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListUsersQuery {
    search: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

pub struct UsersPlugin;

#[async_trait]
impl ApiPlugin for UsersPlugin {
    fn name(&self) -> &'static str {
        "users"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::get("/api/v1/users/me", "get_me"),
            Route::put("/api/v1/users/me", "update_me"),
            Route::get("/api/v1/users/me/oauth-accounts", "list_oauth_accounts"),
            Route::delete(
                "/api/v1/users/me/oauth-accounts/:provider",
                "unlink_oauth_account",
            ),
            Route::get("/api/v1/users", "list_users")
                .system_roles(&[ROLE_ADMIN, ROLE_SUPER_ADMIN]),
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
            "get_me" => self.handle_get_me(rctx, ctx).await,
            "update_me" => self.handle_update_me(req, rctx, ctx).await,
            "list_oauth_accounts" => self.handle_list_oauth_accounts(rctx, ctx).await,
            "unlink_oauth_account" => self.handle_unlink_oauth_account(req, rctx, ctx).await,
            "list_users" => self.handle_list_users(req, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl UsersPlugin {
    async fn handle_get_me(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let user = ctx
            .database
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("User not found"))?;
        let roles = ctx.database.get_user_roles(user_id).await?;
        error::success(200, &user.to_profile(roles))
    }

    async fn handle_update_me(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let body: UpdateMeRequest = validate_body(req)?;

        let updated = ctx
            .database
            .update_user(
                user_id,
                UpdateUser {
                    name: body.name,
                    email: body.email,
                    avatar_url: body.avatar_url,
                },
            )
            .await
            .map_err(|err| match err {
                ApiError::Database(DatabaseError::Constraint(_)) => {
                    ApiError::conflict("Email already exists")
                }
                other => other,
            })?;

        let roles = ctx.database.get_user_roles(user_id).await?;
        error::success(200, &updated.to_profile(roles))
    }

    async fn handle_list_oauth_accounts(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let accounts = ctx.database.list_oauth_accounts(user_id).await?;
        error::success(200, &accounts)
    }

    async fn handle_unlink_oauth_account(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let provider = req
            .param("provider")
            .ok_or_else(|| ApiError::bad_request("Missing provider parameter"))?
            .to_string();

        // Unlinking must leave at least one way to sign in: another linked
        // provider, or a real password.
        let user = ctx
            .database
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::not_found("User not found"))?;
        let link_count = ctx.database.count_oauth_accounts(user_id).await?;
        if link_count <= 1 && !password::has_usable_password(&user.password_hash) {
            return Err(ApiError::LastAuthMethod);
        }

        if !ctx.database.delete_oauth_account(user_id, &provider).await? {
            return Err(ApiError::not_found("OAuth account not linked"));
        }

        error::success(
            200,
            &serde_json::json!({
                "message": format!("{} account unlinked successfully", provider)
            }),
        )
    }

    async fn handle_list_users(&self, req: &ApiRequest, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let query = ListUsersQuery {
            search: req.query.get("search").cloned(),
            page: req.query.get("page").and_then(|p| p.parse().ok()),
            per_page: req.query.get("per_page").and_then(|p| p.parse().ok()),
        };
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(20).clamp(1, 100);

        let (users, total) = ctx
            .database
            .list_users(query.search.as_deref(), page, per_page)
            .await?;

        let profiles: Vec<_> = {
            let mut profiles = Vec::with_capacity(users.len());
            for user in users {
                let roles = ctx.database.get_user_roles(user.id).await?;
                profiles.push(user.to_profile(roles));
            }
            profiles
        };

        let total_pages = ((total as f64) / (per_page as f64)).ceil() as u32;
        error::success_with_meta(
            200,
            &profiles,
            Meta {
                page,
                per_page,
                total,
                total_pages,
            },
        )
    }
}
