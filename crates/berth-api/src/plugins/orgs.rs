//! Organization endpoints: CRUD, membership management, invitations, and
//! the audit trail.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Deserialize;
use validator::Validate;

use berth_core::context::RequestContext;
use berth_core::error::{self, ApiError, ApiResult, DatabaseError, validate_body};
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{
    ApiRequest, ApiResponse, CreateAuditLog, CreateInvite, CreateOrg, OrgRole, QuotaResource,
    UpdateOrg,
};

use crate::email as templates;

const INVITE_TTL_DAYS: i64 = 7;

#[derive(Debug, Deserialize, Validate)]
struct CreateOrgRequest {
    #[validate(length(min = 2, max = 100, message = "name must be 2-100 characters"))]
    name: String,
    #[validate(length(min = 2, max = 50, message = "slug must be 2-50 characters"))]
    slug: String,
}

fn validate_slug(slug: &str) -> ApiResult<()> {
    let valid = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(
            "Slug may only contain lowercase letters, digits, and dashes",
        ))
    }
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateOrgRequest {
    #[validate(length(min = 2, max = 100, message = "name must be 2-100 characters"))]
    name: Option<String>,
    #[validate(length(max = 512, message = "must be at most 512 characters"))]
    logo_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct InviteMemberRequest {
    #[validate(email(message = "must be a valid email"))]
    email: String,
    role: OrgRole,
}

#[derive(Debug, Deserialize)]
struct UpdateMemberRoleRequest {
    role: OrgRole,
}

pub struct OrgsPlugin;

#[async_trait]
impl ApiPlugin for OrgsPlugin {
    fn name(&self) -> &'static str {
        "orgs"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::post("/api/v1/orgs", "create_org"),
            Route::get("/api/v1/orgs", "list_orgs"),
            Route::post("/api/v1/invites/:token/accept", "accept_invite"),
            Route::get("/api/v1/orgs/:orgId", "get_org"),
            Route::put("/api/v1/orgs/:orgId", "update_org").org_role(OrgRole::Admin),
            Route::delete("/api/v1/orgs/:orgId", "delete_org").org_role(OrgRole::Owner),
            Route::get("/api/v1/orgs/:orgId/members", "list_members"),
            Route::put("/api/v1/orgs/:orgId/members/:memberId", "update_member_role")
                .org_role(OrgRole::Admin),
            Route::delete("/api/v1/orgs/:orgId/members/:memberId", "remove_member")
                .org_role(OrgRole::Admin),
            Route::post("/api/v1/orgs/:orgId/invites", "invite_member")
                .org_role(OrgRole::Admin)
                .quota(QuotaResource::Members),
            Route::get("/api/v1/orgs/:orgId/invites", "list_invites"),
            Route::delete("/api/v1/orgs/:orgId/invites/:inviteId", "revoke_invite")
                .org_role(OrgRole::Admin),
            Route::get("/api/v1/orgs/:orgId/audit-logs", "list_audit_logs")
                .org_role(OrgRole::Admin)
                .feature("audit_logs"),
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
            "create_org" => self.handle_create_org(req, rctx, ctx).await,
            "list_orgs" => self.handle_list_orgs(rctx, ctx).await,
            "accept_invite" => self.handle_accept_invite(req, rctx, ctx).await,
            "get_org" => self.handle_get_org(rctx, ctx).await,
            "update_org" => self.handle_update_org(req, rctx, ctx).await,
            "delete_org" => self.handle_delete_org(rctx, ctx).await,
            "list_members" => self.handle_list_members(rctx, ctx).await,
            "update_member_role" => self.handle_update_member_role(req, rctx, ctx).await,
            "remove_member" => self.handle_remove_member(req, rctx, ctx).await,
            "invite_member" => self.handle_invite_member(req, rctx, ctx).await,
            "list_invites" => self.handle_list_invites(rctx, ctx).await,
            "revoke_invite" => self.handle_revoke_invite(req, rctx, ctx).await,
            "list_audit_logs" => self.handle_list_audit_logs(rctx, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl OrgsPlugin {
    async fn handle_create_org(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let body: CreateOrgRequest = validate_body(req)?;
        validate_slug(&body.slug)?;

        if ctx.database.get_org_by_slug(&body.slug).await?.is_some() {
            return Err(ApiError::conflict("Organization slug already taken"));
        }

        let (org, _membership) = ctx
            .database
            .create_org_with_owner(
                CreateOrg {
                    name: body.name,
                    slug: body.slug,
                },
                user_id,
            )
            .await
            .map_err(|err| match err {
                ApiError::Database(DatabaseError::Constraint(_)) => {
                    ApiError::conflict("Organization slug already taken")
                }
                other => other,
            })?;

        ctx.database
            .record_audit_log(CreateAuditLog {
                org_id: org.id,
                actor_id: user_id,
                action: "org.created".to_string(),
                resource: format!("org:{}", org.id),
                details: None,
            })
            .await?;

        error::success(201, &org)
    }

    async fn handle_list_orgs(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let orgs = ctx.database.list_user_orgs(rctx.user_id()?).await?;
        error::success(200, &orgs)
    }

    async fn handle_accept_invite(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let user_id = rctx.user_id()?;
        let token = req
            .param("token")
            .ok_or_else(|| ApiError::bad_request("Missing token parameter"))?;

        let invite = ctx
            .database
            .get_invite_by_token(token)
            .await?
            .ok_or_else(|| ApiError::not_found("Invitation not found"))?;

        if invite.accepted_at.is_some() {
            return Err(ApiError::conflict("Invitation already accepted"));
        }
        if Utc::now() >= invite.expires_at {
            return Err(ApiError::bad_request("Invitation has expired"));
        }

        let membership = ctx
            .database
            .accept_invite(invite.id, user_id)
            .await
            .map_err(|err| match err {
                ApiError::Database(DatabaseError::Constraint(_)) => {
                    ApiError::conflict("You are already a member of this organization")
                }
                other => other,
            })?;

        error::success(200, &membership)
    }

    async fn handle_get_org(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let org_id = rctx.org()?.org_id;
        let org = ctx
            .database
            .get_org_by_id(org_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Organization not found"))?;
        error::success(200, &org)
    }

    async fn handle_update_org(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let org_id = rctx.org()?.org_id;
        let body: UpdateOrgRequest = validate_body(req)?;
        let org = ctx
            .database
            .update_org(
                org_id,
                UpdateOrg {
                    name: body.name,
                    logo_url: body.logo_url,
                },
            )
            .await?;
        error::success(200, &org)
    }

    async fn handle_delete_org(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        ctx.database.soft_delete_org(scope.org_id).await?;
        ctx.database
            .record_audit_log(CreateAuditLog {
                org_id: scope.org_id,
                actor_id: rctx.user_id()?,
                action: "org.deleted".to_string(),
                resource: format!("org:{}", scope.org_id),
                details: None,
            })
            .await?;
        error::success(200, &serde_json::json!({ "message": "Organization deleted" }))
    }

    async fn handle_list_members(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let members = ctx.database.list_org_members(rctx.org()?.org_id).await?;
        error::success(200, &members)
    }

    async fn handle_update_member_role(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        let member_id = req.uuid_param("memberId")?;
        let body: UpdateMemberRoleRequest = req
            .body_as_json()
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?;

        let membership = ctx
            .database
            .get_membership_by_id(member_id)
            .await?
            .filter(|m| m.org_id == scope.org_id)
            .ok_or_else(|| ApiError::not_found("Member not found"))?;

        // Demoting the last owner would strand the org.
        if membership.role == OrgRole::Owner
            && body.role != OrgRole::Owner
            && ctx.database.count_org_owners(scope.org_id).await? <= 1
        {
            return Err(ApiError::conflict(
                "Cannot change the role of the last owner",
            ));
        }

        let updated = ctx
            .database
            .update_membership_role(member_id, body.role)
            .await?;
        error::success(200, &updated)
    }

    async fn handle_remove_member(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        let member_id = req.uuid_param("memberId")?;

        let membership = ctx
            .database
            .get_membership_by_id(member_id)
            .await?
            .filter(|m| m.org_id == scope.org_id)
            .ok_or_else(|| ApiError::not_found("Member not found"))?;

        if membership.role == OrgRole::Owner
            && ctx.database.count_org_owners(scope.org_id).await? <= 1
        {
            return Err(ApiError::conflict("Cannot remove the last owner"));
        }

        ctx.database.delete_membership(member_id).await?;
        error::success(200, &serde_json::json!({ "message": "Member removed" }))
    }

    async fn handle_invite_member(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        let invited_by = rctx.user_id()?;
        let body: InviteMemberRequest = validate_body(req)?;

        if ctx
            .database
            .get_pending_invite(scope.org_id, &body.email)
            .await?
            .is_some()
        {
            return Err(ApiError::conflict(
                "An invitation for this email already exists",
            ));
        }

        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token: String = token_bytes.iter().map(|b| format!("{:02x}", b)).collect();

        let invite = ctx
            .database
            .create_invite(CreateInvite {
                org_id: scope.org_id,
                email: body.email,
                role: body.role,
                token: token.clone(),
                expires_at: Utc::now() + Duration::days(INVITE_TTL_DAYS),
                invited_by,
            })
            .await?;

        if let (Some(provider), Some(org)) = (
            ctx.email.as_deref(),
            ctx.database.get_org_by_id(scope.org_id).await?,
        ) {
            let message =
                templates::invite_email(&ctx.config.email.app_url, &org.name, &invite.email, &token);
            if let Err(err) = provider.send(message).await {
                tracing::warn!(error = %err, "failed to send invite email");
            }
        }

        error::success(201, &invite)
    }

    async fn handle_list_invites(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let invites = ctx.database.list_org_invites(rctx.org()?.org_id).await?;
        error::success(200, &invites)
    }

    async fn handle_revoke_invite(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        let invite_id = req.uuid_param("inviteId")?;

        let invite = ctx
            .database
            .get_invite_by_id(invite_id)
            .await?
            .filter(|i| i.org_id == scope.org_id)
            .ok_or_else(|| ApiError::not_found("Invitation not found"))?;

        ctx.database.delete_invite(invite.id).await?;
        error::success(200, &serde_json::json!({ "message": "Invitation revoked" }))
    }

    async fn handle_list_audit_logs(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let logs = ctx.database.list_org_audit_logs(rctx.org()?.org_id).await?;
        error::success(200, &logs)
    }
}
