//! Project, deployment, and env-var endpoints. All tenant-scoped; creation
//! routes carry quota gates.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use berth_core::context::RequestContext;
use berth_core::error::{self, ApiError, ApiResult, validate_body};
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{
    ApiRequest, ApiResponse, CreateAuditLog, CreateDeployment, CreateProject, DeploymentStatus,
    EnvVar, OrgRole, Project, QuotaResource, UpdateProject,
};

#[derive(Debug, Deserialize, Validate)]
struct CreateProjectRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    name: String,
    description: Option<String>,
    #[validate(length(max = 512, message = "must be at most 512 characters"))]
    repo_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateProjectRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    name: Option<String>,
    description: Option<String>,
    #[validate(length(max = 512, message = "must be at most 512 characters"))]
    repo_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct CreateDeploymentRequest {
    #[validate(length(min = 1, max = 100, message = "version must be 1-100 characters"))]
    version: String,
    commit_sha: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
struct SetEnvVarRequest {
    #[validate(length(min = 1, max = 255, message = "key must be 1-255 characters"))]
    key: String,
    value: String,
    #[serde(default)]
    is_secret: bool,
}

pub struct ProjectsPlugin;

#[async_trait]
impl ApiPlugin for ProjectsPlugin {
    fn name(&self) -> &'static str {
        "projects"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::post("/api/v1/orgs/:orgId/projects", "create_project")
                .org_role(OrgRole::Developer)
                .quota(QuotaResource::Projects),
            Route::get("/api/v1/orgs/:orgId/projects", "list_projects"),
            Route::get("/api/v1/orgs/:orgId/projects/:projectId", "get_project"),
            Route::put("/api/v1/orgs/:orgId/projects/:projectId", "update_project")
                .org_role(OrgRole::Developer),
            Route::delete("/api/v1/orgs/:orgId/projects/:projectId", "delete_project")
                .org_role(OrgRole::Admin),
            Route::post(
                "/api/v1/orgs/:orgId/projects/:projectId/deployments",
                "create_deployment",
            )
            .org_role(OrgRole::Developer)
            .quota(QuotaResource::Deployments),
            Route::get(
                "/api/v1/orgs/:orgId/projects/:projectId/deployments",
                "list_deployments",
            ),
            Route::post("/api/v1/orgs/:orgId/projects/:projectId/env", "set_env_var")
                .org_role(OrgRole::Developer),
            Route::get("/api/v1/orgs/:orgId/projects/:projectId/env", "list_env_vars"),
            Route::delete(
                "/api/v1/orgs/:orgId/projects/:projectId/env/:envVarId",
                "delete_env_var",
            )
            .org_role(OrgRole::Developer),
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
            "create_project" => self.handle_create_project(req, rctx, ctx).await,
            "list_projects" => self.handle_list_projects(rctx, ctx).await,
            "get_project" => self.handle_get_project(req, rctx, ctx).await,
            "update_project" => self.handle_update_project(req, rctx, ctx).await,
            "delete_project" => self.handle_delete_project(req, rctx, ctx).await,
            "create_deployment" => self.handle_create_deployment(req, rctx, ctx).await,
            "list_deployments" => self.handle_list_deployments(req, rctx, ctx).await,
            "set_env_var" => self.handle_set_env_var(req, rctx, ctx).await,
            "list_env_vars" => self.handle_list_env_vars(req, rctx, ctx).await,
            "delete_env_var" => self.handle_delete_env_var(req, rctx, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl ProjectsPlugin {
    /// Load a project scoped to the resolved org, or 404 within the tenant.
    async fn project_in_scope(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<Project> {
        let org_id = rctx.org()?.org_id;
        let project_id = req.uuid_param("projectId")?;
        ctx.database
            .get_project(org_id, project_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Project not found"))
    }

    async fn handle_create_project(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let scope = rctx.org()?;
        let body: CreateProjectRequest = validate_body(req)?;

        let project = ctx
            .database
            .create_project(CreateProject {
                org_id: scope.org_id,
                name: body.name,
                description: body.description,
                repo_url: body.repo_url,
            })
            .await?;

        ctx.database
            .record_audit_log(CreateAuditLog {
                org_id: scope.org_id,
                actor_id: rctx.user_id()?,
                action: "project.created".to_string(),
                resource: format!("project:{}", project.id),
                details: None,
            })
            .await?;

        error::success(201, &project)
    }

    async fn handle_list_projects(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let projects = ctx.database.list_org_projects(rctx.org()?.org_id).await?;
        error::success(200, &projects)
    }

    async fn handle_get_project(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        error::success(200, &project)
    }

    async fn handle_update_project(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let body: UpdateProjectRequest = validate_body(req)?;

        let updated = ctx
            .database
            .update_project(
                project.id,
                UpdateProject {
                    name: body.name,
                    description: body.description,
                    repo_url: body.repo_url,
                },
            )
            .await?;
        error::success(200, &updated)
    }

    async fn handle_delete_project(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        ctx.database.soft_delete_project(project.id).await?;

        ctx.database
            .record_audit_log(CreateAuditLog {
                org_id: project.org_id,
                actor_id: rctx.user_id()?,
                action: "project.deleted".to_string(),
                resource: format!("project:{}", project.id),
                details: None,
            })
            .await?;

        error::success(200, &serde_json::json!({ "message": "Project deleted" }))
    }

    async fn handle_create_deployment(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let body: CreateDeploymentRequest = validate_body(req)?;

        let deployment = ctx
            .database
            .create_deployment(CreateDeployment {
                project_id: project.id,
                version: body.version,
                status: DeploymentStatus::Pending,
                commit_sha: body.commit_sha,
            })
            .await?;

        error::success(201, &deployment)
    }

    async fn handle_list_deployments(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let deployments = ctx.database.list_project_deployments(project.id).await?;
        error::success(200, &deployments)
    }

    async fn handle_set_env_var(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let body: SetEnvVarRequest = validate_body(req)?;

        let sealed = ctx.secrets.seal(&body.value);
        let stored = ctx
            .database
            .upsert_env_var(project.id, &body.key, &sealed, body.is_secret)
            .await?;

        error::success(200, &self.open_env_var(ctx, stored))
    }

    async fn handle_list_env_vars(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let vars: Vec<EnvVar> = ctx
            .database
            .list_env_vars(project.id)
            .await?
            .into_iter()
            .map(|v| self.open_env_var(ctx, v))
            .collect();
        error::success(200, &vars)
    }

    async fn handle_delete_env_var(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let project = self.project_in_scope(req, rctx, ctx).await?;
        let env_var_id: Uuid = req.uuid_param("envVarId")?;

        if !ctx.database.delete_env_var(project.id, env_var_id).await? {
            return Err(ApiError::not_found("Environment variable not found"));
        }
        error::success(
            200,
            &serde_json::json!({ "message": "Environment variable deleted" }),
        )
    }

    fn open_env_var(&self, ctx: &AppContext, mut var: EnvVar) -> EnvVar {
        var.value = ctx.secrets.open(&var.value);
        var
    }
}
