use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::types::{
    AuditLog, BillingPlan, CreateAuditLog, CreateDeployment, CreateInvite, CreateOAuthAccount,
    CreateOrg, CreateProject, CreateUser, CredentialToken, Deployment, EnvVar, Invoice,
    MemberWithUser, Membership, OAuthAccount, Org, OrgInvite, OrgRole, Project, RefreshToken,
    Subscription, UpdateOrg, UpdateProject, UpdateUser, User,
};

/// Persistence contract for the control plane.
///
/// Multi-step operations that must be atomic (org + owner membership,
/// credential-token consumption, invite acceptance) are single methods so
/// every implementation can wrap them in its own transaction. Soft-deleted
/// rows are invisible to every read on this trait.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    // --- Users ---

    /// Create a principal. A duplicate email surfaces as a constraint error.
    async fn create_user(&self, user: CreateUser) -> ApiResult<User>;
    /// Create a principal and assign a system role in one transaction, so
    /// registration never leaves a roleless account behind.
    async fn create_user_with_role(&self, user: CreateUser, role: &str) -> ApiResult<User>;
    async fn get_user_by_id(&self, id: Uuid) -> ApiResult<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> ApiResult<Option<User>>;
    async fn update_user(&self, id: Uuid, update: UpdateUser) -> ApiResult<User>;
    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> ApiResult<()>;
    async fn set_email_verified(&self, id: Uuid, verified: bool) -> ApiResult<()>;
    async fn set_avatar_url(&self, id: Uuid, avatar_url: &str) -> ApiResult<()>;
    async fn soft_delete_user(&self, id: Uuid) -> ApiResult<()>;
    /// Paginated listing for the system admin surface.
    async fn list_users(
        &self,
        search: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> ApiResult<(Vec<User>, u64)>;

    // --- System roles ---

    async fn assign_role(&self, user_id: Uuid, role: &str) -> ApiResult<()>;
    async fn get_user_roles(&self, user_id: Uuid) -> ApiResult<Vec<String>>;

    // --- Refresh tokens ---

    async fn create_refresh_token(&self, token: RefreshToken) -> ApiResult<()>;
    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> ApiResult<Option<RefreshToken>>;
    /// Compare-and-set `revoked = false → true`. Returns `false` when the row
    /// was already revoked (or missing), which callers treat as a lost race.
    async fn revoke_refresh_token(&self, token_hash: &str) -> ApiResult<bool>;
    async fn revoke_refresh_family(&self, family: Uuid) -> ApiResult<()>;
    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> ApiResult<()>;
    async fn delete_expired_refresh_tokens(&self) -> ApiResult<usize>;

    // --- Credential tokens (one-shot) ---

    async fn create_credential_token(&self, token: CredentialToken) -> ApiResult<()>;
    /// Atomically consume an unused, unexpired verification token and mark
    /// the owner's email verified. Returns the owner id on success.
    async fn consume_verification_token(&self, token_hash: &str) -> ApiResult<Option<Uuid>>;
    /// Atomically consume an unused, unexpired reset token, replace the
    /// owner's password hash, and mark every other unused reset token of the
    /// same owner as used. Returns the owner id on success.
    async fn consume_password_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
    ) -> ApiResult<Option<Uuid>>;

    // --- OAuth accounts ---

    async fn create_oauth_account(&self, account: CreateOAuthAccount) -> ApiResult<OAuthAccount>;
    async fn get_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> ApiResult<Option<OAuthAccount>>;
    async fn list_oauth_accounts(&self, user_id: Uuid) -> ApiResult<Vec<OAuthAccount>>;
    async fn count_oauth_accounts(&self, user_id: Uuid) -> ApiResult<usize>;
    /// Returns `false` when no link for `(user, provider)` existed.
    async fn delete_oauth_account(&self, user_id: Uuid, provider: &str) -> ApiResult<bool>;

    // --- Orgs ---

    /// Create the org and its owner membership in one transaction, so an org
    /// can never exist without an owner.
    async fn create_org_with_owner(
        &self,
        org: CreateOrg,
        owner_id: Uuid,
    ) -> ApiResult<(Org, Membership)>;
    async fn get_org_by_id(&self, id: Uuid) -> ApiResult<Option<Org>>;
    async fn get_org_by_slug(&self, slug: &str) -> ApiResult<Option<Org>>;
    async fn update_org(&self, id: Uuid, update: UpdateOrg) -> ApiResult<Org>;
    async fn soft_delete_org(&self, id: Uuid) -> ApiResult<()>;
    async fn list_user_orgs(&self, user_id: Uuid) -> ApiResult<Vec<Org>>;

    // --- Memberships ---

    async fn get_membership(&self, org_id: Uuid, user_id: Uuid) -> ApiResult<Option<Membership>>;
    async fn get_membership_by_id(&self, id: Uuid) -> ApiResult<Option<Membership>>;
    async fn update_membership_role(&self, id: Uuid, role: OrgRole) -> ApiResult<Membership>;
    async fn delete_membership(&self, id: Uuid) -> ApiResult<()>;
    async fn list_org_members(&self, org_id: Uuid) -> ApiResult<Vec<MemberWithUser>>;
    async fn count_org_members(&self, org_id: Uuid) -> ApiResult<usize>;
    async fn count_org_owners(&self, org_id: Uuid) -> ApiResult<usize>;

    // --- Invites ---

    async fn create_invite(&self, invite: CreateInvite) -> ApiResult<OrgInvite>;
    async fn get_invite_by_id(&self, id: Uuid) -> ApiResult<Option<OrgInvite>>;
    async fn get_invite_by_token(&self, token: &str) -> ApiResult<Option<OrgInvite>>;
    async fn get_pending_invite(&self, org_id: Uuid, email: &str) -> ApiResult<Option<OrgInvite>>;
    /// Mark the invite accepted and create the membership in one transaction.
    async fn accept_invite(&self, invite_id: Uuid, user_id: Uuid) -> ApiResult<Membership>;
    async fn list_org_invites(&self, org_id: Uuid) -> ApiResult<Vec<OrgInvite>>;
    async fn delete_invite(&self, id: Uuid) -> ApiResult<()>;

    // --- Projects ---

    async fn create_project(&self, project: CreateProject) -> ApiResult<Project>;
    async fn get_project(&self, org_id: Uuid, project_id: Uuid) -> ApiResult<Option<Project>>;
    async fn list_org_projects(&self, org_id: Uuid) -> ApiResult<Vec<Project>>;
    async fn update_project(&self, project_id: Uuid, update: UpdateProject) -> ApiResult<Project>;
    async fn soft_delete_project(&self, project_id: Uuid) -> ApiResult<()>;
    async fn count_org_projects(&self, org_id: Uuid) -> ApiResult<usize>;

    // --- Deployments ---

    async fn create_deployment(&self, deployment: CreateDeployment) -> ApiResult<Deployment>;
    async fn list_project_deployments(&self, project_id: Uuid) -> ApiResult<Vec<Deployment>>;
    /// Deployments currently `running` across all projects of the org; this
    /// is the count the deployment quota is measured against.
    async fn count_running_deployments(&self, org_id: Uuid) -> ApiResult<usize>;

    // --- Env vars ---

    async fn upsert_env_var(
        &self,
        project_id: Uuid,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> ApiResult<EnvVar>;
    async fn list_env_vars(&self, project_id: Uuid) -> ApiResult<Vec<EnvVar>>;
    async fn delete_env_var(&self, project_id: Uuid, env_var_id: Uuid) -> ApiResult<bool>;

    // --- Audit log ---

    async fn record_audit_log(&self, entry: CreateAuditLog) -> ApiResult<AuditLog>;
    async fn list_org_audit_logs(&self, org_id: Uuid) -> ApiResult<Vec<AuditLog>>;

    // --- Billing ---

    /// Insert the plan unless a plan with the same slug already exists.
    async fn seed_plan(&self, plan: BillingPlan) -> ApiResult<()>;
    async fn list_active_plans(&self) -> ApiResult<Vec<BillingPlan>>;
    async fn get_plan_by_id(&self, id: Uuid) -> ApiResult<Option<BillingPlan>>;
    async fn get_plan_by_slug(&self, slug: &str) -> ApiResult<Option<BillingPlan>>;
    /// Most recent non-terminal subscription with its plan.
    async fn current_subscription(
        &self,
        org_id: Uuid,
    ) -> ApiResult<Option<(Subscription, BillingPlan)>>;
    async fn create_subscription(&self, subscription: Subscription) -> ApiResult<()>;
    async fn update_subscription(&self, subscription: Subscription) -> ApiResult<()>;
    async fn create_invoice(&self, invoice: Invoice) -> ApiResult<()>;
    async fn list_org_invoices(&self, org_id: Uuid) -> ApiResult<Vec<Invoice>>;
    async fn get_invoice_by_external_id(&self, external_id: &str) -> ApiResult<Option<Invoice>>;
    async fn update_invoice(&self, invoice: Invoice) -> ApiResult<()>;

    // --- Health ---

    /// Readiness probe. The memory adapter is always ready; SQL adapters
    /// round-trip a trivial query.
    async fn ping(&self) -> ApiResult<()>;
}
