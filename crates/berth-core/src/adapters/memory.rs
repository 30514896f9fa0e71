use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, DatabaseError};
use crate::types::{
    AuditLog, BillingPlan, CreateAuditLog, CreateDeployment, CreateInvite, CreateOAuthAccount,
    CreateOrg, CreateProject, CreateUser, CredentialToken, Deployment, EnvVar, Invoice,
    MemberUser, MemberWithUser, Membership, OAuthAccount, Org, OrgInvite, OrgRole, Project,
    RefreshToken, Subscription, TokenPurpose, UpdateOrg, UpdateProject, UpdateUser, User,
};

use super::DatabaseAdapter;

/// In-memory adapter for tests and single-process development.
///
/// One mutex guards the whole store, which makes the composite operations
/// (org + owner, token consumption, invite acceptance) naturally atomic and
/// gives per-entity linearizability matching the SQL adapters.
pub struct MemoryDatabaseAdapter {
    store: Mutex<Store>,
}

#[derive(Default)]
struct Store {
    users: HashMap<Uuid, User>,
    user_roles: HashMap<Uuid, Vec<String>>,
    refresh_tokens: HashMap<String, RefreshToken>,
    credential_tokens: HashMap<String, CredentialToken>,
    oauth_accounts: HashMap<Uuid, OAuthAccount>,
    orgs: HashMap<Uuid, Org>,
    memberships: HashMap<Uuid, Membership>,
    invites: HashMap<Uuid, OrgInvite>,
    projects: HashMap<Uuid, Project>,
    deployments: HashMap<Uuid, Deployment>,
    env_vars: HashMap<Uuid, EnvVar>,
    audit_logs: Vec<AuditLog>,
    plans: HashMap<Uuid, BillingPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: HashMap<Uuid, Invoice>,
}

impl MemoryDatabaseAdapter {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
        }
    }
}

impl Default for MemoryDatabaseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn constraint(message: &str) -> ApiError {
    ApiError::Database(DatabaseError::Constraint(message.to_string()))
}

fn insert_user(store: &mut Store, user: CreateUser) -> ApiResult<User> {
    let email = user.email.to_lowercase();
    if store
        .users
        .values()
        .any(|u| u.deleted_at.is_none() && u.email.eq_ignore_ascii_case(&email))
    {
        return Err(constraint("users.email unique violation"));
    }
    let now = Utc::now();
    let record = User {
        id: user.id.unwrap_or_else(Uuid::new_v4),
        name: user.name,
        email,
        password_hash: user.password_hash,
        avatar_url: user.avatar_url,
        email_verified: user.email_verified,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    store.users.insert(record.id, record.clone());
    Ok(record)
}

#[async_trait]
impl DatabaseAdapter for MemoryDatabaseAdapter {
    // --- Users ---

    async fn create_user(&self, user: CreateUser) -> ApiResult<User> {
        let mut store = self.store.lock().unwrap();
        insert_user(&mut store, user)
    }

    async fn create_user_with_role(&self, user: CreateUser, role: &str) -> ApiResult<User> {
        // Both writes happen under one lock acquisition.
        let mut store = self.store.lock().unwrap();
        let created = insert_user(&mut store, user)?;
        store
            .user_roles
            .entry(created.id)
            .or_default()
            .push(role.to_string());
        Ok(created)
    }

    async fn get_user_by_id(&self, id: Uuid) -> ApiResult<Option<User>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .users
            .get(&id)
            .filter(|u| u.deleted_at.is_none())
            .cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> ApiResult<Option<User>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .users
            .values()
            .find(|u| u.deleted_at.is_none() && u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_user(&self, id: Uuid, update: UpdateUser) -> ApiResult<User> {
        let mut store = self.store.lock().unwrap();
        if let Some(email) = &update.email {
            if store
                .users
                .values()
                .any(|u| u.id != id && u.deleted_at.is_none() && u.email.eq_ignore_ascii_case(email))
            {
                return Err(constraint("users.email unique violation"));
            }
        }
        let user = store
            .users
            .get_mut(&id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or_else(|| ApiError::not_found("User not found"))?;
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(email) = update.email {
            user.email = email.to_lowercase();
        }
        if let Some(avatar_url) = update.avatar_url {
            user.avatar_url = Some(avatar_url);
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(user) = store.users.get_mut(&id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_email_verified(&self, id: Uuid, verified: bool) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(user) = store.users.get_mut(&id) {
            user.email_verified = verified;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_avatar_url(&self, id: Uuid, avatar_url: &str) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(user) = store.users.get_mut(&id) {
            user.avatar_url = Some(avatar_url.to_string());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn soft_delete_user(&self, id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(user) = store.users.get_mut(&id) {
            user.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_users(
        &self,
        search: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> ApiResult<(Vec<User>, u64)> {
        let store = self.store.lock().unwrap();
        let needle = search.map(str::to_lowercase);
        let mut users: Vec<User> = store
            .users
            .values()
            .filter(|u| u.deleted_at.is_none())
            .filter(|u| match &needle {
                Some(n) => u.name.to_lowercase().contains(n) || u.email.contains(n),
                None => true,
            })
            .cloned()
            .collect();
        users.sort_by_key(|u| u.created_at);
        let total = users.len() as u64;
        let page = page.max(1);
        let start = ((page - 1) * per_page) as usize;
        let items = users
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();
        Ok((items, total))
    }

    // --- System roles ---

    async fn assign_role(&self, user_id: Uuid, role: &str) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        let roles = store.user_roles.entry(user_id).or_default();
        if !roles.iter().any(|r| r == role) {
            roles.push(role.to_string());
        }
        Ok(())
    }

    async fn get_user_roles(&self, user_id: Uuid) -> ApiResult<Vec<String>> {
        let store = self.store.lock().unwrap();
        Ok(store.user_roles.get(&user_id).cloned().unwrap_or_default())
    }

    // --- Refresh tokens ---

    async fn create_refresh_token(&self, token: RefreshToken) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if store.refresh_tokens.contains_key(&token.token_hash) {
            return Err(constraint("refresh_tokens.token_hash unique violation"));
        }
        store.refresh_tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> ApiResult<Option<RefreshToken>> {
        let store = self.store.lock().unwrap();
        Ok(store.refresh_tokens.get(token_hash).cloned())
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> ApiResult<bool> {
        let mut store = self.store.lock().unwrap();
        match store.refresh_tokens.get_mut(token_hash) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                token.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_refresh_family(&self, family: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        for token in store.refresh_tokens.values_mut() {
            if token.family == family && !token.revoked {
                token.revoked = true;
                token.revoked_at = Some(now);
            }
        }
        Ok(())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        for token in store.refresh_tokens.values_mut() {
            if token.user_id == user_id && !token.revoked {
                token.revoked = true;
                token.revoked_at = Some(now);
            }
        }
        Ok(())
    }

    async fn delete_expired_refresh_tokens(&self) -> ApiResult<usize> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let before = store.refresh_tokens.len();
        store.refresh_tokens.retain(|_, t| t.expires_at > now);
        Ok(before - store.refresh_tokens.len())
    }

    // --- Credential tokens ---

    async fn create_credential_token(&self, token: CredentialToken) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store
            .credential_tokens
            .insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn consume_verification_token(&self, token_hash: &str) -> ApiResult<Option<Uuid>> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let user_id = match store.credential_tokens.get_mut(token_hash) {
            Some(token)
                if token.purpose == TokenPurpose::EmailVerification
                    && token.used_at.is_none()
                    && token.expires_at > now =>
            {
                token.used_at = Some(now);
                token.user_id
            }
            _ => return Ok(None),
        };
        if let Some(user) = store.users.get_mut(&user_id) {
            user.email_verified = true;
            user.updated_at = now;
        }
        Ok(Some(user_id))
    }

    async fn consume_password_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
    ) -> ApiResult<Option<Uuid>> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let (user_id, token_id) = match store.credential_tokens.get_mut(token_hash) {
            Some(token)
                if token.purpose == TokenPurpose::PasswordReset
                    && token.used_at.is_none()
                    && token.expires_at > now =>
            {
                token.used_at = Some(now);
                (token.user_id, token.id)
            }
            _ => return Ok(None),
        };
        if let Some(user) = store.users.get_mut(&user_id) {
            user.password_hash = new_password_hash.to_string();
            user.updated_at = now;
        }
        for token in store.credential_tokens.values_mut() {
            if token.user_id == user_id
                && token.purpose == TokenPurpose::PasswordReset
                && token.id != token_id
                && token.used_at.is_none()
            {
                token.used_at = Some(now);
            }
        }
        Ok(Some(user_id))
    }

    // --- OAuth accounts ---

    async fn create_oauth_account(&self, account: CreateOAuthAccount) -> ApiResult<OAuthAccount> {
        let mut store = self.store.lock().unwrap();
        if store
            .oauth_accounts
            .values()
            .any(|a| a.provider == account.provider && a.provider_id == account.provider_id)
        {
            return Err(constraint("oauth_accounts(provider, provider_id) unique violation"));
        }
        let record = OAuthAccount {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            provider: account.provider,
            provider_id: account.provider_id,
            email: account.email,
            avatar_url: account.avatar_url,
            created_at: Utc::now(),
        };
        store.oauth_accounts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> ApiResult<Option<OAuthAccount>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .oauth_accounts
            .values()
            .find(|a| a.provider == provider && a.provider_id == provider_id)
            .cloned())
    }

    async fn list_oauth_accounts(&self, user_id: Uuid) -> ApiResult<Vec<OAuthAccount>> {
        let store = self.store.lock().unwrap();
        let mut accounts: Vec<OAuthAccount> = store
            .oauth_accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn count_oauth_accounts(&self, user_id: Uuid) -> ApiResult<usize> {
        let store = self.store.lock().unwrap();
        Ok(store
            .oauth_accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .count())
    }

    async fn delete_oauth_account(&self, user_id: Uuid, provider: &str) -> ApiResult<bool> {
        let mut store = self.store.lock().unwrap();
        let before = store.oauth_accounts.len();
        store
            .oauth_accounts
            .retain(|_, a| !(a.user_id == user_id && a.provider == provider));
        Ok(store.oauth_accounts.len() < before)
    }

    // --- Orgs ---

    async fn create_org_with_owner(
        &self,
        org: CreateOrg,
        owner_id: Uuid,
    ) -> ApiResult<(Org, Membership)> {
        let mut store = self.store.lock().unwrap();
        if store
            .orgs
            .values()
            .any(|o| o.deleted_at.is_none() && o.slug == org.slug)
        {
            return Err(constraint("orgs.slug unique violation"));
        }
        let now = Utc::now();
        let org_record = Org {
            id: Uuid::new_v4(),
            name: org.name,
            slug: org.slug,
            logo_url: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let membership = Membership {
            id: Uuid::new_v4(),
            user_id: owner_id,
            org_id: org_record.id,
            role: OrgRole::Owner,
            joined_at: now,
        };
        store.orgs.insert(org_record.id, org_record.clone());
        store.memberships.insert(membership.id, membership.clone());
        Ok((org_record, membership))
    }

    async fn get_org_by_id(&self, id: Uuid) -> ApiResult<Option<Org>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .orgs
            .get(&id)
            .filter(|o| o.deleted_at.is_none())
            .cloned())
    }

    async fn get_org_by_slug(&self, slug: &str) -> ApiResult<Option<Org>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .orgs
            .values()
            .find(|o| o.deleted_at.is_none() && o.slug == slug)
            .cloned())
    }

    async fn update_org(&self, id: Uuid, update: UpdateOrg) -> ApiResult<Org> {
        let mut store = self.store.lock().unwrap();
        let org = store
            .orgs
            .get_mut(&id)
            .filter(|o| o.deleted_at.is_none())
            .ok_or_else(|| ApiError::not_found("Organization not found"))?;
        if let Some(name) = update.name {
            org.name = name;
        }
        if let Some(logo_url) = update.logo_url {
            org.logo_url = Some(logo_url);
        }
        org.updated_at = Utc::now();
        Ok(org.clone())
    }

    async fn soft_delete_org(&self, id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(org) = store.orgs.get_mut(&id) {
            org.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_user_orgs(&self, user_id: Uuid) -> ApiResult<Vec<Org>> {
        let store = self.store.lock().unwrap();
        let org_ids: Vec<Uuid> = store
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.org_id)
            .collect();
        let mut orgs: Vec<Org> = org_ids
            .into_iter()
            .filter_map(|id| store.orgs.get(&id))
            .filter(|o| o.deleted_at.is_none())
            .cloned()
            .collect();
        orgs.sort_by_key(|o| o.created_at);
        Ok(orgs)
    }

    // --- Memberships ---

    async fn get_membership(&self, org_id: Uuid, user_id: Uuid) -> ApiResult<Option<Membership>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .memberships
            .values()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .cloned())
    }

    async fn get_membership_by_id(&self, id: Uuid) -> ApiResult<Option<Membership>> {
        let store = self.store.lock().unwrap();
        Ok(store.memberships.get(&id).cloned())
    }

    async fn update_membership_role(&self, id: Uuid, role: OrgRole) -> ApiResult<Membership> {
        let mut store = self.store.lock().unwrap();
        let membership = store
            .memberships
            .get_mut(&id)
            .ok_or_else(|| ApiError::not_found("Membership not found"))?;
        membership.role = role;
        Ok(membership.clone())
    }

    async fn delete_membership(&self, id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.memberships.remove(&id);
        Ok(())
    }

    async fn list_org_members(&self, org_id: Uuid) -> ApiResult<Vec<MemberWithUser>> {
        let store = self.store.lock().unwrap();
        let mut members: Vec<MemberWithUser> = store
            .memberships
            .values()
            .filter(|m| m.org_id == org_id)
            .filter_map(|m| {
                store.users.get(&m.user_id).map(|u| MemberWithUser {
                    membership: m.clone(),
                    user: MemberUser {
                        id: u.id,
                        name: u.name.clone(),
                        email: u.email.clone(),
                        avatar_url: u.avatar_url.clone(),
                    },
                })
            })
            .collect();
        members.sort_by_key(|m| m.membership.joined_at);
        Ok(members)
    }

    async fn count_org_members(&self, org_id: Uuid) -> ApiResult<usize> {
        let store = self.store.lock().unwrap();
        Ok(store
            .memberships
            .values()
            .filter(|m| m.org_id == org_id)
            .count())
    }

    async fn count_org_owners(&self, org_id: Uuid) -> ApiResult<usize> {
        let store = self.store.lock().unwrap();
        Ok(store
            .memberships
            .values()
            .filter(|m| m.org_id == org_id && m.role == OrgRole::Owner)
            .count())
    }

    // --- Invites ---

    async fn create_invite(&self, invite: CreateInvite) -> ApiResult<OrgInvite> {
        let mut store = self.store.lock().unwrap();
        let record = OrgInvite {
            id: Uuid::new_v4(),
            org_id: invite.org_id,
            email: invite.email.to_lowercase(),
            role: invite.role,
            token: invite.token,
            expires_at: invite.expires_at,
            accepted_at: None,
            invited_by: invite.invited_by,
            created_at: Utc::now(),
        };
        store.invites.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_invite_by_id(&self, id: Uuid) -> ApiResult<Option<OrgInvite>> {
        let store = self.store.lock().unwrap();
        Ok(store.invites.get(&id).cloned())
    }

    async fn get_invite_by_token(&self, token: &str) -> ApiResult<Option<OrgInvite>> {
        let store = self.store.lock().unwrap();
        Ok(store.invites.values().find(|i| i.token == token).cloned())
    }

    async fn get_pending_invite(&self, org_id: Uuid, email: &str) -> ApiResult<Option<OrgInvite>> {
        let store = self.store.lock().unwrap();
        let now = Utc::now();
        Ok(store
            .invites
            .values()
            .find(|i| {
                i.org_id == org_id && i.email.eq_ignore_ascii_case(email) && i.is_pending(now)
            })
            .cloned())
    }

    async fn accept_invite(&self, invite_id: Uuid, user_id: Uuid) -> ApiResult<Membership> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let (org_id, role) = {
            let invite = store
                .invites
                .get_mut(&invite_id)
                .ok_or_else(|| ApiError::not_found("Invitation not found"))?;
            invite.accepted_at = Some(now);
            (invite.org_id, invite.role)
        };
        if store
            .memberships
            .values()
            .any(|m| m.org_id == org_id && m.user_id == user_id)
        {
            return Err(constraint("memberships(user_id, org_id) unique violation"));
        }
        let membership = Membership {
            id: Uuid::new_v4(),
            user_id,
            org_id,
            role,
            joined_at: now,
        };
        store.memberships.insert(membership.id, membership.clone());
        Ok(membership)
    }

    async fn list_org_invites(&self, org_id: Uuid) -> ApiResult<Vec<OrgInvite>> {
        let store = self.store.lock().unwrap();
        let mut invites: Vec<OrgInvite> = store
            .invites
            .values()
            .filter(|i| i.org_id == org_id)
            .cloned()
            .collect();
        invites.sort_by_key(|i| i.created_at);
        Ok(invites)
    }

    async fn delete_invite(&self, id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.invites.remove(&id);
        Ok(())
    }

    // --- Projects ---

    async fn create_project(&self, project: CreateProject) -> ApiResult<Project> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let record = Project {
            id: Uuid::new_v4(),
            org_id: project.org_id,
            name: project.name,
            description: project.description,
            repo_url: project.repo_url,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.projects.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_project(&self, org_id: Uuid, project_id: Uuid) -> ApiResult<Option<Project>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .projects
            .get(&project_id)
            .filter(|p| p.org_id == org_id && p.deleted_at.is_none())
            .cloned())
    }

    async fn list_org_projects(&self, org_id: Uuid) -> ApiResult<Vec<Project>> {
        let store = self.store.lock().unwrap();
        let mut projects: Vec<Project> = store
            .projects
            .values()
            .filter(|p| p.org_id == org_id && p.deleted_at.is_none())
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn update_project(&self, project_id: Uuid, update: UpdateProject) -> ApiResult<Project> {
        let mut store = self.store.lock().unwrap();
        let project = store
            .projects
            .get_mut(&project_id)
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| ApiError::not_found("Project not found"))?;
        if let Some(name) = update.name {
            project.name = name;
        }
        if let Some(description) = update.description {
            project.description = Some(description);
        }
        if let Some(repo_url) = update.repo_url {
            project.repo_url = Some(repo_url);
        }
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn soft_delete_project(&self, project_id: Uuid) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if let Some(project) = store.projects.get_mut(&project_id) {
            project.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn count_org_projects(&self, org_id: Uuid) -> ApiResult<usize> {
        let store = self.store.lock().unwrap();
        Ok(store
            .projects
            .values()
            .filter(|p| p.org_id == org_id && p.deleted_at.is_none())
            .count())
    }

    // --- Deployments ---

    async fn create_deployment(&self, deployment: CreateDeployment) -> ApiResult<Deployment> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        let record = Deployment {
            id: Uuid::new_v4(),
            project_id: deployment.project_id,
            version: deployment.version,
            status: deployment.status,
            commit_sha: deployment.commit_sha,
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        store.deployments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_project_deployments(&self, project_id: Uuid) -> ApiResult<Vec<Deployment>> {
        let store = self.store.lock().unwrap();
        let mut deployments: Vec<Deployment> = store
            .deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn count_running_deployments(&self, org_id: Uuid) -> ApiResult<usize> {
        let store = self.store.lock().unwrap();
        Ok(store
            .deployments
            .values()
            .filter(|d| d.status == crate::types::DeploymentStatus::Running)
            .filter(|d| {
                store
                    .projects
                    .get(&d.project_id)
                    .map(|p| p.org_id == org_id && p.deleted_at.is_none())
                    .unwrap_or(false)
            })
            .count())
    }

    // --- Env vars ---

    async fn upsert_env_var(
        &self,
        project_id: Uuid,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> ApiResult<EnvVar> {
        let mut store = self.store.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = store
            .env_vars
            .values_mut()
            .find(|v| v.project_id == project_id && v.key == key)
        {
            existing.value = value.to_string();
            existing.is_secret = is_secret;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let record = EnvVar {
            id: Uuid::new_v4(),
            project_id,
            key: key.to_string(),
            value: value.to_string(),
            is_secret,
            created_at: now,
            updated_at: now,
        };
        store.env_vars.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_env_vars(&self, project_id: Uuid) -> ApiResult<Vec<EnvVar>> {
        let store = self.store.lock().unwrap();
        let mut vars: Vec<EnvVar> = store
            .env_vars
            .values()
            .filter(|v| v.project_id == project_id)
            .cloned()
            .collect();
        vars.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(vars)
    }

    async fn delete_env_var(&self, project_id: Uuid, env_var_id: Uuid) -> ApiResult<bool> {
        let mut store = self.store.lock().unwrap();
        let before = store.env_vars.len();
        store
            .env_vars
            .retain(|id, v| !(*id == env_var_id && v.project_id == project_id));
        Ok(store.env_vars.len() < before)
    }

    // --- Audit log ---

    async fn record_audit_log(&self, entry: CreateAuditLog) -> ApiResult<AuditLog> {
        let mut store = self.store.lock().unwrap();
        let record = AuditLog {
            id: Uuid::new_v4(),
            org_id: entry.org_id,
            actor_id: entry.actor_id,
            action: entry.action,
            resource: entry.resource,
            details: entry.details,
            created_at: Utc::now(),
        };
        store.audit_logs.push(record.clone());
        Ok(record)
    }

    async fn list_org_audit_logs(&self, org_id: Uuid) -> ApiResult<Vec<AuditLog>> {
        let store = self.store.lock().unwrap();
        let mut logs: Vec<AuditLog> = store
            .audit_logs
            .iter()
            .filter(|l| l.org_id == org_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        Ok(logs)
    }

    // --- Billing ---

    async fn seed_plan(&self, plan: BillingPlan) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        if store.plans.values().any(|p| p.slug == plan.slug) {
            return Ok(());
        }
        store.plans.insert(plan.id, plan);
        Ok(())
    }

    async fn list_active_plans(&self) -> ApiResult<Vec<BillingPlan>> {
        let store = self.store.lock().unwrap();
        let mut plans: Vec<BillingPlan> = store
            .plans
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.price_monthly);
        Ok(plans)
    }

    async fn get_plan_by_id(&self, id: Uuid) -> ApiResult<Option<BillingPlan>> {
        let store = self.store.lock().unwrap();
        Ok(store.plans.get(&id).cloned())
    }

    async fn get_plan_by_slug(&self, slug: &str) -> ApiResult<Option<BillingPlan>> {
        let store = self.store.lock().unwrap();
        Ok(store.plans.values().find(|p| p.slug == slug).cloned())
    }

    async fn current_subscription(
        &self,
        org_id: Uuid,
    ) -> ApiResult<Option<(Subscription, BillingPlan)>> {
        let store = self.store.lock().unwrap();
        let mut subscriptions: Vec<&Subscription> = store
            .subscriptions
            .values()
            .filter(|s| s.org_id == org_id && !s.status.is_terminal())
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        let latest = match subscriptions.last() {
            Some(s) => (*s).clone(),
            None => return Ok(None),
        };
        let plan = store
            .plans
            .get(&latest.plan_id)
            .cloned()
            .ok_or_else(|| ApiError::internal("Subscription references a missing plan"))?;
        Ok(Some((latest, plan)))
    }

    async fn create_subscription(&self, subscription: Subscription) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn update_subscription(&self, subscription: Subscription) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn create_invoice(&self, invoice: Invoice) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    async fn list_org_invoices(&self, org_id: Uuid) -> ApiResult<Vec<Invoice>> {
        let store = self.store.lock().unwrap();
        let mut invoices: Vec<Invoice> = store
            .invoices
            .values()
            .filter(|i| i.org_id == org_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    async fn get_invoice_by_external_id(&self, external_id: &str) -> ApiResult<Option<Invoice>> {
        let store = self.store.lock().unwrap();
        Ok(store
            .invoices
            .values()
            .find(|i| i.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn update_invoice(&self, invoice: Invoice) -> ApiResult<()> {
        let mut store = self.store.lock().unwrap();
        store.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    // --- Health ---

    async fn ping(&self) -> ApiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_email_is_a_constraint_violation() {
        let db = MemoryDatabaseAdapter::new();
        db.create_user(CreateUser {
            name: "Ada".to_string(),
            email: "ada@x.io".to_string(),
            ..CreateUser::default()
        })
        .await
        .unwrap();

        let err = db
            .create_user(CreateUser {
                name: "Other".to_string(),
                email: "ADA@x.io".to_string(),
                ..CreateUser::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Database(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn test_soft_deleted_users_are_invisible() {
        let db = MemoryDatabaseAdapter::new();
        let user = db
            .create_user(CreateUser {
                name: "Ada".to_string(),
                email: "ada@x.io".to_string(),
                ..CreateUser::default()
            })
            .await
            .unwrap();

        db.soft_delete_user(user.id).await.unwrap();
        assert!(db.get_user_by_id(user.id).await.unwrap().is_none());
        assert!(db.get_user_by_email("ada@x.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_refresh_token_is_compare_and_set() {
        let db = MemoryDatabaseAdapter::new();
        let hash = "h".repeat(64);
        db.create_refresh_token(RefreshToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: hash.clone(),
            family: Uuid::new_v4(),
            revoked: false,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            created_at: Utc::now(),
            revoked_at: None,
        })
        .await
        .unwrap();

        assert!(db.revoke_refresh_token(&hash).await.unwrap());
        // Second attempt observes the post-revocation state.
        assert!(!db.revoke_refresh_token(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_org_creation_always_has_an_owner() {
        let db = MemoryDatabaseAdapter::new();
        let owner = Uuid::new_v4();
        let (org, membership) = db
            .create_org_with_owner(
                CreateOrg {
                    name: "Acme".to_string(),
                    slug: "acme".to_string(),
                },
                owner,
            )
            .await
            .unwrap();

        assert_eq!(membership.org_id, org.id);
        assert_eq!(membership.user_id, owner);
        assert_eq!(membership.role, OrgRole::Owner);
        assert_eq!(db.count_org_owners(org.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_running_deployments_counted_per_org() {
        let db = MemoryDatabaseAdapter::new();
        let (org, _) = db
            .create_org_with_owner(
                CreateOrg {
                    name: "Acme".to_string(),
                    slug: "acme".to_string(),
                },
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        let project = db
            .create_project(CreateProject {
                org_id: org.id,
                name: "web".to_string(),
                description: None,
                repo_url: None,
            })
            .await
            .unwrap();

        for status in [
            crate::types::DeploymentStatus::Running,
            crate::types::DeploymentStatus::Running,
            crate::types::DeploymentStatus::Stopped,
        ] {
            db.create_deployment(CreateDeployment {
                project_id: project.id,
                version: "v1".to_string(),
                status,
                commit_sha: None,
            })
            .await
            .unwrap();
        }

        assert_eq!(db.count_running_deployments(org.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_env_var_upsert_replaces_value() {
        let db = MemoryDatabaseAdapter::new();
        let project_id = Uuid::new_v4();
        db.upsert_env_var(project_id, "PORT", "8080", false)
            .await
            .unwrap();
        let updated = db
            .upsert_env_var(project_id, "PORT", "9090", false)
            .await
            .unwrap();
        assert_eq!(updated.value, "9090");
        assert_eq!(db.list_env_vars(project_id).await.unwrap().len(), 1);
    }
}
