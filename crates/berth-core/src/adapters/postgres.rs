//! Postgres adapter backed by `sqlx`.
//!
//! Enum columns are stored as TEXT and parsed at the boundary; feature lists
//! and audit details are serialized JSON in TEXT columns. Composite
//! operations run inside SQL transactions. The schema lives in
//! `migrations/schema.sql` at the workspace root.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, DatabaseError};
use crate::types::{
    AuditLog, BillingPlan, BillingCycle, CreateAuditLog, CreateDeployment, CreateInvite,
    CreateOAuthAccount, CreateOrg, CreateProject, CreateUser, CredentialToken, Deployment,
    DeploymentStatus, EnvVar, Invoice, InvoiceStatus, MemberUser, MemberWithUser, Membership,
    OAuthAccount, Org, OrgInvite, OrgRole, Project, RefreshToken, Subscription,
    SubscriptionStatus, TokenPurpose, UpdateOrg, UpdateProject, UpdateUser, User,
};

use super::DatabaseAdapter;

/// Postgres-backed adapter with a bounded connection pool.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect with the standard pool bounds: 25 connections max, 10 idle
    /// minimum, 5-minute connection lifetime.
    pub async fn connect(database_url: &str) -> ApiResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .min_connections(10)
            .max_lifetime(Duration::from_secs(300))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_failure(what: &str, value: &str) -> ApiError {
    ApiError::Database(DatabaseError::Query(format!(
        "unexpected {} value: {}",
        what, value
    )))
}

fn user_from_row(row: &PgRow) -> ApiResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        avatar_url: row.try_get("avatar_url")?,
        email_verified: row.try_get("email_verified")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn refresh_token_from_row(row: &PgRow) -> ApiResult<RefreshToken> {
    Ok(RefreshToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        family: row.try_get("family")?,
        revoked: row.try_get("revoked")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn oauth_account_from_row(row: &PgRow) -> ApiResult<OAuthAccount> {
    Ok(OAuthAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        provider_id: row.try_get("provider_id")?,
        email: row.try_get("email")?,
        avatar_url: row.try_get("avatar_url")?,
        created_at: row.try_get("created_at")?,
    })
}

fn org_from_row(row: &PgRow) -> ApiResult<Org> {
    Ok(Org {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        logo_url: row.try_get("logo_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn membership_from_row(row: &PgRow) -> ApiResult<Membership> {
    let role: String = row.try_get("role")?;
    Ok(Membership {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        org_id: row.try_get("org_id")?,
        role: OrgRole::parse(&role).ok_or_else(|| parse_failure("role", &role))?,
        joined_at: row.try_get("joined_at")?,
    })
}

fn invite_from_row(row: &PgRow) -> ApiResult<OrgInvite> {
    let role: String = row.try_get("role")?;
    Ok(OrgInvite {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        email: row.try_get("email")?,
        role: OrgRole::parse(&role).ok_or_else(|| parse_failure("role", &role))?,
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        accepted_at: row.try_get("accepted_at")?,
        invited_by: row.try_get("invited_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn project_from_row(row: &PgRow) -> ApiResult<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        repo_url: row.try_get("repo_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn deployment_from_row(row: &PgRow) -> ApiResult<Deployment> {
    let status: String = row.try_get("status")?;
    Ok(Deployment {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        version: row.try_get("version")?,
        status: DeploymentStatus::parse(&status)
            .ok_or_else(|| parse_failure("deployment status", &status))?,
        commit_sha: row.try_get("commit_sha")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn env_var_from_row(row: &PgRow) -> ApiResult<EnvVar> {
    Ok(EnvVar {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        is_secret: row.try_get("is_secret")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plan_from_row(row: &PgRow) -> ApiResult<BillingPlan> {
    let features_raw: String = row.try_get("features")?;
    Ok(BillingPlan {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        price_monthly: row.try_get("price_monthly")?,
        price_yearly: row.try_get("price_yearly")?,
        currency: row.try_get("currency")?,
        max_projects: row.try_get("max_projects")?,
        max_deployments: row.try_get("max_deployments")?,
        max_members: row.try_get("max_members")?,
        features: serde_json::from_str(&features_raw).unwrap_or_default(),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> ApiResult<Subscription> {
    let status: String = row.try_get("status")?;
    let cycle: String = row.try_get("billing_cycle")?;
    Ok(Subscription {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        plan_id: row.try_get("plan_id")?,
        status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| parse_failure("subscription status", &status))?,
        billing_cycle: BillingCycle::parse(&cycle)
            .ok_or_else(|| parse_failure("billing cycle", &cycle))?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancelled_at: row.try_get("cancelled_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn invoice_from_row(row: &PgRow) -> ApiResult<Invoice> {
    let status: String = row.try_get("status")?;
    Ok(Invoice {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        subscription_id: row.try_get("subscription_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: InvoiceStatus::parse(&status)
            .ok_or_else(|| parse_failure("invoice status", &status))?,
        due_date: row.try_get("due_date")?,
        paid_at: row.try_get("paid_at")?,
        external_id: row.try_get("external_id")?,
        payment_url: row.try_get("payment_url")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    // --- Users ---

    async fn create_user(&self, user: CreateUser) -> ApiResult<User> {
        let row = sqlx::query(
            r#"INSERT INTO users (id, name, email, password_hash, avatar_url, email_verified)
               VALUES ($1, $2, lower($3), $4, $5, $6)
               RETURNING *"#,
        )
        .bind(user.id.unwrap_or_else(Uuid::new_v4))
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.avatar_url)
        .bind(user.email_verified)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn create_user_with_role(&self, user: CreateUser, role: &str) -> ApiResult<User> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"INSERT INTO users (id, name, email, password_hash, avatar_url, email_verified)
               VALUES ($1, $2, lower($3), $4, $5, $6)
               RETURNING *"#,
        )
        .bind(user.id.unwrap_or_else(Uuid::new_v4))
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.avatar_url)
        .bind(user.email_verified)
        .fetch_one(&mut *tx)
        .await?;
        let created = user_from_row(&row)?;

        sqlx::query(
            r#"INSERT INTO user_roles (user_id, role_id)
               SELECT $1, id FROM roles WHERE name = $2
               ON CONFLICT DO NOTHING"#,
        )
        .bind(created.id)
        .bind(role)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn get_user_by_id(&self, id: Uuid) -> ApiResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> ApiResult<Option<User>> {
        let row =
            sqlx::query("SELECT * FROM users WHERE email = lower($1) AND deleted_at IS NULL")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user(&self, id: Uuid, update: UpdateUser) -> ApiResult<User> {
        let row = sqlx::query(
            r#"UPDATE users
               SET name = COALESCE($2, name),
                   email = COALESCE(lower($3), email),
                   avatar_url = COALESCE($4, avatar_url),
                   updated_at = now()
               WHERE id = $1 AND deleted_at IS NULL
               RETURNING *"#,
        )
        .bind(id)
        .bind(&update.name)
        .bind(&update.email)
        .bind(&update.avatar_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
        user_from_row(&row)
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> ApiResult<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_email_verified(&self, id: Uuid, verified: bool) -> ApiResult<()> {
        sqlx::query("UPDATE users SET email_verified = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(verified)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_avatar_url(&self, id: Uuid, avatar_url: &str) -> ApiResult<()> {
        sqlx::query("UPDATE users SET avatar_url = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(avatar_url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn soft_delete_user(&self, id: Uuid) -> ApiResult<()> {
        sqlx::query("UPDATE users SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_users(
        &self,
        search: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> ApiResult<(Vec<User>, u64)> {
        let pattern = search.map(|s| format!("%{}%", s.to_lowercase()));
        let total: i64 = sqlx::query_scalar(
            r#"SELECT count(*) FROM users
               WHERE deleted_at IS NULL
                 AND ($1::text IS NULL OR lower(name) LIKE $1 OR email LIKE $1)"#,
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let page = page.max(1);
        let rows = sqlx::query(
            r#"SELECT * FROM users
               WHERE deleted_at IS NULL
                 AND ($1::text IS NULL OR lower(name) LIKE $1 OR email LIKE $1)
               ORDER BY created_at
               LIMIT $2 OFFSET $3"#,
        )
        .bind(&pattern)
        .bind(per_page as i64)
        .bind(((page - 1) * per_page) as i64)
        .fetch_all(&self.pool)
        .await?;

        let users = rows
            .iter()
            .map(user_from_row)
            .collect::<ApiResult<Vec<_>>>()?;
        Ok((users, total as u64))
    }

    // --- System roles ---

    async fn assign_role(&self, user_id: Uuid, role: &str) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO user_roles (user_id, role_id)
               SELECT $1, id FROM roles WHERE name = $2
               ON CONFLICT DO NOTHING"#,
        )
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user_roles(&self, user_id: Uuid) -> ApiResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"SELECT roles.name FROM roles
               JOIN user_roles ON user_roles.role_id = roles.id
               WHERE user_roles.user_id = $1
               ORDER BY roles.name"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- Refresh tokens ---

    async fn create_refresh_token(&self, token: RefreshToken) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO refresh_tokens
                   (id, user_id, token_hash, family, revoked, expires_at, created_at, revoked_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.family)
        .bind(token.revoked)
        .bind(token.expires_at)
        .bind(token.created_at)
        .bind(token.revoked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_refresh_token_by_hash(&self, token_hash: &str) -> ApiResult<Option<RefreshToken>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(refresh_token_from_row).transpose()
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"UPDATE refresh_tokens SET revoked = true, revoked_at = now()
               WHERE token_hash = $1 AND revoked = false"#,
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_refresh_family(&self, family: Uuid) -> ApiResult<()> {
        sqlx::query(
            r#"UPDATE refresh_tokens SET revoked = true, revoked_at = now()
               WHERE family = $1 AND revoked = false"#,
        )
        .bind(family)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> ApiResult<()> {
        sqlx::query(
            r#"UPDATE refresh_tokens SET revoked = true, revoked_at = now()
               WHERE user_id = $1 AND revoked = false"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_refresh_tokens(&self) -> ApiResult<usize> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    // --- Credential tokens ---

    async fn create_credential_token(&self, token: CredentialToken) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO credential_tokens
                   (id, user_id, token_hash, purpose, expires_at, used_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.purpose.as_str())
        .bind(token.expires_at)
        .bind(token.used_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_verification_token(&self, token_hash: &str) -> ApiResult<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let user_id: Option<Uuid> = sqlx::query_scalar(
            r#"UPDATE credential_tokens SET used_at = now()
               WHERE token_hash = $1 AND purpose = 'email_verification'
                 AND used_at IS NULL AND expires_at > now()
               RETURNING user_id"#,
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user_id) = user_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE users SET email_verified = true, updated_at = now() WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(user_id))
    }

    async fn consume_password_reset_token(
        &self,
        token_hash: &str,
        new_password_hash: &str,
    ) -> ApiResult<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let consumed: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"UPDATE credential_tokens SET used_at = now()
               WHERE token_hash = $1 AND purpose = 'password_reset'
                 AND used_at IS NULL AND expires_at > now()
               RETURNING id, user_id"#,
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((token_id, user_id)) = consumed else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(user_id)
            .bind(new_password_hash)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"UPDATE credential_tokens SET used_at = now()
               WHERE user_id = $1 AND purpose = 'password_reset'
                 AND used_at IS NULL AND id != $2"#,
        )
        .bind(user_id)
        .bind(token_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(user_id))
    }

    // --- OAuth accounts ---

    async fn create_oauth_account(&self, account: CreateOAuthAccount) -> ApiResult<OAuthAccount> {
        let row = sqlx::query(
            r#"INSERT INTO oauth_accounts (id, user_id, provider, provider_id, email, avatar_url)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(account.user_id)
        .bind(&account.provider)
        .bind(&account.provider_id)
        .bind(&account.email)
        .bind(&account.avatar_url)
        .fetch_one(&self.pool)
        .await?;
        oauth_account_from_row(&row)
    }

    async fn get_oauth_account(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> ApiResult<Option<OAuthAccount>> {
        let row =
            sqlx::query("SELECT * FROM oauth_accounts WHERE provider = $1 AND provider_id = $2")
                .bind(provider)
                .bind(provider_id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(oauth_account_from_row).transpose()
    }

    async fn list_oauth_accounts(&self, user_id: Uuid) -> ApiResult<Vec<OAuthAccount>> {
        let rows =
            sqlx::query("SELECT * FROM oauth_accounts WHERE user_id = $1 ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(oauth_account_from_row).collect()
    }

    async fn count_oauth_accounts(&self, user_id: Uuid) -> ApiResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM oauth_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn delete_oauth_account(&self, user_id: Uuid, provider: &str) -> ApiResult<bool> {
        let result =
            sqlx::query("DELETE FROM oauth_accounts WHERE user_id = $1 AND provider = $2")
                .bind(user_id)
                .bind(provider)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Orgs ---

    async fn create_org_with_owner(
        &self,
        org: CreateOrg,
        owner_id: Uuid,
    ) -> ApiResult<(Org, Membership)> {
        let mut tx = self.pool.begin().await?;

        let org_row = sqlx::query(
            "INSERT INTO orgs (id, name, slug) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&org.name)
        .bind(&org.slug)
        .fetch_one(&mut *tx)
        .await?;
        let org_record = org_from_row(&org_row)?;

        let membership_row = sqlx::query(
            r#"INSERT INTO memberships (id, user_id, org_id, role)
               VALUES ($1, $2, $3, 'owner')
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(org_record.id)
        .fetch_one(&mut *tx)
        .await?;
        let membership = membership_from_row(&membership_row)?;

        tx.commit().await?;
        Ok((org_record, membership))
    }

    async fn get_org_by_id(&self, id: Uuid) -> ApiResult<Option<Org>> {
        let row = sqlx::query("SELECT * FROM orgs WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn get_org_by_slug(&self, slug: &str) -> ApiResult<Option<Org>> {
        let row = sqlx::query("SELECT * FROM orgs WHERE slug = $1 AND deleted_at IS NULL")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn update_org(&self, id: Uuid, update: UpdateOrg) -> ApiResult<Org> {
        let row = sqlx::query(
            r#"UPDATE orgs
               SET name = COALESCE($2, name),
                   logo_url = COALESCE($3, logo_url),
                   updated_at = now()
               WHERE id = $1 AND deleted_at IS NULL
               RETURNING *"#,
        )
        .bind(id)
        .bind(&update.name)
        .bind(&update.logo_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Organization not found"))?;
        org_from_row(&row)
    }

    async fn soft_delete_org(&self, id: Uuid) -> ApiResult<()> {
        sqlx::query("UPDATE orgs SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_user_orgs(&self, user_id: Uuid) -> ApiResult<Vec<Org>> {
        let rows = sqlx::query(
            r#"SELECT orgs.* FROM orgs
               JOIN memberships ON memberships.org_id = orgs.id
               WHERE memberships.user_id = $1 AND orgs.deleted_at IS NULL
               ORDER BY orgs.created_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(org_from_row).collect()
    }

    // --- Memberships ---

    async fn get_membership(&self, org_id: Uuid, user_id: Uuid) -> ApiResult<Option<Membership>> {
        let row = sqlx::query("SELECT * FROM memberships WHERE org_id = $1 AND user_id = $2")
            .bind(org_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(membership_from_row).transpose()
    }

    async fn get_membership_by_id(&self, id: Uuid) -> ApiResult<Option<Membership>> {
        let row = sqlx::query("SELECT * FROM memberships WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(membership_from_row).transpose()
    }

    async fn update_membership_role(&self, id: Uuid, role: OrgRole) -> ApiResult<Membership> {
        let row = sqlx::query("UPDATE memberships SET role = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::not_found("Membership not found"))?;
        membership_from_row(&row)
    }

    async fn delete_membership(&self, id: Uuid) -> ApiResult<()> {
        sqlx::query("DELETE FROM memberships WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_org_members(&self, org_id: Uuid) -> ApiResult<Vec<MemberWithUser>> {
        let rows = sqlx::query(
            r#"SELECT memberships.*, users.name AS user_name, users.email AS user_email,
                      users.avatar_url AS user_avatar_url
               FROM memberships
               JOIN users ON users.id = memberships.user_id
               WHERE memberships.org_id = $1
               ORDER BY memberships.joined_at"#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let membership = membership_from_row(row)?;
                Ok(MemberWithUser {
                    user: MemberUser {
                        id: membership.user_id,
                        name: row.try_get("user_name")?,
                        email: row.try_get("user_email")?,
                        avatar_url: row.try_get("user_avatar_url")?,
                    },
                    membership,
                })
            })
            .collect()
    }

    async fn count_org_members(&self, org_id: Uuid) -> ApiResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM memberships WHERE org_id = $1")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn count_org_owners(&self, org_id: Uuid) -> ApiResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM memberships WHERE org_id = $1 AND role = 'owner'",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    // --- Invites ---

    async fn create_invite(&self, invite: CreateInvite) -> ApiResult<OrgInvite> {
        let row = sqlx::query(
            r#"INSERT INTO org_invites (id, org_id, email, role, token, expires_at, invited_by)
               VALUES ($1, $2, lower($3), $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(invite.org_id)
        .bind(&invite.email)
        .bind(invite.role.as_str())
        .bind(&invite.token)
        .bind(invite.expires_at)
        .bind(invite.invited_by)
        .fetch_one(&self.pool)
        .await?;
        invite_from_row(&row)
    }

    async fn get_invite_by_id(&self, id: Uuid) -> ApiResult<Option<OrgInvite>> {
        let row = sqlx::query("SELECT * FROM org_invites WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(invite_from_row).transpose()
    }

    async fn get_invite_by_token(&self, token: &str) -> ApiResult<Option<OrgInvite>> {
        let row = sqlx::query("SELECT * FROM org_invites WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(invite_from_row).transpose()
    }

    async fn get_pending_invite(&self, org_id: Uuid, email: &str) -> ApiResult<Option<OrgInvite>> {
        let row = sqlx::query(
            r#"SELECT * FROM org_invites
               WHERE org_id = $1 AND email = lower($2)
                 AND accepted_at IS NULL AND expires_at > now()"#,
        )
        .bind(org_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(invite_from_row).transpose()
    }

    async fn accept_invite(&self, invite_id: Uuid, user_id: Uuid) -> ApiResult<Membership> {
        let mut tx = self.pool.begin().await?;

        let invite_row = sqlx::query(
            r#"UPDATE org_invites SET accepted_at = now()
               WHERE id = $1 AND accepted_at IS NULL
               RETURNING *"#,
        )
        .bind(invite_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::not_found("Invitation not found"))?;
        let invite = invite_from_row(&invite_row)?;

        let membership_row = sqlx::query(
            r#"INSERT INTO memberships (id, user_id, org_id, role)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(invite.org_id)
        .bind(invite.role.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let membership = membership_from_row(&membership_row)?;

        tx.commit().await?;
        Ok(membership)
    }

    async fn list_org_invites(&self, org_id: Uuid) -> ApiResult<Vec<OrgInvite>> {
        let rows = sqlx::query("SELECT * FROM org_invites WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(invite_from_row).collect()
    }

    async fn delete_invite(&self, id: Uuid) -> ApiResult<()> {
        sqlx::query("DELETE FROM org_invites WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Projects ---

    async fn create_project(&self, project: CreateProject) -> ApiResult<Project> {
        let row = sqlx::query(
            r#"INSERT INTO projects (id, org_id, name, description, repo_url)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(project.org_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.repo_url)
        .fetch_one(&self.pool)
        .await?;
        project_from_row(&row)
    }

    async fn get_project(&self, org_id: Uuid, project_id: Uuid) -> ApiResult<Option<Project>> {
        let row = sqlx::query(
            "SELECT * FROM projects WHERE id = $1 AND org_id = $2 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_org_projects(&self, org_id: Uuid) -> ApiResult<Vec<Project>> {
        let rows = sqlx::query(
            r#"SELECT * FROM projects
               WHERE org_id = $1 AND deleted_at IS NULL
               ORDER BY created_at"#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn update_project(&self, project_id: Uuid, update: UpdateProject) -> ApiResult<Project> {
        let row = sqlx::query(
            r#"UPDATE projects
               SET name = COALESCE($2, name),
                   description = COALESCE($3, description),
                   repo_url = COALESCE($4, repo_url),
                   updated_at = now()
               WHERE id = $1 AND deleted_at IS NULL
               RETURNING *"#,
        )
        .bind(project_id)
        .bind(&update.name)
        .bind(&update.description)
        .bind(&update.repo_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Project not found"))?;
        project_from_row(&row)
    }

    async fn soft_delete_project(&self, project_id: Uuid) -> ApiResult<()> {
        sqlx::query(
            "UPDATE projects SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_org_projects(&self, org_id: Uuid) -> ApiResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM projects WHERE org_id = $1 AND deleted_at IS NULL",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    // --- Deployments ---

    async fn create_deployment(&self, deployment: CreateDeployment) -> ApiResult<Deployment> {
        let row = sqlx::query(
            r#"INSERT INTO deployments (id, project_id, version, status, commit_sha)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(deployment.project_id)
        .bind(&deployment.version)
        .bind(deployment.status.as_str())
        .bind(&deployment.commit_sha)
        .fetch_one(&self.pool)
        .await?;
        deployment_from_row(&row)
    }

    async fn list_project_deployments(&self, project_id: Uuid) -> ApiResult<Vec<Deployment>> {
        let rows =
            sqlx::query("SELECT * FROM deployments WHERE project_id = $1 ORDER BY created_at")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn count_running_deployments(&self, org_id: Uuid) -> ApiResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT count(*) FROM deployments
               JOIN projects ON projects.id = deployments.project_id
               WHERE projects.org_id = $1 AND projects.deleted_at IS NULL
                 AND deployments.status = 'running'"#,
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    // --- Env vars ---

    async fn upsert_env_var(
        &self,
        project_id: Uuid,
        key: &str,
        value: &str,
        is_secret: bool,
    ) -> ApiResult<EnvVar> {
        let row = sqlx::query(
            r#"INSERT INTO env_vars (id, project_id, key, value, is_secret)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (project_id, key)
               DO UPDATE SET value = $4, is_secret = $5, updated_at = now()
               RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(key)
        .bind(value)
        .bind(is_secret)
        .fetch_one(&self.pool)
        .await?;
        env_var_from_row(&row)
    }

    async fn list_env_vars(&self, project_id: Uuid) -> ApiResult<Vec<EnvVar>> {
        let rows = sqlx::query("SELECT * FROM env_vars WHERE project_id = $1 ORDER BY key")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(env_var_from_row).collect()
    }

    async fn delete_env_var(&self, project_id: Uuid, env_var_id: Uuid) -> ApiResult<bool> {
        let result = sqlx::query("DELETE FROM env_vars WHERE id = $1 AND project_id = $2")
            .bind(env_var_id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- Audit log ---

    async fn record_audit_log(&self, entry: CreateAuditLog) -> ApiResult<AuditLog> {
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string());
        let row = sqlx::query(
            r#"INSERT INTO audit_logs (id, org_id, actor_id, action, resource, details)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING id, org_id, actor_id, action, resource, details, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.org_id)
        .bind(entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&details)
        .fetch_one(&self.pool)
        .await?;

        let details_raw: Option<String> = row.try_get("details")?;
        Ok(AuditLog {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            actor_id: row.try_get("actor_id")?,
            action: row.try_get("action")?,
            resource: row.try_get("resource")?,
            details: details_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_org_audit_logs(&self, org_id: Uuid) -> ApiResult<Vec<AuditLog>> {
        let rows = sqlx::query("SELECT * FROM audit_logs WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let details_raw: Option<String> = row.try_get("details")?;
                Ok(AuditLog {
                    id: row.try_get("id")?,
                    org_id: row.try_get("org_id")?,
                    actor_id: row.try_get("actor_id")?,
                    action: row.try_get("action")?,
                    resource: row.try_get("resource")?,
                    details: details_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // --- Billing ---

    async fn seed_plan(&self, plan: BillingPlan) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO billing_plans
                   (id, name, slug, price_monthly, price_yearly, currency,
                    max_projects, max_deployments, max_members, features, is_active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (slug) DO NOTHING"#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.slug)
        .bind(plan.price_monthly)
        .bind(plan.price_yearly)
        .bind(&plan.currency)
        .bind(plan.max_projects)
        .bind(plan.max_deployments)
        .bind(plan.max_members)
        .bind(serde_json::to_string(&plan.features)?)
        .bind(plan.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active_plans(&self) -> ApiResult<Vec<BillingPlan>> {
        let rows = sqlx::query(
            "SELECT * FROM billing_plans WHERE is_active = true ORDER BY price_monthly",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(plan_from_row).collect()
    }

    async fn get_plan_by_id(&self, id: Uuid) -> ApiResult<Option<BillingPlan>> {
        let row = sqlx::query("SELECT * FROM billing_plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn get_plan_by_slug(&self, slug: &str) -> ApiResult<Option<BillingPlan>> {
        let row = sqlx::query("SELECT * FROM billing_plans WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn current_subscription(
        &self,
        org_id: Uuid,
    ) -> ApiResult<Option<(Subscription, BillingPlan)>> {
        let row = sqlx::query(
            r#"SELECT * FROM subscriptions
               WHERE org_id = $1 AND status NOT IN ('cancelled', 'expired')
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let subscription = subscription_from_row(&row)?;
        let plan = self
            .get_plan_by_id(subscription.plan_id)
            .await?
            .ok_or_else(|| ApiError::internal("Subscription references a missing plan"))?;
        Ok(Some((subscription, plan)))
    }

    async fn create_subscription(&self, subscription: Subscription) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO subscriptions
                   (id, org_id, plan_id, status, billing_cycle,
                    current_period_start, current_period_end, cancelled_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(subscription.id)
        .bind(subscription.org_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_subscription(&self, subscription: Subscription) -> ApiResult<()> {
        sqlx::query(
            r#"UPDATE subscriptions
               SET status = $2, billing_cycle = $3, current_period_start = $4,
                   current_period_end = $5, cancelled_at = $6
               WHERE id = $1"#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_invoice(&self, invoice: Invoice) -> ApiResult<()> {
        sqlx::query(
            r#"INSERT INTO invoices
                   (id, org_id, subscription_id, amount, currency, status,
                    due_date, paid_at, external_id, payment_url, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(invoice.id)
        .bind(invoice.org_id)
        .bind(invoice.subscription_id)
        .bind(invoice.amount)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(&invoice.external_id)
        .bind(&invoice.payment_url)
        .bind(invoice.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_org_invoices(&self, org_id: Uuid) -> ApiResult<Vec<Invoice>> {
        let rows = sqlx::query("SELECT * FROM invoices WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(invoice_from_row).collect()
    }

    async fn get_invoice_by_external_id(&self, external_id: &str) -> ApiResult<Option<Invoice>> {
        let row = sqlx::query("SELECT * FROM invoices WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn update_invoice(&self, invoice: Invoice) -> ApiResult<()> {
        sqlx::query(
            r#"UPDATE invoices
               SET status = $2, paid_at = $3, external_id = $4, payment_url = $5
               WHERE id = $1"#,
        )
        .bind(invoice.id)
        .bind(invoice.status.as_str())
        .bind(invoice.paid_at)
        .bind(&invoice.external_id)
        .bind(&invoice.payment_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Health ---

    async fn ping(&self) -> ApiResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
