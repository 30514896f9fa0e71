use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

// ---------------------------------------------------------------------------
// HTTP wrappers
// ---------------------------------------------------------------------------

/// HTTP method enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

impl HttpMethod {
    /// Safe methods skip CSRF validation and never consume quota.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
        }
    }
}

/// Framework-agnostic request wrapper. The axum layer converts inbound
/// requests into this shape; everything below the dispatcher works on it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    /// Header names are lowercased at conversion time.
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Path parameters filled in by the dispatcher after route matching.
    pub params: HashMap<String, String>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            params: HashMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Extract a named cookie from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        crate::cookie::parse_cookie(self.header("cookie")?, name)
    }

    /// Bearer token from the `Authorization` header, if present.
    pub fn bearer_token(&self) -> Option<String> {
        let header = self.header("authorization")?;
        let (scheme, value) = header.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !value.is_empty() {
            Some(value.trim().to_string())
        } else {
            None
        }
    }

    /// Client IP for rate limiting and logging. Proxy headers first, then the
    /// transport address recorded by the server layer.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            return real_ip.to_string();
        }
        self.header("x-client-addr")
            .unwrap_or("unknown")
            .to_string()
    }

    /// Whether the request was terminated over TLS somewhere upstream.
    pub fn is_tls(&self) -> bool {
        self.header("x-forwarded-proto") == Some("https")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Path parameter parsed as a UUID, or `BAD_REQUEST`.
    pub fn uuid_param(&self, name: &str) -> ApiResult<Uuid> {
        let raw = self
            .param(name)
            .ok_or_else(|| ApiError::bad_request(format!("Missing {} parameter", name)))?;
        Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {} parameter", name)))
    }

    pub fn body_as_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.body {
            Some(bytes) => serde_json::from_slice(bytes),
            None => serde_json::from_slice(b"null"),
        }
    }
}

/// Framework-agnostic response wrapper.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Set-Cookie values, kept separate because a response may carry several.
    pub cookies: Vec<String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            cookies: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn json<T: Serialize>(status: u16, body: &T) -> ApiResult<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self {
            status,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]),
            cookies: Vec::new(),
            body: bytes,
        })
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )]),
            cookies: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    /// Temporary redirect, used by the OAuth flow.
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut response = Self::new(307);
        response
            .headers
            .insert("Location".to_string(), location.into());
        response
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookies.push(cookie.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// System-level role names, attached to users independently of any org.
pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_SUPER_ADMIN: &str = "super_admin";

/// Role of a principal within an organization. Power levels form a strict
/// order; authority checks compare power, never identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Viewer,
    Developer,
    Admin,
    Owner,
}

impl OrgRole {
    pub fn power(&self) -> u8 {
        match self {
            Self::Viewer => 1,
            Self::Developer => 2,
            Self::Admin => 3,
            Self::Owner => 4,
        }
    }

    /// `true` when this role carries at least the authority of `required`.
    pub fn has_permission(&self, required: OrgRole) -> bool {
        self.power() >= required.power()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Developer => "developer",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "developer" => Some(Self::Developer),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Principals
// ---------------------------------------------------------------------------

/// An authenticated principal. `password_hash` is empty for federated-only
/// accounts and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Public projection returned by auth and profile endpoints.
    pub fn to_profile(&self, roles: Vec<String>) -> UserProfile {
        UserProfile {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            avatar_url: self.avatar_url.clone(),
            email_verified: self.email_verified,
            roles,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateUser {
    /// Fixed id for IdP-synced principals; `None` generates one.
    pub id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Refresh-token row. Only the SHA-256 hex digest of the opaque token is
/// persisted; `family` groups every descendant of one initial issuance.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub family: Uuid,
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Purpose of a one-shot credential token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }
}

/// One-shot hashed token used for email verification and password reset.
#[derive(Debug, Clone)]
pub struct CredentialToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub purpose: TokenPurpose,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// OAuth accounts
// ---------------------------------------------------------------------------

/// A federated identity bound to exactly one principal.
/// `(provider, provider_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAccount {
    #[serde(skip_serializing)]
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub user_id: Uuid,
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateOAuthAccount {
    pub user_id: Uuid,
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Tenancy
// ---------------------------------------------------------------------------

/// A tenant organization. All domain data is scoped to exactly one org.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Org {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateOrg {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOrg {
    pub name: Option<String>,
    pub logo_url: Option<String>,
}

/// Binding of a principal to an org with a role. `(user_id, org_id)` unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: OrgRole,
    pub joined_at: DateTime<Utc>,
}

/// Membership joined with the member's public identity, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct MemberWithUser {
    #[serde(flatten)]
    pub membership: Membership,
    pub user: MemberUser,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Pending invitation to join an org. Valid while unaccepted and unexpired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgInvite {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub role: OrgRole,
    #[serde(skip_serializing)]
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    pub invited_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl OrgInvite {
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        self.accepted_at.is_none() && now < self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct CreateInvite {
    pub org_id: Uuid,
    pub email: String,
    pub role: OrgRole,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub invited_by: Uuid,
}

// ---------------------------------------------------------------------------
// Projects & deployments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateProject {
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub repo_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub description: Option<String>,
    pub repo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Running,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "building" => Some(Self::Building),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: String,
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateDeployment {
    pub project_id: Uuid,
    pub version: String,
    pub status: DeploymentStatus,
    pub commit_sha: Option<String>,
}

/// Project environment variable. The value is stored as provided; encryption
/// at rest is the job of the [`crate::secret::SecretStore`] seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAuditLog {
    pub org_id: Uuid,
    pub actor_id: Uuid,
    pub action: String,
    pub resource: String,
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

/// Subscription tier. A cap of `-1` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub price_monthly: i64,
    pub price_yearly: i64,
    pub currency: String,
    pub max_projects: i32,
    pub max_deployments: i32,
    pub max_members: i32,
    pub features: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Terminal subscriptions no longer influence plan resolution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub org_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub org_id: Uuid,
    pub subscription_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    /// Invoice id assigned by the payment provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Resource kinds subject to per-plan quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResource {
    Projects,
    Deployments,
    Members,
}

impl QuotaResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Deployments => "deployments",
            Self::Members => "members",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_power_ordering() {
        assert!(OrgRole::Owner.has_permission(OrgRole::Admin));
        assert!(OrgRole::Admin.has_permission(OrgRole::Admin));
        assert!(OrgRole::Developer.has_permission(OrgRole::Viewer));
        assert!(!OrgRole::Viewer.has_permission(OrgRole::Developer));
        assert!(!OrgRole::Admin.has_permission(OrgRole::Owner));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [
            OrgRole::Viewer,
            OrgRole::Developer,
            OrgRole::Admin,
            OrgRole::Owner,
        ] {
            assert_eq!(OrgRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(OrgRole::parse("root"), None);
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut req = ApiRequest::new(HttpMethod::Get, "/api/v1/users/me");
        req.headers
            .insert("authorization".to_string(), "Bearer abc.def.ghi".to_string());
        assert_eq!(req.bearer_token().as_deref(), Some("abc.def.ghi"));

        req.headers
            .insert("authorization".to_string(), "Basic dXNlcg==".to_string());
        assert_eq!(req.bearer_token(), None);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut req = ApiRequest::new(HttpMethod::Post, "/api/v1/auth/login");
        req.headers.insert(
            "x-forwarded-for".to_string(),
            "203.0.113.9, 10.0.0.1".to_string(),
        );
        assert_eq!(req.client_ip(), "203.0.113.9");
    }

    #[test]
    fn test_password_hash_never_serialized() {
        let user = User {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            email: "ada@x.io".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            avatar_url: None,
            email_verified: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("password_hash"));
    }

    #[test]
    fn test_subscription_terminal_states() {
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }
}
