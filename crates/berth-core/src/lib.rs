//! # Berth Core
//!
//! Core abstractions for the Berth control-plane API: the entity model, the
//! response envelope and error taxonomy, environment-driven configuration,
//! the middleware chain, token and credential services, the auth provider
//! contract, and the persistence adapters.

pub mod adapters;
pub mod config;
pub mod context;
pub mod cookie;
pub mod credential;
pub mod email;
pub mod error;
pub mod middleware;
pub mod password;
pub mod plugin;
pub mod provider;
pub mod secret;
pub mod token;
pub mod types;

pub use adapters::{DatabaseAdapter, MemoryDatabaseAdapter};
#[cfg(feature = "sqlx-postgres")]
pub use adapters::PostgresAdapter;
pub use config::{AppConfig, AuthProviderKind, Environment};
pub use context::{OrgScope, RequestContext};
pub use credential::CredentialTokenService;
pub use email::{ConsoleEmailProvider, EmailMessage, EmailProvider};
pub use error::{
    ApiError, ApiResult, DatabaseError, Envelope, ErrorInfo, Meta, success, success_with_meta,
    validate_body,
};
pub use middleware::{
    CorsMiddleware, CsrfMiddleware, MemoryRateLimitStore, Middleware, RateLimitMiddleware,
    RateLimitStore, SecurityHeadersMiddleware,
};
pub use plugin::{Access, ApiPlugin, AppContext, Route, match_path};
pub use provider::{AuthProvider, AuthTokens, Claims, LoginRequest, RegisterRequest, TokenPair};
pub use secret::{PlaintextSecretStore, SecretStore};
pub use token::TokenService;
pub use types::{
    ApiRequest, ApiResponse, AuditLog, BillingCycle, BillingPlan, CreateAuditLog,
    CreateDeployment, CreateInvite, CreateOAuthAccount, CreateOrg, CreateProject, CreateUser,
    CredentialToken, Deployment, DeploymentStatus, EnvVar, HttpMethod, Invoice, InvoiceStatus,
    MemberUser, MemberWithUser, Membership, OAuthAccount, Org, OrgInvite, OrgRole, Project,
    QuotaResource, RefreshToken, Subscription, SubscriptionStatus, TokenPurpose, UpdateOrg,
    UpdateProject, UpdateUser, User, UserProfile,
};
