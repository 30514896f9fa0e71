//! Auth provider abstraction.
//!
//! The control plane can authenticate against the built-in local provider
//! (bcrypt + HS256 JWTs + rotated refresh tokens) or proxy to an external
//! hosted identity provider. Both expose the same [`Claims`] shape so the
//! middleware chain and handlers never care which one is active.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::ApiResult;
use crate::types::UserProfile;

/// Verified projection of an access token, carried through the request
/// context. `sub` is the principal id in string form; `user_id` is the same
/// value parsed, so downstream code never re-parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Access + refresh pair returned by issue and rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Full authentication response: token pair plus the principal projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserProfile,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 2, max = 100, message = "name must be 2-100 characters"))]
    pub name: String,
    #[validate(email(message = "must be a valid email"))]
    pub email: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "must be a valid email"))]
    pub email: String,
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
}

/// Uniform contract over `{local, external-IdP}` authentication backends.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Provider identifier ("local" or "external").
    fn name(&self) -> &'static str;

    /// Create a new principal and return a token pair.
    async fn register(&self, req: RegisterRequest) -> ApiResult<AuthTokens>;

    /// Authenticate with email + password. Credential failures are uniform:
    /// the caller can never distinguish unknown-user from wrong-password.
    async fn login(&self, req: LoginRequest) -> ApiResult<AuthTokens>;

    /// Verify an access token and return its claims.
    fn validate_token(&self, token: &str) -> ApiResult<Claims>;

    /// Exchange a refresh token for a new pair (rotation).
    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair>;

    /// Invalidate every refresh token / session for the principal.
    /// Best-effort; never fatal to the logout request.
    async fn logout(&self, user_id: Uuid) -> ApiResult<()>;
}
