use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use berth_core::adapters::DatabaseAdapter;
use berth_core::error::{ApiError, ApiResult};
use berth_core::password;
use berth_core::provider::{
    AuthProvider, AuthTokens, Claims, LoginRequest, RegisterRequest, TokenPair,
};
use berth_core::token::TokenService;
use berth_core::types::{CreateUser, ROLE_USER};

/// Built-in auth provider: bcrypt credentials, HS256 access tokens, rotated
/// refresh tokens. The default when no external IdP is configured.
pub struct LocalProvider {
    database: Arc<dyn DatabaseAdapter>,
    tokens: Arc<TokenService>,
}

impl LocalProvider {
    pub fn new(database: Arc<dyn DatabaseAdapter>, tokens: Arc<TokenService>) -> Self {
        Self { database, tokens }
    }
}

#[async_trait]
impl AuthProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn register(&self, req: RegisterRequest) -> ApiResult<AuthTokens> {
        password::validate_password(&req.password)?;

        if self
            .database
            .get_user_by_email(&req.email)
            .await?
            .is_some()
        {
            return Err(ApiError::conflict("Email already exists"));
        }

        let password_hash = password::hash_password(&req.password)?;
        let user = self
            .database
            .create_user_with_role(
                CreateUser {
                    name: req.name,
                    email: req.email,
                    password_hash,
                    ..CreateUser::default()
                },
                ROLE_USER,
            )
            .await?;

        let roles = self.database.get_user_roles(user.id).await?;
        let pair = self
            .tokens
            .issue_pair(user.id, &user.email, &user.name, roles.clone())
            .await?;

        Ok(AuthTokens {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            user: user.to_profile(roles),
        })
    }

    async fn login(&self, req: LoginRequest) -> ApiResult<AuthTokens> {
        // Unknown email and wrong password are indistinguishable to callers.
        let user = self
            .database
            .get_user_by_email(&req.email)
            .await?
            .ok_or(ApiError::InvalidCredentials)?;

        if !password::verify_password(&req.password, &user.password_hash) {
            return Err(ApiError::InvalidCredentials);
        }

        let roles = self.database.get_user_roles(user.id).await?;
        let pair = self
            .tokens
            .issue_pair(user.id, &user.email, &user.name, roles.clone())
            .await?;

        Ok(AuthTokens {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            user: user.to_profile(roles),
        })
    }

    fn validate_token(&self, token: &str) -> ApiResult<Claims> {
        self.tokens.validate(token)
    }

    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        self.tokens.refresh(refresh_token).await
    }

    async fn logout(&self, user_id: Uuid) -> ApiResult<()> {
        self.tokens.revoke_all_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::adapters::MemoryDatabaseAdapter;
    use chrono::Duration;

    fn provider() -> LocalProvider {
        let db: Arc<dyn DatabaseAdapter> = Arc::new(MemoryDatabaseAdapter::new());
        let tokens = Arc::new(TokenService::new(
            "test-secret-key-that-is-long-enough",
            Duration::minutes(15),
            Duration::hours(168),
            db.clone(),
        ));
        LocalProvider::new(db, tokens)
    }

    fn register_req() -> RegisterRequest {
        RegisterRequest {
            name: "Ada".to_string(),
            email: "ada@x.io".to_string(),
            password: "LovelaceBytes#9".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let provider = provider();
        let registered = provider.register(register_req()).await.unwrap();
        assert_eq!(registered.user.email, "ada@x.io");
        assert_eq!(registered.user.roles, vec![ROLE_USER.to_string()]);
        assert_eq!(registered.token_type, "Bearer");

        let logged_in = provider
            .login(LoginRequest {
                email: "ada@x.io".to_string(),
                password: "LovelaceBytes#9".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(logged_in.user.id, registered.user.id);
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password() {
        let provider = provider();
        let result = provider
            .register(RegisterRequest {
                password: "short".to_string(),
                ..register_req()
            })
            .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn test_register_duplicate_email_conflicts() {
        let provider = provider();
        provider.register(register_req()).await.unwrap();
        let result = provider.register(register_req()).await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let provider = provider();
        provider.register(register_req()).await.unwrap();

        let unknown = provider
            .login(LoginRequest {
                email: "nobody@x.io".to_string(),
                password: "LovelaceBytes#9".to_string(),
            })
            .await
            .unwrap_err();
        let wrong = provider
            .login(LoginRequest {
                email: "ada@x.io".to_string(),
                password: "WrongPassword#1".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(unknown, ApiError::InvalidCredentials));
        assert!(matches!(wrong, ApiError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_validate_round_trips_claims() {
        let provider = provider();
        let tokens = provider.register(register_req()).await.unwrap();
        let claims = provider.validate_token(&tokens.access_token).unwrap();
        assert_eq!(claims.user_id, tokens.user.id);
        assert_eq!(claims.email, "ada@x.io");
    }
}
