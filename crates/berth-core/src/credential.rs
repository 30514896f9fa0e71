//! One-shot credential tokens for email verification and password reset.
//!
//! Both flows share one pattern: 32 random bytes hex-encoded (the raw token,
//! sent exactly once in an email link), with only the SHA-256 digest stored
//! alongside a TTL and a `used_at` marker. Consumption is a single atomic
//! adapter operation, so the side effect happens at most once even with
//! concurrent consumers.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::RngCore;
use uuid::Uuid;

use crate::adapters::DatabaseAdapter;
use crate::error::{ApiError, ApiResult};
use crate::token::hash_token;
use crate::types::{CredentialToken, TokenPurpose};

/// Email verification links stay valid for a day.
pub const VERIFICATION_TOKEN_TTL_HOURS: i64 = 24;
/// Password reset links are short-lived.
pub const RESET_TOKEN_TTL_MINUTES: i64 = 15;

const TOKEN_BYTES: usize = 32;

/// Issues and consumes one-shot credential tokens.
pub struct CredentialTokenService {
    database: Arc<dyn DatabaseAdapter>,
}

impl CredentialTokenService {
    pub fn new(database: Arc<dyn DatabaseAdapter>) -> Self {
        Self { database }
    }

    /// Issue a token for the given purpose and return the raw value.
    /// The raw token leaves the process only inside the email link.
    pub async fn issue(&self, user_id: Uuid, purpose: TokenPurpose) -> ApiResult<String> {
        let raw = generate_raw_token();
        let ttl = match purpose {
            TokenPurpose::EmailVerification => Duration::hours(VERIFICATION_TOKEN_TTL_HOURS),
            TokenPurpose::PasswordReset => Duration::minutes(RESET_TOKEN_TTL_MINUTES),
        };
        let now = Utc::now();

        self.database
            .create_credential_token(CredentialToken {
                id: Uuid::new_v4(),
                user_id,
                token_hash: hash_token(&raw),
                purpose,
                expires_at: now + ttl,
                used_at: None,
                created_at: now,
            })
            .await?;

        Ok(raw)
    }

    /// Consume a verification token: marks it used and flips the principal's
    /// `email_verified` flag in one transaction. Returns the principal id.
    pub async fn verify_email(&self, raw: &str) -> ApiResult<Uuid> {
        self.database
            .consume_verification_token(&hash_token(raw))
            .await?
            .ok_or(ApiError::InvalidOrExpiredToken)
    }

    /// Consume a reset token: marks it used, replaces the password hash, and
    /// marks every other unused reset token for the same principal as used,
    /// all in one transaction. Returns the principal id.
    pub async fn reset_password(&self, raw: &str, new_password_hash: &str) -> ApiResult<Uuid> {
        self.database
            .consume_password_reset_token(&hash_token(raw), new_password_hash)
            .await?
            .ok_or(ApiError::InvalidOrExpiredToken)
    }
}

fn generate_raw_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryDatabaseAdapter;
    use crate::password;
    use crate::types::CreateUser;

    async fn setup() -> (CredentialTokenService, Arc<MemoryDatabaseAdapter>, Uuid) {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let user = db
            .create_user(CreateUser {
                name: "Ada".to_string(),
                email: "ada@x.io".to_string(),
                password_hash: password::hash_password("LovelaceBytes#9").unwrap(),
                ..CreateUser::default()
            })
            .await
            .unwrap();
        (
            CredentialTokenService::new(db.clone()),
            db,
            user.id,
        )
    }

    #[tokio::test]
    async fn test_verification_token_is_single_use() {
        let (service, db, user_id) = setup().await;
        let raw = service
            .issue(user_id, TokenPurpose::EmailVerification)
            .await
            .unwrap();

        let verified = service.verify_email(&raw).await.unwrap();
        assert_eq!(verified, user_id);
        assert!(db.get_user_by_id(user_id).await.unwrap().unwrap().email_verified);

        match service.verify_email(&raw).await {
            Err(ApiError::InvalidOrExpiredToken) => {}
            other => panic!("expected invalid_or_expired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let (service, _, _) = setup().await;
        assert!(service.verify_email("deadbeef").await.is_err());
    }

    #[tokio::test]
    async fn test_reset_invalidates_sibling_tokens() {
        let (service, db, user_id) = setup().await;
        let first = service
            .issue(user_id, TokenPurpose::PasswordReset)
            .await
            .unwrap();
        let second = service
            .issue(user_id, TokenPurpose::PasswordReset)
            .await
            .unwrap();

        let new_hash = password::hash_password("NewLovelace#10").unwrap();
        service.reset_password(&second, &new_hash).await.unwrap();

        let user = db.get_user_by_id(user_id).await.unwrap().unwrap();
        assert!(password::verify_password("NewLovelace#10", &user.password_hash));

        // The sibling issued earlier was invalidated by the successful reset.
        match service.reset_password(&first, &new_hash).await {
            Err(ApiError::InvalidOrExpiredToken) => {}
            other => panic!("expected invalid_or_expired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_token_kind_cannot_verify_email() {
        let (service, _, user_id) = setup().await;
        let raw = service
            .issue(user_id, TokenPurpose::PasswordReset)
            .await
            .unwrap();
        assert!(service.verify_email(&raw).await.is_err());
    }
}
