//! Token service: HS256 access tokens and opaque refresh tokens with
//! family-based rotation and reuse detection.
//!
//! Refresh tokens are 32 random bytes, base64-url encoded for transport;
//! only the SHA-256 hex digest is ever persisted. Every row carries a family
//! id: the first issuance starts a fresh family, and each rotation inserts
//! the successor into the same family. Replaying an already-consumed token
//! revokes the entire family.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::adapters::DatabaseAdapter;
use crate::error::{ApiError, ApiResult};
use crate::provider::{Claims, TokenPair};
use crate::types::RefreshToken;

const REFRESH_TOKEN_BYTES: usize = 32;

/// Issues, validates, rotates, and revokes token pairs.
pub struct TokenService {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    database: Arc<dyn DatabaseAdapter>,
}

impl TokenService {
    pub fn new(
        secret: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
        database: Arc<dyn DatabaseAdapter>,
    ) -> Self {
        Self {
            secret: secret.into(),
            access_ttl,
            refresh_ttl,
            database,
        }
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Issue a fresh access + refresh pair, starting a new refresh family.
    pub async fn issue_pair(
        &self,
        user_id: Uuid,
        email: &str,
        name: &str,
        roles: Vec<String>,
    ) -> ApiResult<TokenPair> {
        let access_token = self.mint_access_token(user_id, email, name, roles)?;

        let raw_refresh = generate_refresh_token();
        let now = Utc::now();
        self.database
            .create_refresh_token(RefreshToken {
                id: Uuid::new_v4(),
                user_id,
                token_hash: hash_token(&raw_refresh),
                family: Uuid::new_v4(),
                revoked: false,
                expires_at: now + self.refresh_ttl,
                created_at: now,
                revoked_at: None,
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token: raw_refresh,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Rotate a refresh token.
    ///
    /// Reuse of a consumed token revokes its whole family. The transition
    /// from valid to revoked is a compare-and-set in the adapter, so two
    /// racing exchanges of the same token mint at most one new pair; the
    /// loser observes the post-revocation state and fails as reuse.
    pub async fn refresh(&self, raw_refresh: &str) -> ApiResult<TokenPair> {
        let token_hash = hash_token(raw_refresh);

        let stored = self
            .database
            .get_refresh_token_by_hash(&token_hash)
            .await?
            .ok_or(ApiError::InvalidToken)?;

        if stored.revoked {
            self.database.revoke_refresh_family(stored.family).await?;
            return Err(ApiError::TokenReuse);
        }

        if Utc::now() >= stored.expires_at {
            return Err(ApiError::ExpiredToken);
        }

        if !self.database.revoke_refresh_token(&token_hash).await? {
            // Lost the race to another consumer of the same token.
            self.database.revoke_refresh_family(stored.family).await?;
            return Err(ApiError::TokenReuse);
        }

        // Re-read the principal so role and profile changes take effect on
        // the next refresh.
        let user = self
            .database
            .get_user_by_id(stored.user_id)
            .await?
            .ok_or(ApiError::InvalidToken)?;
        let roles = self.database.get_user_roles(stored.user_id).await?;

        let access_token = self.mint_access_token(user.id, &user.email, &user.name, roles)?;

        let raw_next = generate_refresh_token();
        let now = Utc::now();
        self.database
            .create_refresh_token(RefreshToken {
                id: Uuid::new_v4(),
                user_id: stored.user_id,
                token_hash: hash_token(&raw_next),
                family: stored.family,
                revoked: false,
                expires_at: now + self.refresh_ttl,
                created_at: now,
                revoked_at: None,
            })
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token: raw_next,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    /// Validate an access token against this service's secret.
    pub fn validate(&self, token: &str) -> ApiResult<Claims> {
        decode_claims(token, &self.secret)
    }

    /// Revoke a single refresh token given its raw value.
    pub async fn revoke(&self, raw_refresh: &str) -> ApiResult<()> {
        self.database
            .revoke_refresh_token(&hash_token(raw_refresh))
            .await?;
        Ok(())
    }

    /// Revoke every refresh token for a principal (logout).
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> ApiResult<()> {
        self.database.revoke_all_refresh_tokens(user_id).await
    }

    /// Remove rows past expiry. Expiry is also checked at use time, so this
    /// sweep is storage hygiene, not a correctness requirement.
    pub async fn sweep_expired(&self) -> ApiResult<usize> {
        self.database.delete_expired_refresh_tokens().await
    }

    fn mint_access_token(
        &self,
        user_id: Uuid,
        email: &str,
        name: &str,
        roles: Vec<String>,
    ) -> ApiResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            user_id,
            email: email.to_string(),
            name: name.to_string(),
            roles,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ApiError::internal(format!("Failed to sign access token: {}", e)))
    }
}

/// Decode and verify an HS256 access token. Non-HMAC algorithms are rejected
/// by pinning the accepted algorithm set; an expired signature maps to
/// `expired_token` and every other invalidity to `invalid_token`.
pub fn decode_claims(token: &str, secret: &str) -> ApiResult<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::ExpiredToken,
        _ => ApiError::InvalidToken,
    })
}

/// Decode and verify an HS256 token, returning the raw claim set. Used by
/// the external-IdP provider, whose claim layout differs from ours and is
/// mapped explicitly at its boundary.
pub fn decode_raw_claims(token: &str, secret: &str) -> ApiResult<serde_json::Value> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::ExpiredToken,
        _ => ApiError::InvalidToken,
    })
}

/// SHA-256 hex digest of a token, the only form that touches storage.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate an opaque refresh token: 32 random bytes, base64-url encoded.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryDatabaseAdapter;
    use crate::types::CreateUser;

    async fn service_with_user() -> (TokenService, Uuid) {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let user = db
            .create_user(CreateUser {
                name: "Ada".to_string(),
                email: "ada@x.io".to_string(),
                password_hash: String::new(),
                ..CreateUser::default()
            })
            .await
            .unwrap();
        db.assign_role(user.id, "user").await.unwrap();
        let service = TokenService::new(
            "test-secret-key-that-is-long-enough",
            Duration::minutes(15),
            Duration::hours(168),
            db,
        );
        (service, user.id)
    }

    #[tokio::test]
    async fn test_jwt_round_trip_preserves_claims() {
        let (service, user_id) = service_with_user().await;
        let pair = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec!["user".to_string()])
            .await
            .unwrap();

        let claims = service.validate(&pair.access_token).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.email, "ada@x.io");
        assert_eq!(claims.name, "Ada");
        assert_eq!(claims.roles, vec!["user".to_string()]);
        assert!(!claims.jti.is_empty());
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_secret() {
        let (service, user_id) = service_with_user().await;
        let pair = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec![])
            .await
            .unwrap();

        match decode_claims(&pair.access_token, "another-secret") {
            Err(ApiError::InvalidToken) => {}
            other => panic!("expected invalid token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validate_maps_expiry() {
        let (_, user_id) = service_with_user().await;
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let expired = TokenService::new(
            "test-secret-key-that-is-long-enough",
            Duration::seconds(-30),
            Duration::hours(1),
            db,
        );
        let pair = expired
            .issue_pair(user_id, "ada@x.io", "Ada", vec![])
            .await
            .unwrap();

        match expired.validate(&pair.access_token) {
            Err(ApiError::ExpiredToken) => {}
            other => panic!("expected expired token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rotation_issues_new_pair_in_same_family() {
        let (service, user_id) = service_with_user().await;
        let first = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec!["user".to_string()])
            .await
            .unwrap();

        let second = service.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(first.refresh_token, second.refresh_token);

        // The rotated token works exactly once more.
        let third = service.refresh(&second.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, third.refresh_token);
    }

    #[tokio::test]
    async fn test_reuse_revokes_whole_family() {
        let (service, user_id) = service_with_user().await;
        let first = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec![])
            .await
            .unwrap();
        let second = service.refresh(&first.refresh_token).await.unwrap();

        // Replay of the consumed token: reuse detected.
        match service.refresh(&first.refresh_token).await {
            Err(ApiError::TokenReuse) => {}
            other => panic!("expected token reuse, got {:?}", other),
        }

        // The descendant was revoked transitively, and still reports reuse
        // rather than a generic invalid token.
        match service.refresh(&second.refresh_token).await {
            Err(ApiError::TokenReuse) => {}
            other => panic!("expected token reuse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_refresh_token_is_invalid() {
        let (service, _) = service_with_user().await;
        match service.refresh("bm90LWEtcmVhbC10b2tlbg==").await {
            Err(ApiError::InvalidToken) => {}
            other => panic!("expected invalid token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_revokes_all_families() {
        let (service, user_id) = service_with_user().await;
        let a = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec![])
            .await
            .unwrap();
        let b = service
            .issue_pair(user_id, "ada@x.io", "Ada", vec![])
            .await
            .unwrap();

        service.revoke_all_for_user(user_id).await.unwrap();

        assert!(service.refresh(&a.refresh_token).await.is_err());
        assert!(service.refresh(&b.refresh_token).await.is_err());
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        let digest = hash_token("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
