use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use berth_core::config::ExternalIdpConfig;
use berth_core::error::{ApiError, ApiResult};
use berth_core::provider::{
    AuthProvider, AuthTokens, Claims, LoginRequest, RegisterRequest, TokenPair,
};
use berth_core::types::UserProfile;

const IDP_TIMEOUT: Duration = Duration::from_secs(10);

/// Auth provider backed by an external hosted identity service.
///
/// Register, login, and refresh are proxied to the IdP's REST endpoints with
/// the configured API key; access tokens are validated locally against the
/// shared HS256 secret. Role changes and profile data flow back through the
/// user-sync webhook.
pub struct ExternalIdpProvider {
    config: ExternalIdpConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct IdpSignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct IdpTokenRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct IdpTokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: i64,
    refresh_token: String,
    user: IdpUser,
}

#[derive(Debug, Deserialize)]
struct IdpUser {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    user_metadata: serde_json::Value,
    #[serde(default)]
    created_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct IdpErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
    #[serde(default, rename = "msg")]
    message: String,
}

impl IdpErrorResponse {
    fn best_message(self, status: u16) -> String {
        [self.error_description, self.message, self.error]
            .into_iter()
            .find(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP {}", status))
    }
}

impl ExternalIdpProvider {
    pub fn new(config: ExternalIdpConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(IDP_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn token_request<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<Result<IdpTokenResponse, (u16, String)>> {
        let url = format!("{}{}", self.config.url, path);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::internal(format!("Identity provider request failed: {}", e)))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::internal(format!("Identity provider response failed: {}", e)))?;

        if status >= 500 {
            return Err(ApiError::internal(format!(
                "Identity provider error: HTTP {}",
                status
            )));
        }
        if status >= 400 {
            let err: IdpErrorResponse = serde_json::from_slice(&bytes).unwrap_or_default();
            return Ok(Err((status, err.best_message(status))));
        }

        let parsed: IdpTokenResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::internal(format!("Invalid identity provider response: {}", e)))?;
        Ok(Ok(parsed))
    }

    fn to_auth_tokens(&self, resp: IdpTokenResponse) -> ApiResult<AuthTokens> {
        let user_id = Uuid::parse_str(&resp.user.id).map_err(|_| ApiError::InvalidToken)?;
        let name = resp.user.user_metadata["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let created_at = DateTime::parse_from_rfc3339(&resp.user.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(AuthTokens {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            token_type: if resp.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                resp.token_type
            },
            expires_in: resp.expires_in,
            user: UserProfile {
                id: user_id,
                name,
                email: resp.user.email,
                avatar_url: None,
                email_verified: false,
                roles: vec!["authenticated".to_string()],
                created_at,
            },
        })
    }
}

#[async_trait]
impl AuthProvider for ExternalIdpProvider {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn register(&self, req: RegisterRequest) -> ApiResult<AuthTokens> {
        let body = IdpSignUpRequest {
            email: &req.email,
            password: &req.password,
            data: serde_json::json!({ "name": req.name }),
        };
        match self.token_request("/auth/v1/signup", &body).await? {
            Ok(resp) => self.to_auth_tokens(resp),
            Err((status, message)) => {
                if status == 409 || message.to_lowercase().contains("already registered") {
                    Err(ApiError::conflict("Email already exists"))
                } else {
                    Err(ApiError::bad_request(message))
                }
            }
        }
    }

    async fn login(&self, req: LoginRequest) -> ApiResult<AuthTokens> {
        let body = IdpTokenRequest {
            email: Some(&req.email),
            password: Some(&req.password),
            refresh_token: None,
        };
        match self
            .token_request("/auth/v1/token?grant_type=password", &body)
            .await?
        {
            Ok(resp) => self.to_auth_tokens(resp),
            // Uniform failure regardless of what the IdP said.
            Err(_) => Err(ApiError::InvalidCredentials),
        }
    }

    fn validate_token(&self, token: &str) -> ApiResult<Claims> {
        decode_idp_claims(token, &self.config.jwt_secret)
    }

    async fn refresh(&self, refresh_token: &str) -> ApiResult<TokenPair> {
        let body = IdpTokenRequest {
            email: None,
            password: None,
            refresh_token: Some(refresh_token),
        };
        match self
            .token_request("/auth/v1/token?grant_type=refresh_token", &body)
            .await?
        {
            Ok(resp) => Ok(TokenPair {
                access_token: resp.access_token,
                refresh_token: resp.refresh_token,
                token_type: if resp.token_type.is_empty() {
                    "Bearer".to_string()
                } else {
                    resp.token_type
                },
                expires_in: resp.expires_in,
            }),
            Err(_) => Err(ApiError::InvalidToken),
        }
    }

    async fn logout(&self, user_id: Uuid) -> ApiResult<()> {
        // Best-effort session revocation through the admin API. A 4xx (e.g.
        // no active sessions) is tolerated; only a provider-side failure
        // surfaces.
        let url = format!("{}/auth/v1/admin/users/{}/factors", self.config.url, user_id);
        let response = self
            .client
            .delete(&url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ApiError::internal(format!("Identity provider request failed: {}", e)))?;

        if response.status().as_u16() >= 500 {
            return Err(ApiError::internal(format!(
                "Identity provider error: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Decode an IdP-issued HS256 token and map its claims onto the shared
/// [`Claims`] shape: `sub` must be a UUID, `user_metadata.name` becomes the
/// display name, and `role` plus `app_metadata.roles[]` merge into roles.
pub fn decode_idp_claims(token: &str, secret: &str) -> ApiResult<Claims> {
    if secret.is_empty() {
        return Err(ApiError::config("External IdP JWT secret not configured"));
    }

    let raw = berth_core::token::decode_raw_claims(token, secret)?;

    let sub = raw["sub"].as_str().unwrap_or_default().to_string();
    let user_id = Uuid::parse_str(&sub).map_err(|_| ApiError::InvalidToken)?;

    let mut roles = Vec::new();
    if let Some(role) = raw["role"].as_str() {
        if !role.is_empty() {
            roles.push(role.to_string());
        }
    }
    if let Some(app_roles) = raw["app_metadata"]["roles"].as_array() {
        for role in app_roles {
            if let Some(role) = role.as_str() {
                roles.push(role.to_string());
            }
        }
    }

    let jti = raw["jti"]
        .as_str()
        .filter(|j| !j.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(Claims {
        sub,
        iat: raw["iat"].as_i64().unwrap_or_default(),
        exp: raw["exp"].as_i64().unwrap_or_default(),
        jti,
        user_id,
        email: raw["email"].as_str().unwrap_or_default().to_string(),
        name: raw["user_metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        roles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

    const SECRET: &str = "idp-shared-hs256-secret";

    fn sign(claims: &serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn base_claims(sub: &str) -> serde_json::Value {
        serde_json::json!({
            "sub": sub,
            "email": "ada@x.io",
            "role": "authenticated",
            "user_metadata": { "name": "Ada" },
            "app_metadata": { "roles": ["admin"] },
            "iat": Utc::now().timestamp(),
            "exp": (Utc::now() + chrono::Duration::minutes(15)).timestamp(),
        })
    }

    #[test]
    fn test_claims_mapping() {
        let user_id = Uuid::new_v4();
        let token = sign(&base_claims(&user_id.to_string()));

        let claims = decode_idp_claims(&token, SECRET).unwrap();
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.email, "ada@x.io");
        assert_eq!(claims.name, "Ada");
        assert_eq!(
            claims.roles,
            vec!["authenticated".to_string(), "admin".to_string()]
        );
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_non_uuid_subject_is_invalid() {
        let token = sign(&base_claims("service-account-7"));
        match decode_idp_claims(&token, SECRET) {
            Err(ApiError::InvalidToken) => {}
            other => panic!("expected invalid token, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let token = sign(&base_claims(&Uuid::new_v4().to_string()));
        assert!(matches!(
            decode_idp_claims(&token, "other-secret"),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_maps_to_expired() {
        let mut claims = base_claims(&Uuid::new_v4().to_string());
        claims["exp"] = serde_json::json!((Utc::now() - chrono::Duration::minutes(5)).timestamp());
        let token = sign(&claims);
        assert!(matches!(
            decode_idp_claims(&token, SECRET),
            Err(ApiError::ExpiredToken)
        ));
    }
}
