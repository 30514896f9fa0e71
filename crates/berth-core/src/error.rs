use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ApiResponse;

/// Control-plane error taxonomy.
///
/// Each variant maps to an HTTP status code via [`ApiError::status_code`] and
/// to a stable envelope code via [`ApiError::code`]. Machine-readable
/// sub-reasons (e.g. `token_reuse`) travel in `error.details.reason` so
/// clients never have to parse human messages.
#[derive(Error, Debug)]
pub enum ApiError {
    // --- 400 Bad Request ---
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("Cannot unlink the last authentication method. Please set a password first.")]
    LastAuthMethod,

    #[error("Validation failed")]
    Validation(BTreeMap<String, String>),

    // --- 401 Unauthorized ---
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Missing authorization token")]
    Unauthenticated,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    ExpiredToken,

    #[error("Refresh token reuse detected")]
    TokenReuse,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    // --- 402 Payment Required ---
    #[error("{message}")]
    UpgradeRequired {
        message: String,
        reason: &'static str,
    },

    // --- 403 Forbidden ---
    #[error("{0}")]
    Forbidden(String),

    #[error("CSRF token mismatch")]
    CsrfMismatch,

    // --- 404 Not Found ---
    #[error("{0}")]
    NotFound(String),

    // --- 409 Conflict ---
    #[error("{0}")]
    Conflict(String),

    // --- 429 Too Many Requests ---
    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after: u64 },

    // --- 500 Internal Server Error ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_)
            | Self::InvalidOrExpiredToken
            | Self::LastAuthMethod
            | Self::Validation(_) => 400,
            Self::InvalidCredentials
            | Self::Unauthenticated
            | Self::InvalidToken
            | Self::ExpiredToken
            | Self::TokenReuse
            | Self::InvalidSignature => 401,
            Self::UpgradeRequired { .. } => 402,
            Self::Forbidden(_) | Self::CsrfMismatch => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Config(_) | Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable envelope code, one of the taxonomy kinds.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::BadRequest(_) | Self::InvalidOrExpiredToken | Self::LastAuthMethod => {
                "BAD_REQUEST"
            }
            Self::InvalidCredentials
            | Self::Unauthenticated
            | Self::InvalidToken
            | Self::ExpiredToken
            | Self::TokenReuse
            | Self::InvalidSignature => "UNAUTHORIZED",
            Self::UpgradeRequired { .. } => "UPGRADE_REQUIRED",
            Self::Forbidden(_) | Self::CsrfMismatch => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Config(_) | Self::Database(_) | Self::Serialization(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Machine-readable sub-reason, when the kind alone is ambiguous.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::InvalidCredentials => Some("invalid_credentials"),
            Self::InvalidToken => Some("invalid_token"),
            Self::ExpiredToken => Some("expired_token"),
            Self::TokenReuse => Some("token_reuse"),
            Self::InvalidSignature => Some("invalid_signature"),
            Self::InvalidOrExpiredToken => Some("invalid_or_expired"),
            Self::LastAuthMethod => Some("last_auth_method"),
            Self::CsrfMismatch => Some("csrf_mismatch"),
            Self::UpgradeRequired { reason, .. } => Some(reason),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Build the structured error block for the response envelope.
    ///
    /// Internal errors (500) use a generic message so details never leak to
    /// clients; the real cause is logged by the dispatcher.
    pub fn to_error_info(&self, path: &str, request_id: &str) -> ErrorInfo {
        let message = match self.status_code() {
            500 => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        let mut details = match self {
            Self::Validation(fields) => fields.clone(),
            _ => BTreeMap::new(),
        };
        if let Some(reason) = self.reason() {
            details.insert("reason".to_string(), reason.to_string());
        }

        ErrorInfo {
            code: self.code().to_string(),
            message,
            details: if details.is_empty() {
                None
            } else {
                Some(details)
            },
            path: path.to_string(),
            request_id: request_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            retry_after: self.retry_after(),
        }
    }

    /// Convert this error into an enveloped [`ApiResponse`].
    pub fn into_response(self, path: &str, request_id: &str) -> ApiResponse {
        let status = self.status_code();
        let envelope = Envelope {
            success: false,
            data: None,
            error: Some(self.to_error_info(path, request_id)),
            meta: None,
        };
        ApiResponse::json(status, &envelope)
            .unwrap_or_else(|_| ApiResponse::text(status, "Internal server error"))
    }

    // --- Constructors ---

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn quota_exceeded(resource: &str, limit: i32) -> Self {
        Self::UpgradeRequired {
            message: format!(
                "You have reached the maximum number of {} ({}) for your current plan. Please upgrade to add more.",
                resource, limit
            ),
            reason: "quota_exceeded",
        }
    }

    pub fn feature_not_available(feature: &str) -> Self {
        Self::UpgradeRequired {
            message: format!(
                "The '{}' feature is not available on your current plan. Please upgrade to access this feature.",
                feature
            ),
            reason: "feature_not_available",
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Persistence-layer error, kept separate so adapters stay framework-free.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

#[cfg(feature = "sqlx-postgres")]
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DatabaseError::Constraint(db_err.to_string())
                } else {
                    DatabaseError::Query(db_err.to_string())
                }
            }
            sqlx::Error::PoolClosed => DatabaseError::Connection("Pool closed".to_string()),
            sqlx::Error::PoolTimedOut => DatabaseError::Connection("Pool timed out".to_string()),
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "sqlx-postgres")]
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(DatabaseError::from(err))
    }
}

// --- Response envelope ---

/// Standard API response envelope shared by every handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// Structured error block inside the envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Pagination metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

/// Build a success envelope response.
pub fn success<T: Serialize>(status: u16, data: &T) -> ApiResult<ApiResponse> {
    let envelope = Envelope {
        success: true,
        data: Some(serde_json::to_value(data)?),
        error: None,
        meta: None,
    };
    ApiResponse::json(status, &envelope)
}

/// Build a success envelope response with pagination metadata.
pub fn success_with_meta<T: Serialize>(status: u16, data: &T, meta: Meta) -> ApiResult<ApiResponse> {
    let envelope = Envelope {
        success: true,
        data: Some(serde_json::to_value(data)?),
        error: None,
        meta: Some(meta),
    };
    ApiResponse::json(status, &envelope)
}

/// Parse and validate a JSON request body.
///
/// Body parse failures become `BAD_REQUEST`; `validator` failures become
/// `VALIDATION_ERROR` with one message per field in `details`.
pub fn validate_body<T>(req: &crate::types::ApiRequest) -> ApiResult<T>
where
    T: serde::de::DeserializeOwned + validator::Validate,
{
    let value: T = req
        .body_as_json()
        .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?;

    value.validate().map_err(|errors| {
        let mut details = BTreeMap::new();
        for (field, field_errors) in errors.field_errors() {
            let message = field_errors
                .iter()
                .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
                .collect::<Vec<_>>()
                .join("; ");
            let message = if message.is_empty() {
                format!("{} is invalid", field)
            } else {
                message
            };
            details.insert(field.to_string(), message);
        }
        ApiError::Validation(details)
    })?;

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(ApiError::not_found("x").status_code(), 404);
        assert_eq!(ApiError::Unauthenticated.status_code(), 401);
        assert_eq!(ApiError::forbidden("x").status_code(), 403);
        assert_eq!(ApiError::bad_request("x").status_code(), 400);
        assert_eq!(ApiError::Validation(BTreeMap::new()).status_code(), 400);
        assert_eq!(ApiError::conflict("x").status_code(), 409);
        assert_eq!(ApiError::RateLimited { retry_after: 1 }.status_code(), 429);
        assert_eq!(ApiError::quota_exceeded("projects", 1).status_code(), 402);
        assert_eq!(ApiError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_internal_errors_are_genericized() {
        let info = ApiError::internal("sqlx: connection refused").to_error_info("/x", "req-1");
        assert_eq!(info.code, "INTERNAL_ERROR");
        assert_eq!(info.message, "Internal server error");
    }

    #[test]
    fn test_reason_travels_in_details() {
        let info = ApiError::TokenReuse.to_error_info("/api/v1/auth/refresh", "req-2");
        assert_eq!(info.code, "UNAUTHORIZED");
        assert_eq!(
            info.details.unwrap().get("reason").map(String::as_str),
            Some("token_reuse")
        );
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let info = ApiError::RateLimited { retry_after: 42 }.to_error_info("/login", "r");
        assert_eq!(info.retry_after, Some(42));
    }

    #[test]
    fn test_quota_message_names_the_limit() {
        let err = ApiError::quota_exceeded("projects", 1);
        assert!(err.to_string().contains("projects"));
        assert!(err.to_string().contains("(1)"));
    }
}
