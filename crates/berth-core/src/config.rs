use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::error::{ApiError, ApiResult};

/// Deployment environment. Production tightens cookie flags and makes the
/// JWT secret mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Which auth provider variant backs the credential endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProviderKind {
    Local,
    External,
}

/// Main application configuration. Immutable after startup; shared via `Arc`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub server_port: u16,
    /// Externally visible base URL of this API, used for OAuth redirect URIs.
    pub public_base_url: String,
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub auth_provider: AuthProviderKind,
    pub external_idp: ExternalIdpConfig,
    pub oauth: OAuthConfig,
    pub email: EmailConfig,
    pub xendit: XenditConfig,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HS256 signing key. Required in production.
    pub secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Exact origins, or the single wildcard `*`.
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Max requests per window per client IP.
    pub requests: u32,
    pub window: StdDuration,
}

/// External identity provider (hosted auth service) settings.
#[derive(Debug, Clone, Default)]
pub struct ExternalIdpConfig {
    pub url: String,
    pub api_key: String,
    /// Shared HS256 secret used to validate IdP-issued access tokens locally.
    pub jwt_secret: String,
    /// Secret for verifying user-sync webhook payload signatures.
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct OAuthConfig {
    pub google: OAuthProviderConfig,
    pub github: OAuthProviderConfig,
    /// SPA base URL that callbacks redirect to.
    pub frontend_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    /// Resend API key. Empty disables outbound email (logged instead).
    pub api_key: String,
    pub from_email: String,
    /// Dashboard URL used when rendering links in emails.
    pub app_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct XenditConfig {
    /// Callback verification token; also the HMAC key for signed callbacks.
    pub webhook_token: String,
}

impl AppConfig {
    /// Development defaults with the given JWT secret. Used by tests and as
    /// the base that [`AppConfig::from_env`] overrides.
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            environment: Environment::Development,
            server_port: 8080,
            public_base_url: "http://localhost:8080".to_string(),
            database_url: None,
            jwt: JwtConfig {
                secret: jwt_secret.into(),
                access_token_ttl: Duration::minutes(15),
                refresh_token_ttl: Duration::hours(168),
            },
            cors: CorsConfig {
                allowed_origins: Vec::new(),
                allow_credentials: false,
                max_age: 86400,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                requests: 5,
                window: StdDuration::from_secs(15 * 60),
            },
            auth_provider: AuthProviderKind::Local,
            external_idp: ExternalIdpConfig::default(),
            oauth: OAuthConfig {
                frontend_url: "http://localhost:5173".to_string(),
                ..OAuthConfig::default()
            },
            email: EmailConfig {
                app_url: "http://localhost:5173".to_string(),
                ..EmailConfig::default()
            },
            xendit: XenditConfig::default(),
        }
    }

    /// Load configuration from the environment.
    pub fn from_env() -> ApiResult<Self> {
        let mut cfg = Self::new(env_str("JWT_SECRET", ""));

        if env_str("APP_ENVIRONMENT", "development") == "production" {
            cfg.environment = Environment::Production;
        }
        cfg.server_port = env_str("SERVER_PORT", "8080")
            .parse()
            .map_err(|_| ApiError::config("SERVER_PORT must be a port number"))?;
        cfg.public_base_url = env_str("PUBLIC_BASE_URL", &cfg.public_base_url);
        cfg.database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        if let Some(ttl) = env_duration("JWT_ACCESS_TOKEN_TTL")? {
            cfg.jwt.access_token_ttl = Duration::from_std(ttl)
                .map_err(|_| ApiError::config("JWT_ACCESS_TOKEN_TTL out of range"))?;
        }
        if let Some(ttl) = env_duration("JWT_REFRESH_TOKEN_TTL")? {
            cfg.jwt.refresh_token_ttl = Duration::from_std(ttl)
                .map_err(|_| ApiError::config("JWT_REFRESH_TOKEN_TTL out of range"))?;
        }

        let origins = env_str("CORS_ALLOWED_ORIGINS", "");
        if !origins.is_empty() {
            cfg.cors.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        cfg.cors.allow_credentials = env_bool("CORS_ALLOW_CREDENTIALS", false);

        cfg.rate_limit.enabled = env_bool("RATELIMIT_ENABLED", true);
        if let Ok(requests) = env_str("RATELIMIT_REQUESTS", "").parse() {
            cfg.rate_limit.requests = requests;
        }
        if let Some(window) = env_duration("RATELIMIT_WINDOW")? {
            cfg.rate_limit.window = window;
        }

        if env_str("AUTH_PROVIDER", "local") == "external" {
            cfg.auth_provider = AuthProviderKind::External;
        }
        cfg.external_idp = ExternalIdpConfig {
            url: env_str("EXTERNAL_IDP_URL", ""),
            api_key: env_str("EXTERNAL_IDP_KEY", ""),
            jwt_secret: env_str("EXTERNAL_IDP_JWT_SECRET", ""),
            webhook_secret: env_str("EXTERNAL_IDP_WEBHOOK_SECRET", ""),
        };

        cfg.oauth = OAuthConfig {
            google: OAuthProviderConfig {
                client_id: env_str("OAUTH_GOOGLE_CLIENT_ID", ""),
                client_secret: env_str("OAUTH_GOOGLE_CLIENT_SECRET", ""),
                enabled: env_bool("OAUTH_GOOGLE_ENABLED", false),
            },
            github: OAuthProviderConfig {
                client_id: env_str("OAUTH_GITHUB_CLIENT_ID", ""),
                client_secret: env_str("OAUTH_GITHUB_CLIENT_SECRET", ""),
                enabled: env_bool("OAUTH_GITHUB_ENABLED", false),
            },
            frontend_url: env_str("OAUTH_FRONTEND_URL", &cfg.oauth.frontend_url),
        };

        cfg.email = EmailConfig {
            api_key: env_str("EMAIL_API_KEY", ""),
            from_email: env_str("EMAIL_FROM", "Berth <noreply@berth.dev>"),
            app_url: env_str("APP_URL", &cfg.email.app_url),
        };

        cfg.xendit.webhook_token = env_str("XENDIT_WEBHOOK_TOKEN", "");

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check required values. The JWT secret may only be empty outside
    /// production (a dev fallback is substituted by the app builder).
    pub fn validate(&self) -> ApiResult<()> {
        if self.environment.is_production() && self.jwt.secret.is_empty() {
            return Err(ApiError::config("JWT_SECRET must be set in production"));
        }
        if self.auth_provider == AuthProviderKind::External && self.external_idp.url.is_empty() {
            return Err(ApiError::config(
                "EXTERNAL_IDP_URL is required when AUTH_PROVIDER=external",
            ));
        }
        Ok(())
    }

    // --- Builder methods (used by tests and embedders) ---

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors.allowed_origins.push(origin.into());
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.cors.allow_credentials = allow;
        self
    }

    pub fn rate_limit(mut self, enabled: bool, requests: u32, window: StdDuration) -> Self {
        self.rate_limit = RateLimitConfig {
            enabled,
            requests,
            window,
        };
        self
    }

    pub fn access_token_ttl(mut self, ttl: Duration) -> Self {
        self.jwt.access_token_ttl = ttl;
        self
    }

    pub fn refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.jwt.refresh_token_ttl = ttl;
        self
    }

    pub fn frontend_url(mut self, url: impl Into<String>) -> Self {
        self.oauth.frontend_url = url.into();
        self
    }

    pub fn xendit_webhook_token(mut self, token: impl Into<String>) -> Self {
        self.xendit.webhook_token = token.into();
        self
    }

    pub fn idp_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.external_idp.webhook_secret = secret.into();
        self
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_duration(key: &str) -> ApiResult<Option<StdDuration>> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => parse_duration(&v)
            .map(Some)
            .ok_or_else(|| ApiError::config(format!("{} is not a valid duration: {}", key, v))),
        _ => Ok(None),
    }
}

/// Parse durations in the `15m` / `168h` / `30s` / `7d` form; a bare number
/// is seconds.
pub fn parse_duration(input: &str) -> Option<StdDuration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (number, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = number.parse().ok()?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60,
        "h" | "hr" | "hrs" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(StdDuration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("15m"), Some(StdDuration::from_secs(900)));
        assert_eq!(parse_duration("168h"), Some(StdDuration::from_secs(604800)));
        assert_eq!(parse_duration("30"), Some(StdDuration::from_secs(30)));
        assert_eq!(parse_duration("7d"), Some(StdDuration::from_secs(604800)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn test_defaults_match_token_ttls() {
        let cfg = AppConfig::new("test-secret");
        assert_eq!(cfg.jwt.access_token_ttl, Duration::minutes(15));
        assert_eq!(cfg.jwt.refresh_token_ttl, Duration::hours(168));
        assert_eq!(cfg.rate_limit.requests, 5);
        assert_eq!(cfg.rate_limit.window, StdDuration::from_secs(900));
    }

    #[test]
    fn test_production_requires_secret() {
        let cfg = AppConfig::new("").environment(Environment::Production);
        assert!(cfg.validate().is_err());

        let cfg = AppConfig::new("a-real-secret").environment(Environment::Production);
        assert!(cfg.validate().is_ok());
    }
}
