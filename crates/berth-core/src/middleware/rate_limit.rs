use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::Middleware;
use crate::config::RateLimitConfig;
use crate::error::{ApiError, ApiResult};
use crate::types::{ApiRequest, ApiResponse};

/// Outcome of a rate-limit hit.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitDecision {
    Allowed,
    /// Rejected; retry after this many seconds.
    Limited { retry_after: u64 },
}

/// Storage contract for rate-limit state. The bundled implementation is
/// process-local; horizontally scaled deployments plug in a shared store
/// behind this trait.
pub trait RateLimitStore: Send + Sync {
    /// Record a hit for `key` and decide whether it is within the limit.
    fn hit(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision;

    /// Drop entries whose every timestamp has left the window.
    fn sweep(&self, window: Duration);
}

/// In-memory sliding-window store: per key, the timestamps of requests seen
/// within the window.
pub struct MemoryRateLimitStore {
    clients: Mutex<HashMap<String, Vec<Instant>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn hit(&self, key: &str, limit: u32, window: Duration) -> RateLimitDecision {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        let timestamps = clients.entry(key.to_string()).or_default();

        timestamps.retain(|&t| now.duration_since(t) < window);

        if timestamps.len() as u32 >= limit {
            let retry_after = timestamps
                .first()
                .map(|&t| window.as_secs().saturating_sub(now.duration_since(t).as_secs()))
                .unwrap_or(window.as_secs())
                .max(1);
            return RateLimitDecision::Limited { retry_after };
        }

        timestamps.push(now);
        RateLimitDecision::Allowed
    }

    fn sweep(&self, window: Duration) {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|_, timestamps| {
            timestamps.iter().any(|&t| now.duration_since(t) < window)
        });
    }
}

/// Per-IP sliding-window rate limiter for the credential endpoints.
///
/// Applies only to the configured paths; everything else passes through.
/// Rejections carry `Retry-After` both as a header and in the envelope.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    paths: Vec<String>,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig, paths: Vec<String>) -> Self {
        Self::with_store(config, paths, Arc::new(MemoryRateLimitStore::new()))
    }

    pub fn with_store(
        config: RateLimitConfig,
        paths: Vec<String>,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            config,
            paths,
            store,
        }
    }

    /// Spawn the background sweeper that drops fully-expired entries.
    /// Runs every 5 minutes for the life of the process.
    pub fn spawn_sweeper(&self) {
        let store = self.store.clone();
        let window = self.config.window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                store.sweep(window);
            }
        });
    }

    fn applies_to(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn before_request(&self, req: &ApiRequest) -> ApiResult<Option<ApiResponse>> {
        if !self.config.enabled || !self.applies_to(&req.path) {
            return Ok(None);
        }

        let key = format!("{}:{}", req.client_ip(), req.path);
        match self
            .store
            .hit(&key, self.config.requests, self.config.window)
        {
            RateLimitDecision::Allowed => Ok(None),
            RateLimitDecision::Limited { retry_after } => {
                tracing::warn!(ip = %req.client_ip(), path = %req.path, "rate limit exceeded");
                Err(ApiError::RateLimited { retry_after })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;

    fn limiter(limit: u32, window_secs: u64, paths: &[&str]) -> RateLimitMiddleware {
        RateLimitMiddleware::new(
            RateLimitConfig {
                enabled: true,
                requests: limit,
                window: Duration::from_secs(window_secs),
            },
            paths.iter().map(|p| p.to_string()).collect(),
        )
    }

    fn login_from(ip: &str) -> ApiRequest {
        let mut req = ApiRequest::new(HttpMethod::Post, "/api/v1/auth/login");
        req.headers
            .insert("x-forwarded-for".to_string(), ip.to_string());
        req
    }

    #[tokio::test]
    async fn test_allows_within_limit() {
        let mw = limiter(5, 900, &["/api/v1/auth/login"]);
        for _ in 0..5 {
            assert!(mw.before_request(&login_from("1.2.3.4")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_sixth_request_is_limited_with_retry_after() {
        let mw = limiter(5, 900, &["/api/v1/auth/login"]);
        for _ in 0..5 {
            mw.before_request(&login_from("1.2.3.4")).await.unwrap();
        }
        match mw.before_request(&login_from("1.2.3.4")).await {
            Err(ApiError::RateLimited { retry_after }) => assert!(retry_after > 0),
            other => panic!("expected rate limited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_limit_is_per_client_ip() {
        let mw = limiter(2, 900, &["/api/v1/auth/login"]);
        for _ in 0..2 {
            mw.before_request(&login_from("1.1.1.1")).await.unwrap();
        }
        assert!(mw.before_request(&login_from("1.1.1.1")).await.is_err());
        assert!(mw.before_request(&login_from("2.2.2.2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlisted_paths_pass_through() {
        let mw = limiter(1, 900, &["/api/v1/auth/login"]);
        let mut req = ApiRequest::new(HttpMethod::Get, "/api/v1/orgs");
        req.headers
            .insert("x-forwarded-for".to_string(), "1.2.3.4".to_string());
        for _ in 0..10 {
            assert!(mw.before_request(&req).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_disabled_limiter_passes_everything() {
        let mw = RateLimitMiddleware::new(
            RateLimitConfig {
                enabled: false,
                requests: 1,
                window: Duration::from_secs(900),
            },
            vec!["/api/v1/auth/login".to_string()],
        );
        for _ in 0..10 {
            assert!(mw.before_request(&login_from("1.2.3.4")).await.unwrap().is_none());
        }
    }

    #[test]
    fn test_sweep_drops_dead_entries() {
        let store = MemoryRateLimitStore::new();
        store.hit("1.2.3.4:/login", 5, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        store.sweep(Duration::from_millis(1));
        assert!(store.clients.lock().unwrap().is_empty());
    }
}
