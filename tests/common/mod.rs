//! Shared harness for the end-to-end tests: an [`App`] over the in-memory
//! adapter with a recording email provider, plus a small request builder
//! that handles CSRF double-submit and JSON bodies.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use berth::core::App;
use berth_core::adapters::MemoryDatabaseAdapter;
use berth_core::config::AppConfig;
use berth_core::email::testing::MockEmailProvider;
use berth_core::email::EmailMessage;
use berth_core::types::{ApiRequest, HttpMethod};

pub const TEST_SECRET: &str = "test-secret-key-that-is-at-least-32-chars";
pub const TEST_ORIGIN: &str = "http://localhost:5173";
pub const CSRF_TOKEN: &str = "test-csrf-token";

pub struct TestServer {
    pub app: App,
    pub db: Arc<MemoryDatabaseAdapter>,
    pub sent: Arc<Mutex<Vec<EmailMessage>>>,
}

pub fn test_config() -> AppConfig {
    AppConfig::new(TEST_SECRET)
        .allowed_origin(TEST_ORIGIN)
        .allow_credentials(true)
        .xendit_webhook_token("xendit-test-token")
        .idp_webhook_secret("idp-test-secret")
}

pub async fn spawn() -> TestServer {
    spawn_with(test_config()).await
}

pub async fn spawn_with(config: AppConfig) -> TestServer {
    let db = Arc::new(MemoryDatabaseAdapter::new());
    let (email, sent) = MockEmailProvider::new();
    let app = App::builder(config)
        .database(db.clone())
        .email(Arc::new(email))
        .build()
        .await
        .expect("app builds");
    TestServer { app, db, sent }
}

pub struct TestRequest {
    req: ApiRequest,
    with_csrf: bool,
}

impl TestRequest {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        let mut req = ApiRequest::new(method, path);
        req.headers
            .insert("x-forwarded-for".to_string(), "203.0.113.1".to_string());
        Self {
            req,
            with_csrf: true,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: &str) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn delete(path: &str) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    pub fn json(mut self, body: &Value) -> Self {
        self.req.body = Some(serde_json::to_vec(body).unwrap());
        self.req.headers.insert(
            "content-type".to_string(),
            "application/json".to_string(),
        );
        self
    }

    pub fn body_bytes(mut self, body: Vec<u8>) -> Self {
        self.req.body = Some(body);
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.req
            .headers
            .insert("authorization".to_string(), format!("Bearer {}", token));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.req
            .headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.req
            .headers
            .insert("x-forwarded-for".to_string(), ip.to_string());
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.req.query.insert(key.to_string(), value.to_string());
        self
    }

    /// Skip the automatic CSRF double-submit pair, for tests probing it.
    pub fn without_csrf(mut self) -> Self {
        self.with_csrf = false;
        self
    }

    pub async fn send(mut self, server: &TestServer) -> TestResponse {
        // Webhook callers are cookie-less; mirroring that here proves the
        // CSRF exemption for signed endpoints.
        let csrf_applies = self.with_csrf
            && !self.req.method.is_safe()
            && !self.req.path.starts_with("/api/v1/webhooks/");
        if csrf_applies {
            let existing_cookie = self.req.headers.get("cookie").cloned();
            let csrf_cookie = format!("__csrf_token={}", CSRF_TOKEN);
            let cookie = match existing_cookie {
                Some(existing) => format!("{}; {}", existing, csrf_cookie),
                None => csrf_cookie,
            };
            self.req.headers.insert("cookie".to_string(), cookie);
            self.req
                .headers
                .entry("x-csrf-token".to_string())
                .or_insert_with(|| CSRF_TOKEN.to_string());
        }

        let response = server.app.handle_request(self.req).await;
        let body = if response.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&response.body).unwrap_or(Value::Null)
        };
        TestResponse {
            status: response.status,
            headers: response.headers,
            cookies: response.cookies,
            body,
        }
    }
}

pub struct TestResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
    pub body: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    pub fn error(&self) -> &Value {
        &self.body["error"]
    }

    pub fn error_code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or_default()
    }

    pub fn error_reason(&self) -> &str {
        self.body["error"]["details"]["reason"]
            .as_str()
            .unwrap_or_default()
    }
}

// --- Flow helpers ---

pub async fn register(server: &TestServer, name: &str, email: &str, password: &str) -> TestResponse {
    TestRequest::post("/api/v1/auth/register")
        .json(&serde_json::json!({ "name": name, "email": email, "password": password }))
        .send(server)
        .await
}

pub async fn login(server: &TestServer, email: &str, password: &str) -> TestResponse {
    TestRequest::post("/api/v1/auth/login")
        .json(&serde_json::json!({ "email": email, "password": password }))
        .send(server)
        .await
}

/// Register a user and return their access token.
pub async fn register_user(server: &TestServer, name: &str, email: &str) -> String {
    let response = register(server, name, email, "LovelaceBytes#9").await;
    assert_eq!(response.status, 200, "registration failed: {}", response.body);
    response.data()["access_token"]
        .as_str()
        .expect("access token")
        .to_string()
}

/// Create an org and return its id.
pub async fn create_org(server: &TestServer, token: &str, name: &str, slug: &str) -> String {
    let response = TestRequest::post("/api/v1/orgs")
        .bearer(token)
        .json(&serde_json::json!({ "name": name, "slug": slug }))
        .send(server)
        .await;
    assert_eq!(response.status, 201, "org creation failed: {}", response.body);
    response.data()["id"].as_str().expect("org id").to_string()
}

/// Pull the raw one-shot token out of the most recent email's text body.
pub fn token_from_last_email(server: &TestServer) -> String {
    let sent = server.sent.lock().unwrap();
    let message = sent.last().expect("an email was sent");
    let idx = message.text.find("token=").expect("token in email") + "token=".len();
    message.text[idx..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect()
}
