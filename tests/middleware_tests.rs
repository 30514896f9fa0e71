//! Pipeline behavior: CSRF double-submit, rate limiting, security headers,
//! CORS, request ids, and the error envelope shape.

mod common;

use common::*;

#[tokio::test]
async fn test_csrf_blocks_post_without_header() {
    let server = spawn().await;

    let response = TestRequest::post("/api/v1/auth/login")
        .json(&serde_json::json!({ "email": "a@b.c", "password": "x" }))
        .without_csrf()
        .send(&server)
        .await;
    assert_eq!(response.status, 403);
    assert_eq!(response.error_code(), "FORBIDDEN");
    assert_eq!(response.error_reason(), "csrf_mismatch");
}

#[tokio::test]
async fn test_csrf_passes_with_matching_pair_regardless_of_auth() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    // Matching pair + bad credentials: the CSRF layer passes, auth decides.
    let response = login(&server, "ada@x.io", "WrongPassword#1").await;
    assert_eq!(response.status, 401);

    let response = login(&server, "ada@x.io", "LovelaceBytes#9").await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_csrf_cookie_is_set_on_responses() {
    let server = spawn().await;
    let response = TestRequest::get("/api/v1/billing/plans").send(&server).await;
    assert_eq!(response.status, 200);
    assert!(
        response
            .cookies
            .iter()
            .any(|c| c.starts_with("__csrf_token=") && c.contains("SameSite=Lax"))
    );
}

#[tokio::test]
async fn test_sixth_login_within_window_is_rate_limited() {
    let server = spawn().await;

    for _ in 0..5 {
        let response = login(&server, "ada@x.io", "LovelaceBytes#9").await;
        assert_eq!(response.status, 401);
    }

    let response = login(&server, "ada@x.io", "LovelaceBytes#9").await;
    assert_eq!(response.status, 429);
    assert_eq!(response.error_code(), "RATE_LIMIT_EXCEEDED");
    assert!(response.error()["retry_after"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_rate_limit_is_per_ip() {
    let server = spawn().await;

    for _ in 0..5 {
        TestRequest::post("/api/v1/auth/login")
            .json(&serde_json::json!({ "email": "a@b.c", "password": "x" }))
            .ip("198.51.100.7")
            .send(&server)
            .await;
    }
    let blocked = TestRequest::post("/api/v1/auth/login")
        .json(&serde_json::json!({ "email": "a@b.c", "password": "x" }))
        .ip("198.51.100.7")
        .send(&server)
        .await;
    assert_eq!(blocked.status, 429);

    let other_ip = TestRequest::post("/api/v1/auth/login")
        .json(&serde_json::json!({ "email": "a@b.c", "password": "x" }))
        .ip("198.51.100.8")
        .send(&server)
        .await;
    assert_eq!(other_ip.status, 401);
}

#[tokio::test]
async fn test_refresh_endpoint_is_not_rate_limited() {
    let server = spawn().await;
    for _ in 0..10 {
        let response = TestRequest::post("/api/v1/auth/refresh")
            .json(&serde_json::json!({ "refresh_token": "none" }))
            .send(&server)
            .await;
        assert_eq!(response.status, 401);
    }
}

#[tokio::test]
async fn test_security_headers_on_every_response() {
    let server = spawn().await;

    for response in [
        TestRequest::get("/healthz").send(&server).await,
        TestRequest::get("/api/v1/nope").send(&server).await,
    ] {
        assert_eq!(
            response.headers.get("X-Content-Type-Options").map(String::as_str),
            Some("nosniff")
        );
        assert_eq!(
            response.headers.get("X-Frame-Options").map(String::as_str),
            Some("DENY")
        );
        assert_eq!(
            response
                .headers
                .get("Content-Security-Policy")
                .map(String::as_str),
            Some("default-src 'none'; frame-ancestors 'none'")
        );
    }
}

#[tokio::test]
async fn test_cors_reflects_allowed_origin_only() {
    let server = spawn().await;

    let allowed = TestRequest::get("/api/v1/billing/plans")
        .header("origin", TEST_ORIGIN)
        .send(&server)
        .await;
    assert_eq!(
        allowed
            .headers
            .get("Access-Control-Allow-Origin")
            .map(String::as_str),
        Some(TEST_ORIGIN)
    );
    assert_eq!(
        allowed
            .headers
            .get("Access-Control-Expose-Headers")
            .map(String::as_str),
        Some("X-Request-ID")
    );

    let denied = TestRequest::get("/api/v1/billing/plans")
        .header("origin", "https://evil.example")
        .send(&server)
        .await;
    assert!(!denied.headers.contains_key("Access-Control-Allow-Origin"));
}

#[tokio::test]
async fn test_preflight_short_circuits() {
    let server = spawn().await;
    let response = TestRequest::new(berth_core::types::HttpMethod::Options, "/api/v1/orgs")
        .header("origin", TEST_ORIGIN)
        .send(&server)
        .await;
    assert_eq!(response.status, 204);
    assert!(response.headers.contains_key("Access-Control-Max-Age"));
}

#[tokio::test]
async fn test_request_id_is_echoed_or_generated() {
    let server = spawn().await;

    let response = TestRequest::get("/healthz")
        .header("x-request-id", "req-abc-123")
        .send(&server)
        .await;
    assert_eq!(
        response.headers.get("X-Request-ID").map(String::as_str),
        Some("req-abc-123")
    );

    let response = TestRequest::get("/healthz").send(&server).await;
    assert!(!response.headers.get("X-Request-ID").unwrap().is_empty());
}

#[tokio::test]
async fn test_error_envelope_shape() {
    let server = spawn().await;
    let response = TestRequest::get("/api/v1/definitely-not-a-route")
        .header("x-request-id", "req-envelope")
        .send(&server)
        .await;

    assert_eq!(response.status, 404);
    assert_eq!(response.body["success"], false);
    assert_eq!(response.error_code(), "NOT_FOUND");
    assert_eq!(response.error()["path"], "/api/v1/definitely-not-a-route");
    assert_eq!(response.error()["request_id"], "req-envelope");
    assert!(response.error()["timestamp"].as_str().is_some());
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = spawn().await;

    let response = TestRequest::get("/healthz").send(&server).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.data()["status"], "ok");

    let response = TestRequest::get("/readyz").send(&server).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.data()["status"], "ready");
}
