//! End-to-end credential flows: registration, login, refresh rotation and
//! reuse detection, email verification, and password reset.

mod common;

use common::*;

#[tokio::test]
async fn test_register_then_login() {
    let server = spawn().await;

    let response = register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;
    assert_eq!(response.status, 200);
    assert!(response.body["success"].as_bool().unwrap());
    assert!(response.data()["access_token"].as_str().is_some());
    assert!(response.data()["refresh_token"].as_str().is_some());
    assert_eq!(response.data()["user"]["email"], "ada@x.io");
    assert_eq!(response.data()["user"]["roles"][0], "user");

    let response = login(&server, "ada@x.io", "LovelaceBytes#9").await;
    assert_eq!(response.status, 200);
    assert!(response.data()["access_token"].as_str().is_some());
}

#[tokio::test]
async fn test_weak_password_lists_failing_rules() {
    let server = spawn().await;

    let response = register(&server, "Ada", "ada@x.io", "short").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.error_code(), "VALIDATION_ERROR");
    assert!(
        response.error()["details"]["password"]
            .as_str()
            .unwrap()
            .contains("at least 12 characters")
    );
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    let response = register(&server, "Imposter", "ada@x.io", "LovelaceBytes#9").await;
    assert_eq!(response.status, 409);
    assert_eq!(response.error_code(), "CONFLICT");
}

#[tokio::test]
async fn test_login_failure_shape_is_uniform() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    let unknown = login(&server, "nobody@x.io", "LovelaceBytes#9").await;
    let wrong = login(&server, "ada@x.io", "WrongPassword#1").await;

    assert_eq!(unknown.status, 401);
    assert_eq!(wrong.status, 401);
    assert_eq!(unknown.error_code(), wrong.error_code());
    assert_eq!(
        unknown.error()["message"].as_str().unwrap(),
        wrong.error()["message"].as_str().unwrap()
    );
}

#[tokio::test]
async fn test_refresh_rotation_and_reuse_detection() {
    let server = spawn().await;
    let response = register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;
    let r1 = response.data()["refresh_token"].as_str().unwrap().to_string();

    // Rotate: R1 -> R2.
    let response = TestRequest::post("/api/v1/auth/refresh")
        .json(&serde_json::json!({ "refresh_token": r1 }))
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
    let r2 = response.data()["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(r1, r2);

    // Replaying R1 is reuse and kills the family.
    let response = TestRequest::post("/api/v1/auth/refresh")
        .json(&serde_json::json!({ "refresh_token": r1 }))
        .send(&server)
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(response.error_reason(), "token_reuse");

    // R2 was revoked transitively, and reports reuse, not invalid.
    let response = TestRequest::post("/api/v1/auth/refresh")
        .json(&serde_json::json!({ "refresh_token": r2 }))
        .send(&server)
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(response.error_reason(), "token_reuse");
}

#[tokio::test]
async fn test_refresh_with_unknown_token_is_invalid() {
    let server = spawn().await;
    let response = TestRequest::post("/api/v1/auth/refresh")
        .json(&serde_json::json!({ "refresh_token": "bm90LXJlYWw" }))
        .send(&server)
        .await;
    assert_eq!(response.status, 401);
    assert_eq!(response.error_reason(), "invalid_token");
}

#[tokio::test]
async fn test_logout_revokes_refresh_tokens() {
    let server = spawn().await;
    let response = register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;
    let access = response.data()["access_token"].as_str().unwrap().to_string();
    let refresh = response.data()["refresh_token"].as_str().unwrap().to_string();

    let response = TestRequest::post("/api/v1/auth/logout")
        .bearer(&access)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);

    let response = TestRequest::post("/api/v1/auth/refresh")
        .json(&serde_json::json!({ "refresh_token": refresh }))
        .send(&server)
        .await;
    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_registration_sends_verification_email_and_token_verifies() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    assert_eq!(server.sent.lock().unwrap().len(), 1);
    let token = token_from_last_email(&server);

    let response = TestRequest::post("/api/v1/auth/verify-email")
        .json(&serde_json::json!({ "token": token }))
        .send(&server)
        .await;
    assert_eq!(response.status, 200);

    // One-shot: the same token cannot verify twice.
    let response = TestRequest::post("/api/v1/auth/verify-email")
        .json(&serde_json::json!({ "token": token }))
        .send(&server)
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.error_reason(), "invalid_or_expired");
}

#[tokio::test]
async fn test_request_reset_is_enumeration_resistant() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    let known = TestRequest::post("/api/v1/auth/request-reset")
        .json(&serde_json::json!({ "email": "ada@x.io" }))
        .send(&server)
        .await;
    let unknown = TestRequest::post("/api/v1/auth/request-reset")
        .json(&serde_json::json!({ "email": "ghost@x.io" }))
        .send(&server)
        .await;

    assert_eq!(known.status, 200);
    assert_eq!(unknown.status, 200);
    assert_eq!(
        known.data()["message"].as_str().unwrap(),
        unknown.data()["message"].as_str().unwrap()
    );

    // Only the known address actually got mail: registration + reset.
    assert_eq!(server.sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_password_reset_flow() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;

    // Issue two reset tokens; consuming the second invalidates the first.
    TestRequest::post("/api/v1/auth/request-reset")
        .json(&serde_json::json!({ "email": "ada@x.io" }))
        .send(&server)
        .await;
    let first_token = token_from_last_email(&server);
    TestRequest::post("/api/v1/auth/request-reset")
        .json(&serde_json::json!({ "email": "ada@x.io" }))
        .send(&server)
        .await;
    let second_token = token_from_last_email(&server);

    let response = TestRequest::post("/api/v1/auth/reset-password")
        .json(&serde_json::json!({ "token": second_token, "password": "NewLovelace#10" }))
        .send(&server)
        .await;
    assert_eq!(response.status, 200);

    // The new password works; the old one does not.
    assert_eq!(login(&server, "ada@x.io", "NewLovelace#10").await.status, 200);
    assert_eq!(login(&server, "ada@x.io", "LovelaceBytes#9").await.status, 401);

    // Sibling token was invalidated; the used token stays used.
    for token in [first_token, second_token] {
        let response = TestRequest::post("/api/v1/auth/reset-password")
            .json(&serde_json::json!({ "token": token, "password": "AnotherPass#11" }))
            .send(&server)
            .await;
        assert_eq!(response.status, 400);
        assert_eq!(response.error_reason(), "invalid_or_expired");
    }
}

#[tokio::test]
async fn test_reset_password_enforces_policy() {
    let server = spawn().await;
    register(&server, "Ada", "ada@x.io", "LovelaceBytes#9").await;
    TestRequest::post("/api/v1/auth/request-reset")
        .json(&serde_json::json!({ "email": "ada@x.io" }))
        .send(&server)
        .await;
    let token = token_from_last_email(&server);

    let response = TestRequest::post("/api/v1/auth/reset-password")
        .json(&serde_json::json!({ "token": token, "password": "weak" }))
        .send(&server)
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(response.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_me_endpoint_round_trips_profile() {
    let server = spawn().await;
    let token = register_user(&server, "Ada", "ada@x.io").await;

    let response = TestRequest::get("/api/v1/users/me")
        .bearer(&token)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.data()["email"], "ada@x.io");

    let response = TestRequest::put("/api/v1/users/me")
        .bearer(&token)
        .json(&serde_json::json!({ "name": "Ada Lovelace" }))
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.data()["name"], "Ada Lovelace");
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let server = spawn().await;
    let response = TestRequest::get("/api/v1/users/me").send(&server).await;
    assert_eq!(response.status, 401);
    assert_eq!(response.error_code(), "UNAUTHORIZED");
}
