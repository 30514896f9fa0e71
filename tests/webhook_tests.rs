//! Webhook surfaces: payment-provider callbacks (signature verification and
//! idempotent state transitions) and IdP user sync.

mod common;

use common::*;

use berth_core::adapters::DatabaseAdapter;
use hmac::{Hmac, Mac};
use sha2::Sha256;

fn hmac_hex(payload: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Register a user, create an org with a pro subscription, and return the
/// external id wired onto its pending invoice.
async fn seed_invoice(server: &TestServer) -> String {
    let token = register_user(server, "Ada", "ada@x.io").await;
    let org_id = create_org(server, &token, "Acme", "acme").await;

    let plans = TestRequest::get("/api/v1/billing/plans").send(server).await;
    let plan_id = plans
        .data()
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["slug"] == "pro")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    let response = TestRequest::post(&format!("/api/v1/orgs/{}/billing/subscribe", org_id))
        .bearer(&token)
        .json(&serde_json::json!({ "plan_id": plan_id, "billing_cycle": "monthly" }))
        .send(server)
        .await;
    assert_eq!(response.status, 201);

    // Attach the provider's invoice id the way the (out-of-scope) checkout
    // integration would.
    let org_uuid = uuid::Uuid::parse_str(&org_id).unwrap();
    let mut invoice = server
        .db
        .list_org_invoices(org_uuid)
        .await
        .unwrap()
        .pop()
        .unwrap();
    invoice.external_id = Some("xnd-inv-123".to_string());
    server.db.update_invoice(invoice).await.unwrap();
    "xnd-inv-123".to_string()
}

#[tokio::test]
async fn test_xendit_webhook_requires_verification() {
    let server = spawn().await;
    seed_invoice(&server).await;
    let payload = serde_json::json!({ "id": "xnd-inv-123", "status": "PAID" });

    // No token, no signature.
    let response = TestRequest::post("/api/v1/webhooks/xendit")
        .json(&payload)
        .send(&server)
        .await;
    assert_eq!(response.status, 401);

    // Wrong shared token.
    let response = TestRequest::post("/api/v1/webhooks/xendit")
        .json(&payload)
        .header("x-callback-token", "wrong")
        .send(&server)
        .await;
    assert_eq!(response.status, 401);

    // Correct shared token.
    let response = TestRequest::post("/api/v1/webhooks/xendit")
        .json(&payload)
        .header("x-callback-token", "xendit-test-token")
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_xendit_webhook_accepts_hmac_signature() {
    let server = spawn().await;
    seed_invoice(&server).await;
    let payload = serde_json::to_vec(&serde_json::json!({
        "id": "xnd-inv-123",
        "status": "PAID",
    }))
    .unwrap();
    let signature = hmac_hex(&payload, "xendit-test-token");

    let response = TestRequest::post("/api/v1/webhooks/xendit")
        .body_bytes(payload)
        .header("x-callback-signature", &signature)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_paid_event_is_idempotent() {
    let server = spawn().await;
    let external_id = seed_invoice(&server).await;
    let payload = serde_json::json!({ "id": external_id, "status": "PAID" });

    for _ in 0..2 {
        let response = TestRequest::post("/api/v1/webhooks/xendit")
            .json(&payload)
            .header("x-callback-token", "xendit-test-token")
            .send(&server)
            .await;
        assert_eq!(response.status, 200);
    }

    // Exactly one paid invoice; the first paid_at wins.
    let token = login(&server, "ada@x.io", "LovelaceBytes#9").await;
    let access = token.data()["access_token"].as_str().unwrap().to_string();
    let orgs = TestRequest::get("/api/v1/orgs").bearer(&access).send(&server).await;
    let org_id = orgs.data()[0]["id"].as_str().unwrap().to_string();

    let invoices = TestRequest::get(&format!("/api/v1/orgs/{}/billing/invoices", org_id))
        .bearer(&access)
        .send(&server)
        .await;
    let invoices = invoices.data().as_array().unwrap().clone();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0]["status"], "paid");
    assert!(invoices[0]["paid_at"].as_str().is_some());
}

#[tokio::test]
async fn test_unknown_invoice_is_404() {
    let server = spawn().await;
    let response = TestRequest::post("/api/v1/webhooks/xendit")
        .json(&serde_json::json!({ "id": "xnd-missing", "status": "PAID" }))
        .header("x-callback-token", "xendit-test-token")
        .send(&server)
        .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_idp_webhook_rejects_bad_signature() {
    let server = spawn().await;
    let payload = serde_json::to_vec(&serde_json::json!({
        "type": "INSERT",
        "table": "users",
        "schema": "auth",
        "record": { "id": uuid::Uuid::new_v4().to_string(), "email": "sync@x.io" },
    }))
    .unwrap();

    let response = TestRequest::post("/api/v1/webhooks/idp/auth")
        .body_bytes(payload.clone())
        .header("x-webhook-signature", "deadbeef")
        .send(&server)
        .await;
    assert_eq!(response.status, 401);

    let response = TestRequest::post("/api/v1/webhooks/idp/auth")
        .body_bytes(payload)
        .send(&server)
        .await;
    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_idp_webhook_syncs_user_lifecycle() {
    let server = spawn().await;
    let user_id = uuid::Uuid::new_v4();

    let insert = serde_json::to_vec(&serde_json::json!({
        "type": "INSERT",
        "table": "users",
        "schema": "auth",
        "record": {
            "id": user_id.to_string(),
            "email": "sync@x.io",
            "raw_user_meta_data": { "name": "Synced" },
        },
    }))
    .unwrap();
    let response = TestRequest::post("/api/v1/webhooks/idp/auth")
        .header("x-webhook-signature", &hmac_hex(&insert, "idp-test-secret"))
        .body_bytes(insert)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);

    let user = server.db.get_user_by_id(user_id).await.unwrap().unwrap();
    assert_eq!(user.email, "sync@x.io");
    assert_eq!(user.name, "Synced");

    let delete = serde_json::to_vec(&serde_json::json!({
        "type": "DELETE",
        "table": "users",
        "schema": "auth",
        "record": { "id": user_id.to_string(), "email": "sync@x.io" },
    }))
    .unwrap();
    let response = TestRequest::post("/api/v1/webhooks/idp/auth")
        .header("x-webhook-signature", &hmac_hex(&delete, "idp-test-secret"))
        .body_bytes(delete)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
    assert!(server.db.get_user_by_id(user_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_idp_webhook_ignores_other_tables() {
    let server = spawn().await;
    let payload = serde_json::to_vec(&serde_json::json!({
        "type": "INSERT",
        "table": "sessions",
        "schema": "auth",
        "record": {},
    }))
    .unwrap();

    let response = TestRequest::post("/api/v1/webhooks/idp/auth")
        .header("x-webhook-signature", &hmac_hex(&payload, "idp-test-secret"))
        .body_bytes(payload)
        .send(&server)
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.data()["status"], "ignored");
}
