//! User-sync webhook for the external identity provider.
//!
//! The IdP posts INSERT/UPDATE/DELETE events for `auth.users`; this plugin
//! mirrors them into the local principal table so tenancy and billing can
//! join against users regardless of which provider is active.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use berth_core::context::RequestContext;
use berth_core::error::{ApiError, ApiResult};
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{ApiRequest, ApiResponse, CreateUser, UpdateUser};

use crate::signature::verify_hmac_signature;

pub const IDP_WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "type")]
    event_type: String,
    table: String,
    schema: String,
    record: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IdpUserRecord {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default, rename = "raw_user_meta_data")]
    user_metadata: serde_json::Value,
}

pub struct IdpWebhookPlugin;

#[async_trait]
impl ApiPlugin for IdpWebhookPlugin {
    fn name(&self) -> &'static str {
        "idp-webhook"
    }

    fn routes(&self) -> Vec<Route> {
        vec![Route::post("/api/v1/webhooks/idp/auth", "idp_auth_webhook").public()]
    }

    async fn handle(
        &self,
        _operation: &str,
        req: &ApiRequest,
        _rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let body = req.body.as_deref().unwrap_or_default();

        let secret = &ctx.config.external_idp.webhook_secret;
        if !secret.is_empty() {
            let signature = req.header(IDP_WEBHOOK_SIGNATURE_HEADER).unwrap_or_default();
            if !verify_hmac_signature(body, signature, secret) {
                return Err(ApiError::InvalidSignature);
            }
        }

        let payload: WebhookPayload = serde_json::from_slice(body)
            .map_err(|_| ApiError::bad_request("Invalid webhook payload"))?;

        if payload.schema != "auth" || payload.table != "users" {
            return berth_core::error::success(
                200,
                &serde_json::json!({ "status": "ignored", "reason": "not auth.users" }),
            );
        }

        let record: IdpUserRecord = serde_json::from_value(payload.record)
            .map_err(|_| ApiError::bad_request("Invalid user record in payload"))?;
        let user_id =
            Uuid::parse_str(&record.id).map_err(|_| ApiError::bad_request("Invalid user ID"))?;

        let status = match payload.event_type.as_str() {
            "INSERT" => {
                self.sync_insert(ctx, user_id, record).await?;
                "synced"
            }
            "UPDATE" => {
                self.sync_update(ctx, user_id, record).await?;
                "updated"
            }
            "DELETE" => {
                ctx.database.soft_delete_user(user_id).await?;
                tracing::info!(%user_id, "idp user soft-deleted via webhook");
                "deleted"
            }
            _ => {
                return berth_core::error::success(
                    200,
                    &serde_json::json!({ "status": "ignored", "reason": "unknown event type" }),
                );
            }
        };

        berth_core::error::success(
            200,
            &serde_json::json!({ "status": status, "user_id": user_id }),
        )
    }
}

impl IdpWebhookPlugin {
    async fn sync_insert(
        &self,
        ctx: &AppContext,
        user_id: Uuid,
        record: IdpUserRecord,
    ) -> ApiResult<()> {
        if ctx.database.get_user_by_id(user_id).await?.is_some() {
            return Ok(());
        }
        let name = record.user_metadata["name"]
            .as_str()
            .filter(|n| !n.is_empty())
            .unwrap_or(&record.email)
            .to_string();

        ctx.database
            .create_user(CreateUser {
                id: Some(user_id),
                name,
                email: record.email.clone(),
                password_hash: String::new(),
                ..CreateUser::default()
            })
            .await?;
        tracing::info!(%user_id, email = %record.email, "idp user synced via webhook");
        Ok(())
    }

    async fn sync_update(
        &self,
        ctx: &AppContext,
        user_id: Uuid,
        record: IdpUserRecord,
    ) -> ApiResult<()> {
        let name = record.user_metadata["name"]
            .as_str()
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        ctx.database
            .update_user(
                user_id,
                UpdateUser {
                    name,
                    email: Some(record.email.clone()),
                    avatar_url: None,
                },
            )
            .await?;
        tracing::info!(%user_id, email = %record.email, "idp user updated via webhook");
        Ok(())
    }
}
