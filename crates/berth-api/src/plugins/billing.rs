//! Billing endpoints: public plan catalogue, per-org overview, subscription
//! lifecycle, invoices, usage, and the payment-provider webhook.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use berth_core::context::RequestContext;
use berth_core::error::{self, ApiError, ApiResult};
use berth_core::plugin::{ApiPlugin, AppContext, Route};
use berth_core::types::{
    ApiRequest, ApiResponse, BillingCycle, BillingPlan, Invoice, InvoiceStatus, OrgRole,
    Subscription, SubscriptionStatus,
};

use crate::featuregate::GateService;
use crate::signature::{constant_time_token_eq, verify_hmac_signature};

pub const XENDIT_TOKEN_HEADER: &str = "x-callback-token";
pub const XENDIT_SIGNATURE_HEADER: &str = "x-callback-signature";

const INVOICE_DUE_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    plan_id: Uuid,
    billing_cycle: BillingCycle,
}

#[derive(Debug, Deserialize)]
struct XenditWebhookPayload {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Serialize)]
struct BillingOverview {
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription: Option<SubscriptionWithPlan>,
    usage: UsageResponse,
}

#[derive(Debug, Serialize)]
struct SubscriptionWithPlan {
    #[serde(flatten)]
    subscription: Subscription,
    plan: BillingPlan,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    projects_used: usize,
    projects_limit: i32,
    deployments_used: usize,
    deployments_limit: i32,
    members_used: usize,
    members_limit: i32,
}

pub struct BillingPlugin;

#[async_trait]
impl ApiPlugin for BillingPlugin {
    fn name(&self) -> &'static str {
        "billing"
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::get("/api/v1/billing/plans", "list_plans").public(),
            Route::get("/api/v1/orgs/:orgId/billing", "billing_overview"),
            Route::post("/api/v1/orgs/:orgId/billing/subscribe", "subscribe")
                .org_role(OrgRole::Owner),
            Route::post("/api/v1/orgs/:orgId/billing/cancel", "cancel_subscription")
                .org_role(OrgRole::Owner),
            Route::get("/api/v1/orgs/:orgId/billing/invoices", "list_invoices"),
            Route::get("/api/v1/orgs/:orgId/billing/usage", "usage"),
            Route::post("/api/v1/webhooks/xendit", "xendit_webhook").public(),
        ]
    }

    async fn handle(
        &self,
        operation: &str,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        match operation {
            "list_plans" => self.handle_list_plans(ctx).await,
            "billing_overview" => self.handle_billing_overview(rctx, ctx).await,
            "subscribe" => self.handle_subscribe(req, rctx, ctx).await,
            "cancel_subscription" => self.handle_cancel(rctx, ctx).await,
            "list_invoices" => self.handle_list_invoices(rctx, ctx).await,
            "usage" => self.handle_usage(rctx, ctx).await,
            "xendit_webhook" => self.handle_xendit_webhook(req, ctx).await,
            _ => Err(ApiError::not_found("No handler for this request")),
        }
    }
}

impl BillingPlugin {
    async fn handle_list_plans(&self, ctx: &AppContext) -> ApiResult<ApiResponse> {
        let plans = ctx.database.list_active_plans().await?;
        error::success(200, &plans)
    }

    async fn handle_billing_overview(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let org_id = rctx.org()?.org_id;
        let subscription = ctx
            .database
            .current_subscription(org_id)
            .await?
            .map(|(subscription, plan)| SubscriptionWithPlan { subscription, plan });
        let usage = self.usage_for(org_id, ctx).await?;
        error::success(
            200,
            &BillingOverview {
                subscription,
                usage,
            },
        )
    }

    async fn handle_subscribe(
        &self,
        req: &ApiRequest,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let org_id = rctx.org()?.org_id;
        let body: SubscribeRequest = req
            .body_as_json()
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))?;

        if ctx.database.current_subscription(org_id).await?.is_some() {
            return Err(ApiError::conflict(
                "Organization already has an active subscription",
            ));
        }

        let plan = ctx
            .database
            .get_plan_by_id(body.plan_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Billing plan not found"))?;

        let now = Utc::now();
        let period_end = match body.billing_cycle {
            BillingCycle::Monthly => now + Duration::days(30),
            BillingCycle::Yearly => now + Duration::days(365),
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            org_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            billing_cycle: body.billing_cycle,
            current_period_start: now,
            current_period_end: period_end,
            cancelled_at: None,
            created_at: now,
        };
        ctx.database.create_subscription(subscription.clone()).await?;

        let amount = match body.billing_cycle {
            BillingCycle::Monthly => plan.price_monthly,
            BillingCycle::Yearly => plan.price_yearly,
        };
        ctx.database
            .create_invoice(Invoice {
                id: Uuid::new_v4(),
                org_id,
                subscription_id: subscription.id,
                amount,
                currency: plan.currency.clone(),
                status: InvoiceStatus::Pending,
                due_date: now + Duration::days(INVOICE_DUE_DAYS),
                paid_at: None,
                external_id: None,
                payment_url: None,
                created_at: now,
            })
            .await?;

        error::success(
            201,
            &SubscriptionWithPlan {
                subscription,
                plan,
            },
        )
    }

    async fn handle_cancel(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let org_id = rctx.org()?.org_id;
        let (mut subscription, _) = ctx
            .database
            .current_subscription(org_id)
            .await?
            .ok_or_else(|| ApiError::not_found("No active subscription found"))?;

        subscription.status = SubscriptionStatus::Cancelled;
        subscription.cancelled_at = Some(Utc::now());
        ctx.database.update_subscription(subscription).await?;

        error::success(200, &serde_json::json!({ "message": "Subscription cancelled" }))
    }

    async fn handle_list_invoices(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let invoices = ctx.database.list_org_invoices(rctx.org()?.org_id).await?;
        error::success(200, &invoices)
    }

    async fn handle_usage(
        &self,
        rctx: &RequestContext,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let usage = self.usage_for(rctx.org()?.org_id, ctx).await?;
        error::success(200, &usage)
    }

    async fn usage_for(&self, org_id: Uuid, ctx: &AppContext) -> ApiResult<UsageResponse> {
        let gate = GateService::new(ctx.database.clone());
        let limits = gate.plan_limits(org_id).await?;
        Ok(UsageResponse {
            projects_used: ctx.database.count_org_projects(org_id).await?,
            projects_limit: limits.max_projects,
            deployments_used: ctx.database.count_running_deployments(org_id).await?,
            deployments_limit: limits.max_deployments,
            members_used: ctx.database.count_org_members(org_id).await?,
            members_limit: limits.max_members,
        })
    }

    /// Payment-provider callback. Verified by shared-token equality or an
    /// HMAC signature over the raw body; the state transition is idempotent
    /// so provider retries are harmless.
    async fn handle_xendit_webhook(
        &self,
        req: &ApiRequest,
        ctx: &AppContext,
    ) -> ApiResult<ApiResponse> {
        let secret = &ctx.config.xendit.webhook_token;
        if secret.is_empty() {
            return Err(ApiError::InvalidSignature);
        }

        let body = req.body.as_deref().unwrap_or_default();
        let token_ok = req
            .header(XENDIT_TOKEN_HEADER)
            .map(|token| constant_time_token_eq(token, secret))
            .unwrap_or(false);
        let signature_ok = req
            .header(XENDIT_SIGNATURE_HEADER)
            .map(|sig| verify_hmac_signature(body, sig, secret))
            .unwrap_or(false);
        if !token_ok && !signature_ok {
            return Err(ApiError::InvalidSignature);
        }

        let payload: XenditWebhookPayload = serde_json::from_slice(body)
            .map_err(|_| ApiError::bad_request("Invalid webhook payload"))?;

        let mut invoice = ctx
            .database
            .get_invoice_by_external_id(&payload.id)
            .await?
            .ok_or_else(|| {
                ApiError::not_found(format!("Invoice not found for external ID: {}", payload.id))
            })?;

        match payload.status.as_str() {
            "PAID" | "SETTLED" => {
                // Re-delivery of a paid event must be a no-op, not an error.
                if invoice.status != InvoiceStatus::Paid {
                    invoice.status = InvoiceStatus::Paid;
                    invoice.paid_at = Some(Utc::now());
                    ctx.database.update_invoice(invoice).await?;
                }
            }
            "EXPIRED" => {
                if invoice.status == InvoiceStatus::Pending {
                    invoice.status = InvoiceStatus::Failed;
                    ctx.database.update_invoice(invoice).await?;
                }
            }
            other => {
                tracing::info!(status = %other, external_id = %payload.id, "ignoring webhook status");
            }
        }

        error::success(200, &serde_json::json!({ "message": "Webhook processed" }))
    }
}
