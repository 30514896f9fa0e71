//! Subscription quota and feature-flag gating.
//!
//! For a tenant, limits come from the most recent non-terminal
//! subscription's plan, falling back to the free tier when none exists.
//! A cap of `-1` means unlimited. Gating runs after tenancy resolution and
//! before the handler; a race between two concurrent creators may overshoot
//! a limit by one, which is accepted.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use berth_core::adapters::DatabaseAdapter;
use berth_core::error::{ApiError, ApiResult};
use berth_core::types::{BillingPlan, QuotaResource};

/// Resolved limits for a tenant.
#[derive(Debug, Clone)]
pub struct PlanLimits {
    pub max_projects: i32,
    pub max_deployments: i32,
    pub max_members: i32,
    pub features: Vec<String>,
}

/// Free-tier defaults used when a tenant has no subscription.
pub const FREE_TIER_LIMITS: PlanLimits = PlanLimits {
    max_projects: 1,
    max_deployments: 5,
    max_members: 1,
    features: Vec::new(),
};

/// Checks subscription quotas and feature flags for tenants.
pub struct GateService {
    database: Arc<dyn DatabaseAdapter>,
}

impl GateService {
    pub fn new(database: Arc<dyn DatabaseAdapter>) -> Self {
        Self { database }
    }

    /// Resolve the active plan limits for a tenant.
    pub async fn plan_limits(&self, org_id: Uuid) -> ApiResult<PlanLimits> {
        match self.database.current_subscription(org_id).await? {
            Some((_, plan)) => Ok(PlanLimits {
                max_projects: plan.max_projects,
                max_deployments: plan.max_deployments,
                max_members: plan.max_members,
                features: plan.features,
            }),
            None => Ok(FREE_TIER_LIMITS),
        }
    }

    /// Verify the tenant is below its cap for `resource`, else fail with
    /// `UPGRADE_REQUIRED` naming the limit.
    pub async fn check_quota(&self, org_id: Uuid, resource: QuotaResource) -> ApiResult<()> {
        let limits = self.plan_limits(org_id).await?;

        let (current, max) = match resource {
            QuotaResource::Projects => (
                self.database.count_org_projects(org_id).await?,
                limits.max_projects,
            ),
            QuotaResource::Deployments => (
                self.database.count_running_deployments(org_id).await?,
                limits.max_deployments,
            ),
            QuotaResource::Members => (
                self.database.count_org_members(org_id).await?,
                limits.max_members,
            ),
        };

        if max == -1 {
            return Ok(());
        }
        if current as i64 >= max as i64 {
            return Err(ApiError::quota_exceeded(resource.as_str(), max));
        }
        Ok(())
    }

    /// Whether the tenant's plan includes the named feature flag.
    pub async fn has_feature(&self, org_id: Uuid, feature: &str) -> ApiResult<bool> {
        let limits = self.plan_limits(org_id).await?;
        Ok(limits.features.iter().any(|f| f == feature))
    }

    /// Fail with `UPGRADE_REQUIRED`/`feature_not_available` when missing.
    pub async fn require_feature(&self, org_id: Uuid, feature: &str) -> ApiResult<()> {
        if self.has_feature(org_id, feature).await? {
            Ok(())
        } else {
            Err(ApiError::feature_not_available(feature))
        }
    }
}

/// Built-in tier slugs.
pub const TIER_FREE: &str = "free";
pub const TIER_PRO: &str = "pro";
pub const TIER_ENTERPRISE: &str = "enterprise";

/// The three built-in tier definitions.
pub fn default_plans() -> Vec<BillingPlan> {
    let now = Utc::now();
    vec![
        BillingPlan {
            id: Uuid::new_v4(),
            name: "Free".to_string(),
            slug: TIER_FREE.to_string(),
            price_monthly: 0,
            price_yearly: 0,
            currency: "IDR".to_string(),
            max_projects: 1,
            max_deployments: 5,
            max_members: 1,
            features: vec![],
            is_active: true,
            created_at: now,
        },
        BillingPlan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            slug: TIER_PRO.to_string(),
            price_monthly: 299_000,
            price_yearly: 2_990_000,
            currency: "IDR".to_string(),
            max_projects: 10,
            max_deployments: 50,
            max_members: 10,
            features: vec!["custom_domain".to_string(), "priority_support".to_string()],
            is_active: true,
            created_at: now,
        },
        BillingPlan {
            id: Uuid::new_v4(),
            name: "Enterprise".to_string(),
            slug: TIER_ENTERPRISE.to_string(),
            price_monthly: 999_000,
            price_yearly: 9_990_000,
            currency: "IDR".to_string(),
            max_projects: -1,
            max_deployments: -1,
            max_members: -1,
            features: vec![
                "custom_domain".to_string(),
                "priority_support".to_string(),
                "sso".to_string(),
                "audit_logs".to_string(),
                "sla".to_string(),
            ],
            is_active: true,
            created_at: now,
        },
    ]
}

/// Insert the built-in tiers; existing slugs are left untouched.
pub async fn seed_default_plans(database: &dyn DatabaseAdapter) -> ApiResult<()> {
    for plan in default_plans() {
        database.seed_plan(plan).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::adapters::MemoryDatabaseAdapter;
    use berth_core::types::{
        BillingCycle, CreateOrg, CreateProject, Subscription, SubscriptionStatus,
    };
    use chrono::Duration;

    async fn org_on(db: &Arc<MemoryDatabaseAdapter>, plan_slug: Option<&str>) -> Uuid {
        seed_default_plans(db.as_ref()).await.unwrap();
        let (org, _) = db
            .create_org_with_owner(
                CreateOrg {
                    name: "Acme".to_string(),
                    slug: format!("acme-{}", Uuid::new_v4()),
                },
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        if let Some(slug) = plan_slug {
            let plan = db.get_plan_by_slug(slug).await.unwrap().unwrap();
            let now = Utc::now();
            db.create_subscription(Subscription {
                id: Uuid::new_v4(),
                org_id: org.id,
                plan_id: plan.id,
                status: SubscriptionStatus::Active,
                billing_cycle: BillingCycle::Monthly,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
                cancelled_at: None,
                created_at: now,
            })
            .await
            .unwrap();
        }
        org.id
    }

    #[tokio::test]
    async fn test_no_subscription_falls_back_to_free_tier() {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let org_id = org_on(&db, None).await;
        let gate = GateService::new(db);

        let limits = gate.plan_limits(org_id).await.unwrap();
        assert_eq!(limits.max_projects, 1);
        assert_eq!(limits.max_deployments, 5);
        assert_eq!(limits.max_members, 1);
        assert!(limits.features.is_empty());
    }

    #[tokio::test]
    async fn test_quota_blocks_at_free_project_limit() {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let org_id = org_on(&db, None).await;
        let gate = GateService::new(db.clone());

        gate.check_quota(org_id, QuotaResource::Projects)
            .await
            .unwrap();

        db.create_project(CreateProject {
            org_id,
            name: "web".to_string(),
            description: None,
            repo_url: None,
        })
        .await
        .unwrap();

        let err = gate
            .check_quota(org_id, QuotaResource::Projects)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 402);
        assert!(err.to_string().contains("(1)"));
    }

    #[tokio::test]
    async fn test_unlimited_plan_never_blocks() {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let org_id = org_on(&db, Some(TIER_ENTERPRISE)).await;
        let gate = GateService::new(db.clone());

        for _ in 0..3 {
            db.create_project(CreateProject {
                org_id,
                name: "svc".to_string(),
                description: None,
                repo_url: None,
            })
            .await
            .unwrap();
        }
        gate.check_quota(org_id, QuotaResource::Projects)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_feature_flags_come_from_the_plan() {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let free_org = org_on(&db, None).await;
        let pro_org = org_on(&db, Some(TIER_PRO)).await;
        let gate = GateService::new(db);

        assert!(!gate.has_feature(free_org, "custom_domain").await.unwrap());
        assert!(gate.has_feature(pro_org, "custom_domain").await.unwrap());
        assert!(!gate.has_feature(pro_org, "audit_logs").await.unwrap());

        let err = gate
            .require_feature(pro_org, "audit_logs")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 402);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_reverts_to_free() {
        let db = Arc::new(MemoryDatabaseAdapter::new());
        let org_id = org_on(&db, Some(TIER_PRO)).await;
        let gate = GateService::new(db.clone());

        let (mut sub, _) = db.current_subscription(org_id).await.unwrap().unwrap();
        sub.status = SubscriptionStatus::Cancelled;
        sub.cancelled_at = Some(Utc::now());
        db.update_subscription(sub).await.unwrap();

        let limits = gate.plan_limits(org_id).await.unwrap();
        assert_eq!(limits.max_projects, 1);
    }
}
