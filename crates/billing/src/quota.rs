//! Monthly quota enforcement against a static per-plan limit table.
//!
//! The check is read-only and not atomic with the usage write that follows
//! it: two concurrent requests can both pass and overshoot the limit. The
//! limit is a soft ceiling.

use serde::{Serialize, Serializer};
use taskflow_core::types::{MetricType, PlanTier};
use taskflow_core::{TaskflowError, TaskflowResult};
use tracing::debug;
use uuid::Uuid;

use crate::metering::UsageMeter;

/// A quota ceiling, or the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl QuotaLimit {
    pub fn as_u64(self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(n),
            Self::Unlimited => None,
        }
    }

    fn saturating_sub(self, used: u64) -> Self {
        match self {
            Self::Limited(n) => Self::Limited(n.saturating_sub(used)),
            Self::Unlimited => Self::Unlimited,
        }
    }
}

impl std::fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u64(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

const MB_PER_GB: u64 = 1024;

/// Per-plan monthly limits. `None` means the metric has no configured limit.
fn configured_limit(plan: PlanTier, metric: MetricType) -> Option<u64> {
    match (plan, metric) {
        (PlanTier::Free, MetricType::AiMessages) => Some(100),
        (PlanTier::Free, MetricType::ApiCalls) => Some(1_000),
        (PlanTier::Free, MetricType::StorageMb) => Some(100),
        (PlanTier::Free, MetricType::TeamMembers) => Some(3),
        (PlanTier::Pro, MetricType::AiMessages) => Some(10_000),
        (PlanTier::Pro, MetricType::ApiCalls) => Some(100_000),
        (PlanTier::Pro, MetricType::StorageMb) => Some(10 * MB_PER_GB),
        (PlanTier::Pro, MetricType::TeamMembers) => Some(25),
        _ => None,
    }
}

/// The monthly limit for a plan and metric.
pub fn plan_limit(plan: PlanTier, metric: MetricType) -> QuotaLimit {
    configured_limit(plan, metric)
        .map(QuotaLimit::Limited)
        .unwrap_or(QuotaLimit::Unlimited)
}

/// Outcome of a quota check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub has_quota: bool,
    pub used: u64,
    pub limit: QuotaLimit,
    pub remaining: QuotaLimit,
    /// Always within `[0, 100]`.
    pub percentage: f64,
}

impl QuotaStatus {
    pub fn evaluate(used: u64, limit: QuotaLimit) -> Self {
        match limit {
            QuotaLimit::Unlimited => Self {
                has_quota: true,
                used,
                limit,
                remaining: QuotaLimit::Unlimited,
                percentage: 0.0,
            },
            QuotaLimit::Limited(max) => {
                let percentage = if max == 0 {
                    100.0
                } else {
                    (used as f64 * 100.0 / max as f64).clamp(0.0, 100.0)
                };
                Self {
                    has_quota: used < max,
                    used,
                    limit,
                    remaining: limit.saturating_sub(used),
                    percentage,
                }
            }
        }
    }
}

/// Quota status for one metric, as listed by the usage overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuota {
    pub metric_type: MetricType,
    #[serde(flatten)]
    pub status: QuotaStatus,
}

/// Plan-aware quota checks over metered usage.
#[derive(Clone)]
pub struct QuotaEnforcer {
    meter: UsageMeter,
}

impl QuotaEnforcer {
    pub fn new(meter: UsageMeter) -> Self {
        Self { meter }
    }

    fn plan_of(&self, organization_id: Uuid) -> TaskflowResult<PlanTier> {
        let org = self
            .meter
            .database()
            .get_organization(organization_id)
            .filter(|o| o.state.is_active())
            .ok_or_else(|| TaskflowError::not_found("organization", organization_id))?;
        Ok(org.effective_plan())
    }

    /// Compare this month's usage against the organization's plan limit.
    ///
    /// Fails only when the organization does not exist; an exhausted quota
    /// is reported through `has_quota`.
    pub fn check_quota(
        &self,
        organization_id: Uuid,
        metric_type: MetricType,
    ) -> TaskflowResult<QuotaStatus> {
        let plan = self.plan_of(organization_id)?;
        let status = self.status_for(organization_id, plan, metric_type);
        debug!(
            organization_id = %organization_id,
            plan = %plan,
            metric = %metric_type,
            used = status.used,
            has_quota = status.has_quota,
            "Quota checked"
        );
        Ok(status)
    }

    /// Quota status for every metric type.
    pub fn usage_overview(&self, organization_id: Uuid) -> TaskflowResult<Vec<MetricQuota>> {
        let plan = self.plan_of(organization_id)?;
        Ok(MetricType::ALL
            .into_iter()
            .map(|metric_type| MetricQuota {
                metric_type,
                status: self.status_for(organization_id, plan, metric_type),
            })
            .collect())
    }

    fn status_for(&self, organization_id: Uuid, plan: PlanTier, metric: MetricType) -> QuotaStatus {
        let used = self.meter.current_usage(organization_id, metric);
        QuotaStatus::evaluate(used, plan_limit(plan, metric))
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }
}
