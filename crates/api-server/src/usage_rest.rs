//! GET /api/usage: this month's quota status for the caller's organization.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use taskflow_billing::quota::MetricQuota;
use taskflow_core::types::PlanTier;
use uuid::Uuid;

use crate::auth::OrgMember;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub organization_id: Uuid,
    pub plan: PlanTier,
    pub metrics: Vec<MetricQuota>,
}

pub async fn usage_overview(
    State(state): State<AppState>,
    member: OrgMember,
) -> ApiResult<Json<UsageResponse>> {
    let org = member.organization;
    let metrics = state.quota.usage_overview(org.id)?;
    Ok(Json(UsageResponse {
        organization_id: org.id,
        plan: org.effective_plan(),
        metrics,
    }))
}
