//! Super-admin console API under `/api/admin`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use taskflow_billing::SyncOutcome;
use taskflow_core::types::{AuditLog, FeatureFlag, Organization, PlanTier, Subscription, WebhookEvent};
use taskflow_core::TaskflowError;
use taskflow_platform::{AuditEntry, AuditQuery, ComplianceReport, FlagEvaluation};
use tracing::warn;
use uuid::Uuid;

use crate::auth::SuperAdmin;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ─── Organizations ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListOrganizationsParams {
    #[serde(default)]
    pub include_deleted: bool,
}

pub async fn list_organizations(
    State(state): State<AppState>,
    _admin: SuperAdmin,
    Query(params): Query<ListOrganizationsParams>,
) -> Json<Vec<Organization>> {
    Json(state.tenants.list_organizations(params.include_deleted))
}

#[derive(Debug, Deserialize)]
pub struct PlanOverrideRequest {
    /// `null` clears the override and falls back to `free`.
    pub plan: Option<PlanTier>,
}

pub async fn override_plan(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Path(id): Path<Uuid>,
    Json(req): Json<PlanOverrideRequest>,
) -> ApiResult<Json<Organization>> {
    let org = state.tenants.override_plan(id, req.plan)?;
    state.audit.log(
        AuditEntry::new("admin.plan_override", "organization")
            .organization(id)
            .user(&admin.sub)
            .resource_id(id.to_string())
            .meta("plan", org.effective_plan().as_str()),
    );
    Ok(Json(org))
}

pub async fn delete_organization(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.tenants.soft_delete(id)?;
    state.audit.log(
        AuditEntry::new("admin.organization_delete", "organization")
            .organization(id)
            .user(&admin.sub)
            .resource_id(id.to_string()),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    _admin: SuperAdmin,
) -> Json<Vec<Subscription>> {
    Json(state.db.list_subscriptions())
}

// ─── Audit ─────────────────────────────────────────────────────────────────

pub async fn audit_logs(
    State(state): State<AppState>,
    _admin: SuperAdmin,
    Query(filter): Query<AuditQuery>,
) -> Json<Vec<AuditLog>> {
    Json(state.audit.query(&filter))
}

#[derive(Debug, Deserialize)]
pub struct ComplianceParams {
    pub organization_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Defaults to the last 30 days.
pub async fn compliance_report(
    State(state): State<AppState>,
    _admin: SuperAdmin,
    Query(params): Query<ComplianceParams>,
) -> ApiResult<Json<ComplianceReport>> {
    let to = params.to.unwrap_or_else(|| state.clock.now());
    let from = params.from.unwrap_or(to - Duration::days(30));
    if from > to {
        return Err(ApiError::bad_request("`from` must not be after `to`"));
    }
    Ok(Json(
        state
            .audit
            .export_compliance_report(params.organization_id, from, to),
    ))
}

// ─── Webhooks ──────────────────────────────────────────────────────────────

pub async fn webhook_events(
    State(state): State<AppState>,
    _admin: SuperAdmin,
) -> Json<Vec<WebhookEvent>> {
    Json(state.db.webhook_events())
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SyncOutcome>> {
    let outcome = state.sync.replay(id).map_err(|e| match e {
        taskflow_billing::WebhookError::Store(inner) => ApiError::from(inner),
        other => {
            warn!(record_id = %id, error = %other, "Webhook replay failed");
            ApiError::bad_request("stored event could not be applied")
        }
    })?;
    state.audit.log(
        AuditEntry::new("admin.webhook_replay", "webhook_event")
            .user(&admin.sub)
            .resource_id(id.to_string()),
    );
    Ok(Json(outcome))
}

// ─── Feature flags ─────────────────────────────────────────────────────────

pub async fn list_flags(State(state): State<AppState>, _admin: SuperAdmin) -> Json<Vec<FeatureFlag>> {
    Json(state.flags.list_flags())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default = "full_rollout")]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub enabled: bool,
}

fn full_rollout() -> u8 {
    100
}

pub async fn create_flag(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Json(req): Json<CreateFlagRequest>,
) -> ApiResult<(StatusCode, Json<FeatureFlag>)> {
    let mut flag = state.flags.create_flag(
        &req.name,
        &req.description,
        req.organization_id,
        req.rollout_percentage,
    )?;
    if req.enabled {
        flag = state.flags.set_enabled(&flag.name, true)?;
    }
    state.audit.log(
        AuditEntry::new("admin.flag_create", "feature_flag")
            .user(&admin.sub)
            .resource_id(&flag.name),
    );
    Ok((StatusCode::CREATED, Json(flag)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagRequest {
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<u8>,
}

pub async fn update_flag(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Path(name): Path<String>,
    Json(req): Json<UpdateFlagRequest>,
) -> ApiResult<Json<FeatureFlag>> {
    let mut flag = state
        .db
        .get_flag(&name)
        .ok_or_else(|| TaskflowError::not_found("feature flag", &name))?;
    if let Some(pct) = req.rollout_percentage {
        flag = state.flags.set_rollout(&name, pct)?;
    }
    if let Some(enabled) = req.enabled {
        flag = state.flags.set_enabled(&name, enabled)?;
    }
    state.audit.log(
        AuditEntry::new("admin.flag_update", "feature_flag")
            .user(&admin.sub)
            .resource_id(&name)
            .meta("enabled", flag.enabled)
            .meta("rolloutPercentage", flag.rollout_percentage),
    );
    Ok(Json(flag))
}

pub async fn delete_flag(
    State(state): State<AppState>,
    SuperAdmin(admin): SuperAdmin,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.flags.delete_flag(&name) {
        return Err(TaskflowError::not_found("feature flag", &name).into());
    }
    state.audit.log(
        AuditEntry::new("admin.flag_delete", "feature_flag")
            .user(&admin.sub)
            .resource_id(&name),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EvaluateParams {
    pub organization_id: Uuid,
}

pub async fn evaluate_flag(
    State(state): State<AppState>,
    _admin: SuperAdmin,
    Path(name): Path<String>,
    Query(params): Query<EvaluateParams>,
) -> Json<FlagEvaluation> {
    Json(state.flags.evaluate(&name, params.organization_id))
}
