//! Organization and team-member endpoints for the caller's own organization.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use taskflow_core::types::{MemberRole, Organization, TeamMember};
use taskflow_platform::{AuditEntry, FlagEvaluation};

use crate::auth::{AuthUser, OrgMember};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrganizationResponse {
    pub organization: Organization,
    pub membership: TeamMember,
}

/// POST /api/organizations
pub async fn create_organization(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(req): Json<CreateOrganizationRequest>,
) -> ApiResult<(StatusCode, Json<CreateOrganizationResponse>)> {
    let (organization, membership) = state.tenants.create_organization(&req.name, &claims.sub)?;
    state.audit.log(
        AuditEntry::new("organization.create", "organization")
            .organization(organization.id)
            .user(&claims.sub)
            .resource_id(organization.id.to_string())
            .meta("slug", organization.slug.clone()),
    );
    metrics::counter!("organizations.created").increment(1);
    Ok((
        StatusCode::CREATED,
        Json(CreateOrganizationResponse {
            organization,
            membership,
        }),
    ))
}

/// GET /api/organizations/current
pub async fn current_organization(member: OrgMember) -> Json<Organization> {
    Json(member.organization)
}

/// GET /api/organizations/members
pub async fn list_members(
    State(state): State<AppState>,
    member: OrgMember,
) -> ApiResult<Json<Vec<TeamMember>>> {
    Ok(Json(state.tenants.list_members(member.organization.id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: MemberRole,
}

fn default_role() -> MemberRole {
    MemberRole::Member
}

/// POST /api/organizations/members
pub async fn add_member(
    State(state): State<AppState>,
    member: OrgMember,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<TeamMember>)> {
    let org_id = member.organization.id;
    let added = state
        .tenants
        .add_member(org_id, &member.claims.sub, &req.user_id, req.role)?;
    state.audit.log(
        AuditEntry::new("member.add", "team_member")
            .organization(org_id)
            .user(&member.claims.sub)
            .resource_id(&req.user_id),
    );
    Ok((StatusCode::CREATED, Json(added)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: MemberRole,
}

/// PUT /api/organizations/members/:user_id
pub async fn update_member(
    State(state): State<AppState>,
    member: OrgMember,
    Path(user_id): Path<String>,
    Json(req): Json<UpdateMemberRequest>,
) -> ApiResult<Json<TeamMember>> {
    let org_id = member.organization.id;
    let updated = state
        .tenants
        .update_member_role(org_id, &member.claims.sub, &user_id, req.role)?;
    state.audit.log(
        AuditEntry::new("member.update_role", "team_member")
            .organization(org_id)
            .user(&member.claims.sub)
            .resource_id(&user_id)
            .meta("role", serde_json::to_value(req.role).unwrap_or_default()),
    );
    Ok(Json(updated))
}

/// DELETE /api/organizations/members/:user_id
pub async fn remove_member(
    State(state): State<AppState>,
    member: OrgMember,
    Path(user_id): Path<String>,
) -> ApiResult<StatusCode> {
    let org_id = member.organization.id;
    state
        .tenants
        .remove_member(org_id, &member.claims.sub, &user_id)?;
    state.audit.log(
        AuditEntry::new("member.remove", "team_member")
            .organization(org_id)
            .user(&member.claims.sub)
            .resource_id(&user_id),
    );
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/flags/:name: whether a feature is on for the caller's organization.
pub async fn evaluate_flag(
    State(state): State<AppState>,
    member: OrgMember,
    Path(name): Path<String>,
) -> Json<FlagEvaluation> {
    Json(state.flags.evaluate(&name, member.organization.id))
}
