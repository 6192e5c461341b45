//! Bearer-token extractors.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use taskflow_core::types::{Organization, TeamMember};
use taskflow_platform::SessionClaims;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// A verified session. Rejects with 401.
pub struct AuthUser(pub SessionClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(ApiError::unauthorized)?;
        let sessions = state.sessions.as_ref().ok_or_else(ApiError::unauthorized)?;
        let claims = sessions.verify(token).map_err(|e| {
            debug!(error = %e, "Session rejected");
            ApiError::unauthorized()
        })?;
        Ok(Self(claims))
    }
}

/// A verified session with the `super_admin` role. Rejects with 401 or 403.
pub struct SuperAdmin(pub SessionClaims);

#[async_trait]
impl FromRequestParts<AppState> for SuperAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        if !claims.is_super_admin() {
            return Err(ApiError::forbidden("Super admin access required"));
        }
        Ok(Self(claims))
    }
}

/// The caller's session together with their organization.
/// Rejects with 401, 403 (no membership), or 404 (organization gone).
pub struct OrgMember {
    pub claims: SessionClaims,
    pub organization: Organization,
    pub membership: TeamMember,
}

#[async_trait]
impl FromRequestParts<AppState> for OrgMember {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        let membership = state
            .db
            .active_membership(&claims.sub)
            .ok_or_else(|| ApiError::forbidden("No organization found for this user"))?;
        let organization = state.tenants.get_organization(membership.organization_id)?;
        Ok(Self {
            claims,
            organization,
            membership,
        })
    }
}
