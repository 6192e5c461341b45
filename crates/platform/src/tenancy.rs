//! Multi-tenancy: organizations and their team members.

use std::sync::Arc;

use taskflow_billing::plan_limit;
use taskflow_core::types::{
    MemberRole, MemberStatus, MetricType, Organization, PlanTier, RecordState, TeamMember,
};
use taskflow_core::{Clock, TaskflowError, TaskflowResult};
use taskflow_store::Database;
use tracing::info;
use uuid::Uuid;

/// Creates organizations and manages their membership rules: one immutable
/// owner per organization, team size bounded by the plan.
#[derive(Clone)]
pub struct TenantManager {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Create an organization owned by `owner_id`, together with the owner's membership.
    pub fn create_organization(
        &self,
        name: &str,
        owner_id: &str,
    ) -> TaskflowResult<(Organization, TeamMember)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TaskflowError::Validation("organization name is required".into()));
        }
        if self.membership_of(owner_id).is_some() {
            return Err(TaskflowError::Conflict(
                "user already belongs to an organization".into(),
            ));
        }

        let now = self.clock.now();
        let org = self.db.insert_organization(Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: self.unique_slug(name),
            owner_id: owner_id.to_string(),
            plan: None,
            subscription_id: None,
            settings: serde_json::json!({}),
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        })?;
        let owner = self.db.insert_member(TeamMember {
            id: Uuid::new_v4(),
            organization_id: org.id,
            user_id: owner_id.to_string(),
            role: MemberRole::Owner,
            status: MemberStatus::Active,
            invited_by: None,
            created_at: now,
            updated_at: now,
        })?;

        info!(organization_id = %org.id, slug = %org.slug, "Organization created");
        Ok((org, owner))
    }

    fn unique_slug(&self, name: &str) -> String {
        let base = slugify(name);
        let base = if base.is_empty() { "org".to_string() } else { base };
        if !self.db.slug_exists(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.db.slug_exists(candidate))
            .unwrap_or(base)
    }

    /// A live (not soft-deleted) organization.
    pub fn get_organization(&self, id: Uuid) -> TaskflowResult<Organization> {
        self.db
            .get_organization(id)
            .filter(|o| o.state.is_active())
            .ok_or_else(|| TaskflowError::not_found("organization", id))
    }

    pub fn list_organizations(&self, include_deleted: bool) -> Vec<Organization> {
        self.db
            .list_organizations()
            .into_iter()
            .filter(|o| include_deleted || o.state.is_active())
            .collect()
    }

    /// The organization a user currently acts in, with their membership.
    pub fn membership_of(&self, user_id: &str) -> Option<(Organization, TeamMember)> {
        let member = self.db.active_membership(user_id)?;
        let org = self.get_organization(member.organization_id).ok()?;
        Some((org, member))
    }

    pub fn list_members(&self, organization_id: Uuid) -> TaskflowResult<Vec<TeamMember>> {
        self.get_organization(organization_id)?;
        Ok(self.db.members_of(organization_id))
    }

    fn require_manager(&self, organization_id: Uuid, actor_id: &str) -> TaskflowResult<TeamMember> {
        let actor = self
            .db
            .find_member(organization_id, actor_id)
            .filter(|m| m.status == MemberStatus::Active)
            .ok_or_else(|| TaskflowError::Forbidden("not a member of this organization".into()))?;
        if !actor.role.can_manage_members() {
            return Err(TaskflowError::Forbidden(
                "only owners and admins can manage members".into(),
            ));
        }
        Ok(actor)
    }

    /// Add `user_id` to the organization. The team-size limit of the plan
    /// counts every existing membership, pending ones included.
    pub fn add_member(
        &self,
        organization_id: Uuid,
        actor_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> TaskflowResult<TeamMember> {
        let org = self.get_organization(organization_id)?;
        self.require_manager(organization_id, actor_id)?;
        if role == MemberRole::Owner {
            return Err(TaskflowError::Validation(
                "an organization has exactly one owner".into(),
            ));
        }
        if self.membership_of(user_id).is_some() {
            return Err(TaskflowError::Conflict(
                "user already belongs to an organization".into(),
            ));
        }

        let team_size = self.db.members_of(organization_id).len() as u64;
        if let Some(max) = plan_limit(org.effective_plan(), MetricType::TeamMembers).as_u64() {
            if team_size >= max {
                return Err(TaskflowError::Forbidden(format!(
                    "team member limit reached for the {} plan ({max})",
                    org.effective_plan()
                )));
            }
        }

        let now = self.clock.now();
        let member = self.db.insert_member(TeamMember {
            id: Uuid::new_v4(),
            organization_id,
            user_id: user_id.to_string(),
            role,
            status: MemberStatus::Active,
            invited_by: Some(actor_id.to_string()),
            created_at: now,
            updated_at: now,
        })?;
        info!(organization_id = %organization_id, user_id = %user_id, role = ?role, "Member added");
        Ok(member)
    }

    pub fn update_member_role(
        &self,
        organization_id: Uuid,
        actor_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> TaskflowResult<TeamMember> {
        self.get_organization(organization_id)?;
        self.require_manager(organization_id, actor_id)?;
        let member = self
            .db
            .find_member(organization_id, user_id)
            .ok_or_else(|| TaskflowError::not_found("team member", user_id))?;
        if member.role == MemberRole::Owner {
            return Err(TaskflowError::Forbidden("the owner's role cannot be changed".into()));
        }
        if role == MemberRole::Owner {
            return Err(TaskflowError::Validation(
                "an organization has exactly one owner".into(),
            ));
        }
        let now = self.clock.now();
        self.db.patch_member(member.id, |m| {
            m.role = role;
            m.updated_at = now;
        })
    }

    pub fn remove_member(
        &self,
        organization_id: Uuid,
        actor_id: &str,
        user_id: &str,
    ) -> TaskflowResult<TeamMember> {
        self.get_organization(organization_id)?;
        self.require_manager(organization_id, actor_id)?;
        let member = self
            .db
            .find_member(organization_id, user_id)
            .ok_or_else(|| TaskflowError::not_found("team member", user_id))?;
        let removed = self.db.remove_member(member.id)?;
        info!(organization_id = %organization_id, user_id = %user_id, "Member removed");
        Ok(removed)
    }

    /// Admin override of the plan. `None` falls back to `free`.
    pub fn override_plan(
        &self,
        organization_id: Uuid,
        plan: Option<PlanTier>,
    ) -> TaskflowResult<Organization> {
        self.get_organization(organization_id)?;
        let now = self.clock.now();
        let org = self.db.patch_organization(organization_id, |o| {
            o.plan = plan;
            o.updated_at = now;
        })?;
        info!(organization_id = %organization_id, plan = %org.effective_plan(), "Plan overridden");
        Ok(org)
    }

    /// Mark an organization deleted and suspend its memberships. Rows are retained.
    pub fn soft_delete(&self, organization_id: Uuid) -> TaskflowResult<Organization> {
        self.get_organization(organization_id)?;
        let now = self.clock.now();
        let org = self.db.patch_organization(organization_id, |o| {
            o.state = RecordState::Deleted { at: now };
            o.updated_at = now;
        })?;
        for member in self.db.members_of(organization_id) {
            self.db.patch_member(member.id, |m| {
                m.status = MemberStatus::Suspended;
                m.updated_at = now;
            })?;
        }
        info!(organization_id = %organization_id, "Organization soft-deleted");
        Ok(org)
    }
}

fn slugify(name: &str) -> String {
    let raw: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    raw.split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
