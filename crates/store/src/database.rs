use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use taskflow_core::types::*;
use taskflow_core::{TaskflowError, TaskflowResult};
use tracing::info;
use uuid::Uuid;

/// Thread-safe in-memory tables for organizations, members, subscriptions,
/// usage, audit, webhook events, feature flags, and chat messages.
pub struct Database {
    organizations: DashMap<Uuid, Organization>,
    slugs: DashMap<String, Uuid>,
    team_members: DashMap<Uuid, TeamMember>,
    subscriptions: DashMap<Uuid, Subscription>,
    polar_ids: DashMap<String, Uuid>,
    usage_metrics: DashMap<Uuid, Vec<UsageMetric>>,
    audit_logs: DashMap<Uuid, AuditLog>,
    webhook_events: DashMap<Uuid, WebhookEvent>,
    feature_flags: DashMap<String, FeatureFlag>,
    chat_messages: DashMap<Uuid, ChatMessage>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        info!("Database initialized (in-memory)");
        Self {
            organizations: DashMap::new(),
            slugs: DashMap::new(),
            team_members: DashMap::new(),
            subscriptions: DashMap::new(),
            polar_ids: DashMap::new(),
            usage_metrics: DashMap::new(),
            audit_logs: DashMap::new(),
            webhook_events: DashMap::new(),
            feature_flags: DashMap::new(),
            chat_messages: DashMap::new(),
        }
    }

    /// Reachability check: reads one organization and one subscription and
    /// checks that their unique-key indexes resolve back to them.
    pub fn ping(&self) -> TaskflowResult<()> {
        if let Some(org) = self.organizations.iter().next() {
            let indexed = self.slugs.get(&org.slug).map(|id| *id);
            if indexed != Some(org.id) {
                return Err(TaskflowError::Internal(anyhow::anyhow!(
                    "slug index out of sync for organization {}",
                    org.id
                )));
            }
        }
        if let Some(sub) = self.subscriptions.iter().next() {
            let indexed = self.polar_ids.get(&sub.polar_id).map(|id| *id);
            if indexed != Some(sub.id) {
                return Err(TaskflowError::Internal(anyhow::anyhow!(
                    "polar_id index out of sync for subscription {}",
                    sub.id
                )));
            }
        }
        Ok(())
    }

    // ─── Organizations ─────────────────────────────────────────────────────

    /// Insert an organization. Fails if the slug is already taken.
    pub fn insert_organization(&self, org: Organization) -> TaskflowResult<Organization> {
        match self.slugs.entry(org.slug.clone()) {
            Entry::Occupied(_) => {
                return Err(TaskflowError::Conflict(format!(
                    "organization slug already in use: {}",
                    org.slug
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(org.id);
            }
        }
        self.organizations.insert(org.id, org.clone());
        Ok(org)
    }

    pub fn get_organization(&self, id: Uuid) -> Option<Organization> {
        self.organizations.get(&id).map(|r| r.value().clone())
    }

    pub fn get_organization_by_slug(&self, slug: &str) -> Option<Organization> {
        let id = *self.slugs.get(slug)?;
        self.get_organization(id)
    }

    pub fn slug_exists(&self, slug: &str) -> bool {
        self.slugs.contains_key(slug)
    }

    pub fn list_organizations(&self) -> Vec<Organization> {
        let mut orgs: Vec<Organization> =
            self.organizations.iter().map(|r| r.value().clone()).collect();
        orgs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orgs
    }

    /// Apply an in-place patch to one organization row.
    pub fn patch_organization<F>(&self, id: Uuid, patch: F) -> TaskflowResult<Organization>
    where
        F: FnOnce(&mut Organization),
    {
        let mut entry = self
            .organizations
            .get_mut(&id)
            .ok_or_else(|| TaskflowError::not_found("organization", id))?;
        patch(entry.value_mut());
        Ok(entry.value().clone())
    }

    // ─── Team members ──────────────────────────────────────────────────────

    /// Insert a membership. A user can belong to an organization only once.
    pub fn insert_member(&self, member: TeamMember) -> TaskflowResult<TeamMember> {
        if self
            .find_member(member.organization_id, &member.user_id)
            .is_some()
        {
            return Err(TaskflowError::Conflict(format!(
                "user {} is already a member of organization {}",
                member.user_id, member.organization_id
            )));
        }
        self.team_members.insert(member.id, member.clone());
        Ok(member)
    }

    pub fn members_of(&self, organization_id: Uuid) -> Vec<TeamMember> {
        let mut members: Vec<TeamMember> = self
            .team_members
            .iter()
            .filter(|r| r.value().organization_id == organization_id)
            .map(|r| r.value().clone())
            .collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        members
    }

    pub fn find_member(&self, organization_id: Uuid, user_id: &str) -> Option<TeamMember> {
        self.team_members
            .iter()
            .find(|r| r.value().organization_id == organization_id && r.value().user_id == user_id)
            .map(|r| r.value().clone())
    }

    /// The oldest active membership of a user, if any.
    pub fn active_membership(&self, user_id: &str) -> Option<TeamMember> {
        self.team_members
            .iter()
            .filter(|r| r.value().user_id == user_id && r.value().status == MemberStatus::Active)
            .map(|r| r.value().clone())
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
    }

    pub fn patch_member<F>(&self, id: Uuid, patch: F) -> TaskflowResult<TeamMember>
    where
        F: FnOnce(&mut TeamMember),
    {
        let mut entry = self
            .team_members
            .get_mut(&id)
            .ok_or_else(|| TaskflowError::not_found("team member", id))?;
        patch(entry.value_mut());
        Ok(entry.value().clone())
    }

    /// Remove a membership. The owner row can never be removed.
    pub fn remove_member(&self, id: Uuid) -> TaskflowResult<TeamMember> {
        let removed = self
            .team_members
            .remove_if(&id, |_, m| m.role != MemberRole::Owner);
        match removed {
            Some((_, member)) => Ok(member),
            None if self.team_members.contains_key(&id) => Err(TaskflowError::Forbidden(
                "the organization owner cannot be removed".into(),
            )),
            None => Err(TaskflowError::not_found("team member", id)),
        }
    }

    // ─── Subscriptions ─────────────────────────────────────────────────────

    /// Insert a subscription. Fails if `polar_id` is already stored.
    pub fn insert_subscription(&self, sub: Subscription) -> TaskflowResult<Subscription> {
        match self.polar_ids.entry(sub.polar_id.clone()) {
            Entry::Occupied(_) => {
                return Err(TaskflowError::Conflict(format!(
                    "subscription already exists: {}",
                    sub.polar_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(sub.id);
            }
        }
        self.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    pub fn get_subscription(&self, id: Uuid) -> Option<Subscription> {
        self.subscriptions.get(&id).map(|r| r.value().clone())
    }

    pub fn find_subscription_by_polar_id(&self, polar_id: &str) -> Option<Subscription> {
        let id = *self.polar_ids.get(polar_id)?;
        self.get_subscription(id)
    }

    pub fn list_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.iter().map(|r| r.value().clone()).collect()
    }

    pub fn patch_subscription<F>(&self, id: Uuid, patch: F) -> TaskflowResult<Subscription>
    where
        F: FnOnce(&mut Subscription),
    {
        let mut entry = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| TaskflowError::not_found("subscription", id))?;
        patch(entry.value_mut());
        Ok(entry.value().clone())
    }

    // ─── Usage metrics ─────────────────────────────────────────────────────

    pub fn append_usage(&self, metric: UsageMetric) {
        self.usage_metrics
            .entry(metric.organization_id)
            .or_default()
            .push(metric);
    }

    /// Every row for one organization and metric in the period starting at `period_start`.
    pub fn usage_for(
        &self,
        organization_id: Uuid,
        metric_type: MetricType,
        period_start: DateTime<Utc>,
    ) -> Vec<UsageMetric> {
        self.usage_metrics
            .get(&organization_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.metric_type == metric_type && r.period_start == period_start)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn usage_rows(&self, organization_id: Uuid) -> usize {
        self.usage_metrics
            .get(&organization_id)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    // ─── Audit logs ────────────────────────────────────────────────────────

    pub fn append_audit(&self, log: AuditLog) {
        self.audit_logs.insert(log.id, log);
    }

    /// All audit rows, newest first.
    pub fn audit_logs(&self) -> Vec<AuditLog> {
        let mut logs: Vec<AuditLog> = self.audit_logs.iter().map(|r| r.value().clone()).collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs
    }

    // ─── Webhook events ────────────────────────────────────────────────────

    pub fn append_webhook_event(&self, event: WebhookEvent) {
        self.webhook_events.insert(event.id, event);
    }

    pub fn get_webhook_event(&self, id: Uuid) -> Option<WebhookEvent> {
        self.webhook_events.get(&id).map(|r| r.value().clone())
    }

    /// All webhook rows, newest first.
    pub fn webhook_events(&self) -> Vec<WebhookEvent> {
        let mut events: Vec<WebhookEvent> =
            self.webhook_events.iter().map(|r| r.value().clone()).collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        events
    }

    // ─── Feature flags ─────────────────────────────────────────────────────

    pub fn insert_flag(&self, flag: FeatureFlag) -> TaskflowResult<FeatureFlag> {
        match self.feature_flags.entry(flag.name.clone()) {
            Entry::Occupied(_) => Err(TaskflowError::Conflict(format!(
                "feature flag already exists: {}",
                flag.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(flag.clone());
                Ok(flag)
            }
        }
    }

    pub fn get_flag(&self, name: &str) -> Option<FeatureFlag> {
        self.feature_flags.get(name).map(|r| r.value().clone())
    }

    pub fn list_flags(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<FeatureFlag> =
            self.feature_flags.iter().map(|r| r.value().clone()).collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }

    pub fn patch_flag<F>(&self, name: &str, patch: F) -> TaskflowResult<FeatureFlag>
    where
        F: FnOnce(&mut FeatureFlag),
    {
        let mut entry = self
            .feature_flags
            .get_mut(name)
            .ok_or_else(|| TaskflowError::not_found("feature flag", name))?;
        patch(entry.value_mut());
        Ok(entry.value().clone())
    }

    pub fn delete_flag(&self, name: &str) -> bool {
        self.feature_flags.remove(name).is_some()
    }

    // ─── Chat messages ─────────────────────────────────────────────────────

    pub fn append_chat_message(&self, message: ChatMessage) {
        self.chat_messages.insert(message.id, message);
    }

    /// Live messages of one conversation, oldest first.
    pub fn conversation(&self, organization_id: Uuid, conversation_id: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .chat_messages
            .iter()
            .filter(|r| {
                let m = r.value();
                m.organization_id == organization_id
                    && m.conversation_id == conversation_id
                    && m.state.is_active()
            })
            .map(|r| r.value().clone())
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }

    /// Soft-delete every message of a conversation. Returns how many were marked.
    pub fn soft_delete_conversation(
        &self,
        organization_id: Uuid,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> usize {
        let mut marked = 0;
        for mut entry in self.chat_messages.iter_mut() {
            let m = entry.value_mut();
            if m.organization_id == organization_id
                && m.conversation_id == conversation_id
                && m.state.is_active()
            {
                m.state = RecordState::Deleted { at };
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(slug: &str) -> Organization {
        let now = Utc::now();
        Organization {
            id: Uuid::new_v4(),
            name: slug.to_string(),
            slug: slug.to_string(),
            owner_id: "user_owner".into(),
            plan: None,
            subscription_id: None,
            settings: serde_json::json!({}),
            state: RecordState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn member(organization_id: Uuid, user_id: &str, role: MemberRole) -> TeamMember {
        let now = Utc::now();
        TeamMember {
            id: Uuid::new_v4(),
            organization_id,
            user_id: user_id.to_string(),
            role,
            status: MemberStatus::Active,
            invited_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_slug_uniqueness() {
        let db = Database::new();
        let first = db.insert_organization(org("acme")).unwrap();
        assert!(matches!(
            db.insert_organization(org("acme")),
            Err(TaskflowError::Conflict(_))
        ));
        assert_eq!(db.get_organization_by_slug("acme").unwrap().id, first.id);
        assert_eq!(db.list_organizations().len(), 1);
    }

    #[test]
    fn test_ping_checks_unique_indexes() {
        let db = Database::new();
        assert!(db.ping().is_ok());

        let acme = db.insert_organization(org("acme")).unwrap();
        assert!(db.ping().is_ok());

        db.slugs.insert("acme".into(), Uuid::new_v4());
        assert!(matches!(db.ping(), Err(TaskflowError::Internal(_))));

        db.slugs.insert("acme".into(), acme.id);
        assert!(db.ping().is_ok());
    }

    #[test]
    fn test_patch_missing_organization() {
        let db = Database::new();
        let result = db.patch_organization(Uuid::new_v4(), |o| o.plan = Some(PlanTier::Pro));
        assert!(matches!(result, Err(TaskflowError::NotFound { .. })));
    }

    #[test]
    fn test_owner_cannot_be_removed() {
        let db = Database::new();
        let o = db.insert_organization(org("acme")).unwrap();
        let owner = db.insert_member(member(o.id, "user_owner", MemberRole::Owner)).unwrap();
        let dev = db.insert_member(member(o.id, "user_dev", MemberRole::Member)).unwrap();

        assert!(matches!(
            db.insert_member(member(o.id, "user_dev", MemberRole::Admin)),
            Err(TaskflowError::Conflict(_))
        ));
        assert!(matches!(db.remove_member(owner.id), Err(TaskflowError::Forbidden(_))));
        assert_eq!(db.remove_member(dev.id).unwrap().user_id, "user_dev");
        assert!(matches!(db.remove_member(dev.id), Err(TaskflowError::NotFound { .. })));
        assert_eq!(db.members_of(o.id).len(), 1);
    }

    #[test]
    fn test_subscription_polar_id_unique() {
        let db = Database::new();
        let now = Utc::now();
        let sub = Subscription {
            id: Uuid::new_v4(),
            polar_id: "sub_123".into(),
            organization_id: None,
            customer_id: None,
            product_id: None,
            status: SubscriptionStatus::Active,
            amount: Some(2900),
            currency: Some("usd".into()),
            recurring_interval: Some("month".into()),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            started_at: None,
            ended_at: None,
            customer_cancellation_reason: None,
            customer_cancellation_comment: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        db.insert_subscription(sub.clone()).unwrap();
        let dup = Subscription {
            id: Uuid::new_v4(),
            ..sub
        };
        assert!(db.insert_subscription(dup).is_err());
        assert_eq!(db.list_subscriptions().len(), 1);
        assert!(db.find_subscription_by_polar_id("sub_123").is_some());
    }

    #[test]
    fn test_conversation_soft_delete() {
        let db = Database::new();
        let org_id = Uuid::new_v4();
        for (i, role) in [ChatRole::User, ChatRole::Assistant].into_iter().enumerate() {
            db.append_chat_message(ChatMessage {
                id: Uuid::new_v4(),
                organization_id: org_id,
                user_id: "user_1".into(),
                conversation_id: "conv".into(),
                role,
                content: format!("message {i}"),
                state: RecordState::Active,
                created_at: Utc::now(),
            });
        }
        assert_eq!(db.conversation(org_id, "conv").len(), 2);
        assert_eq!(db.soft_delete_conversation(org_id, "conv", Utc::now()), 2);
        assert!(db.conversation(org_id, "conv").is_empty());
        assert_eq!(db.soft_delete_conversation(org_id, "conv", Utc::now()), 0);
    }
}
