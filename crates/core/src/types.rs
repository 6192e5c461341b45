//! Persisted entities shared by every taskflow crate.
//!
//! Relationships are plain id references resolved by application code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ─── Lifecycle ──────────────────────────────────────────────────────────────

/// Soft-delete state. Rows are never removed, only marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    #[default]
    Active,
    Deleted { at: DateTime<Utc> },
}

impl RecordState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active => None,
            Self::Deleted { at } => Some(*at),
        }
    }
}

// ─── Plans ──────────────────────────────────────────────────────────────────

/// Plan tier; gates every quota and rate-limit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan tier: {other}")),
        }
    }
}

// ─── Organizations ──────────────────────────────────────────────────────────

/// Tenant root: the billing and access-control boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Globally unique.
    pub slug: String,
    pub owner_id: String,
    /// `None` is treated as `free`.
    pub plan: Option<PlanTier>,
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn effective_plan(&self) -> PlanTier {
        self.plan.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn can_manage_members(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Active,
    Suspended,
}

/// Join between an identity-provider user and an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: String,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub invited_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Subscriptions ──────────────────────────────────────────────────────────

/// Mirror of the billing provider's subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Revoked,
}

/// Local copy of a billing-provider subscription. Written only by webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    /// Billing provider's subscription id; unique.
    pub polar_id: String,
    pub organization_id: Option<Uuid>,
    pub customer_id: Option<String>,
    pub product_id: Option<String>,
    pub status: SubscriptionStatus,
    /// Minor currency units.
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub recurring_interval: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub customer_cancellation_reason: Option<String>,
    pub customer_cancellation_comment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Usage ──────────────────────────────────────────────────────────────────

/// The kind of resource being metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    AiMessages,
    ApiCalls,
    StorageMb,
    TeamMembers,
    Projects,
    Tasks,
}

impl MetricType {
    pub const ALL: [MetricType; 6] = [
        Self::AiMessages,
        Self::ApiCalls,
        Self::StorageMb,
        Self::TeamMembers,
        Self::Projects,
        Self::Tasks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiMessages => "ai_messages",
            Self::ApiCalls => "api_calls",
            Self::StorageMb => "storage_mb",
            Self::TeamMembers => "team_members",
            Self::Projects => "projects",
            Self::Tasks => "tasks",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric type: {s}"))
    }
}

/// One immutable consumption event. Totals are computed on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetric {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<String>,
    pub metric_type: MetricType,
    pub quantity: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

// ─── Audit / webhooks ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// Immutable record of who did what, when, with what outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub status: AuditStatus,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Verbatim copy of a received billing webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    /// Provider-assigned delivery id.
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

// ─── Feature flags ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// When set, the flag only applies to this organization.
    pub organization_id: Option<Uuid>,
    /// 0..=100
    pub rollout_percentage: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Chat ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: String,
    pub conversation_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
}
