//! Audit trail: append-only records of who did what, plus query and
//! compliance reporting over them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskflow_core::types::{AuditLog, AuditStatus};
use taskflow_core::Clock;
use taskflow_store::Database;
use tracing::info;
use uuid::Uuid;

/// A pending audit row. Built with chained setters, written by [`AuditLogger::log`].
#[derive(Debug, Clone)]
pub struct AuditEntry {
    action: String,
    resource: String,
    organization_id: Option<Uuid>,
    user_id: Option<String>,
    resource_id: Option<String>,
    status: AuditStatus,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            organization_id: None,
            user_id: None,
            resource_id: None,
            status: AuditStatus::Success,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn organization(mut self, id: Uuid) -> Self {
        self.organization_id = Some(id);
        self
    }

    pub fn user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    /// Mark as failed with a machine-readable `reason` tag.
    pub fn failure(mut self, reason: &str) -> Self {
        self.status = AuditStatus::Failure;
        self.metadata.insert("reason".into(), reason.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Filters for [`AuditLogger::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub organization_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub status: Option<AuditStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, log: &AuditLog) -> bool {
        if self.organization_id.is_some() && log.organization_id != self.organization_id {
            return false;
        }
        if let Some(ref user) = self.user_id {
            if log.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &log.action != action {
                return false;
            }
        }
        if let Some(status) = self.status {
            if log.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if log.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if log.timestamp > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompliancePeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Summary of audit activity in a time range.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub organization_id: Option<Uuid>,
    pub period: CompliancePeriod,
    pub total_events: u64,
    pub failed_events: u64,
    pub events_by_action: BTreeMap<String, u64>,
    /// Failure counts keyed by their `reason` tag.
    pub failures_by_reason: BTreeMap<String, u64>,
    pub generated_at: DateTime<Utc>,
}

const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AuditLogger {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Stamp and append an entry.
    pub fn log(&self, entry: AuditEntry) -> AuditLog {
        let log = AuditLog {
            id: Uuid::new_v4(),
            organization_id: entry.organization_id,
            user_id: entry.user_id,
            action: entry.action,
            resource: entry.resource,
            resource_id: entry.resource_id,
            status: entry.status,
            metadata: serde_json::Value::Object(entry.metadata),
            timestamp: self.clock.now(),
        };
        info!(
            audit_id = %log.id,
            action = %log.action,
            resource = %log.resource,
            status = ?log.status,
            organization_id = ?log.organization_id,
            "Audit event logged"
        );
        self.db.append_audit(log.clone());
        log
    }

    /// Matching rows, newest first, capped at `limit` (default 100).
    pub fn query(&self, filter: &AuditQuery) -> Vec<AuditLog> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        self.db
            .audit_logs()
            .into_iter()
            .filter(|log| filter.matches(log))
            .take(limit)
            .collect()
    }

    /// Counts by action and failure reason for one organization (or all
    /// organizations when `None`) within `[from, to]`.
    pub fn export_compliance_report(
        &self,
        organization_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ComplianceReport {
        let filter = AuditQuery {
            organization_id,
            from: Some(from),
            to: Some(to),
            ..Default::default()
        };

        let mut events_by_action: BTreeMap<String, u64> = BTreeMap::new();
        let mut failures_by_reason: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_events = 0;
        let mut failed_events = 0;

        for log in self.db.audit_logs().iter().filter(|l| filter.matches(l)) {
            total_events += 1;
            *events_by_action.entry(log.action.clone()).or_default() += 1;
            if log.status == AuditStatus::Failure {
                failed_events += 1;
                let reason = log
                    .metadata
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unspecified");
                *failures_by_reason.entry(reason.to_string()).or_default() += 1;
            }
        }

        ComplianceReport {
            organization_id,
            period: CompliancePeriod { from, to },
            total_events,
            failed_events,
            events_by_action,
            failures_by_reason,
            generated_at: self.clock.now(),
        }
    }
}
