//! Usage metering: every call appends one row stamped with the current
//! calendar month. Nothing is merged at write time; totals are summed on read.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use taskflow_core::types::{MetricType, UsageMetric};
use taskflow_core::{month_end, month_start, Clock};
use taskflow_store::Database;
use tracing::debug;
use uuid::Uuid;

/// Append-only usage recorder.
#[derive(Clone)]
pub struct UsageMeter {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Record a usage event for an organization in the current billing period.
    pub fn record_usage(
        &self,
        organization_id: Uuid,
        user_id: Option<&str>,
        metric_type: MetricType,
        quantity: u64,
        metadata: Option<serde_json::Value>,
    ) -> UsageMetric {
        let now = self.clock.now();
        let metric = UsageMetric {
            id: Uuid::new_v4(),
            organization_id,
            user_id: user_id.map(str::to_string),
            metric_type,
            quantity,
            period_start: month_start(now),
            period_end: month_end(now),
            metadata,
            recorded_at: now,
        };
        debug!(
            organization_id = %organization_id,
            metric = %metric_type,
            quantity,
            "Usage recorded"
        );
        metrics::counter!("billing.usage_recorded", "metric" => metric_type.as_str())
            .increment(quantity);
        self.db.append_usage(metric.clone());
        metric
    }

    /// Total quantity recorded this calendar month.
    pub fn current_usage(&self, organization_id: Uuid, metric_type: MetricType) -> u64 {
        self.usage_in_period(organization_id, metric_type, self.clock.now())
    }

    /// Total quantity recorded in the calendar month containing `at`.
    pub fn usage_in_period(
        &self,
        organization_id: Uuid,
        metric_type: MetricType,
        at: DateTime<Utc>,
    ) -> u64 {
        self.db
            .usage_for(organization_id, metric_type, month_start(at))
            .iter()
            .map(|r| r.quantity)
            .sum()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}
