//! Webhook-driven mirror of billing-provider subscriptions.
//!
//! Every delivery is logged verbatim before it is dispatched. Subscription
//! rows are only ever written from here.

use std::sync::Arc;

use serde::Serialize;
use taskflow_core::types::{PlanTier, Subscription, SubscriptionStatus, WebhookEvent};
use taskflow_core::{Clock, TaskflowError};
use taskflow_store::Database;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::webhook::{BillingEvent, RawWebhookEvent, SubscriptionPayload, WebhookError};

/// Logged type of a delivery that is not JSON or carries no `type`.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// What a delivery did to local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    SubscriptionCreated {
        subscription_id: Uuid,
        organization_id: Option<Uuid>,
    },
    SubscriptionUpdated {
        subscription_id: Uuid,
    },
    /// Event understood, nothing to change.
    NoOp,
    /// No local row for the provider's subscription id.
    Dropped {
        polar_id: String,
    },
    Unhandled {
        event_type: String,
    },
}

/// Applies verified webhook deliveries to the subscription and organization tables.
#[derive(Clone)]
pub struct SubscriptionSync {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl SubscriptionSync {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Log a verified delivery, then apply it.
    ///
    /// The log row is written once per call, before dispatch, whatever the
    /// outcome of the dispatch.
    pub fn handle_webhook_event(
        &self,
        event_id: &str,
        body: &[u8],
    ) -> Result<SyncOutcome, WebhookError> {
        let parsed = serde_json::from_slice::<serde_json::Value>(body);
        let (payload, event_type) = match &parsed {
            Ok(value) => (
                value.clone(),
                value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or(UNKNOWN_EVENT_TYPE)
                    .to_string(),
            ),
            Err(_) => (
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
                UNKNOWN_EVENT_TYPE.to_string(),
            ),
        };

        self.db.append_webhook_event(WebhookEvent {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.clone(),
            payload,
            received_at: self.clock.now(),
        });
        metrics::counter!("webhook.received", "type" => event_type).increment(1);

        let raw: RawWebhookEvent = serde_json::from_value(parsed?)?;
        self.dispatch(&raw)
    }

    /// Re-apply a logged delivery. No new log row is written.
    pub fn replay(&self, record_id: Uuid) -> Result<SyncOutcome, WebhookError> {
        let record = self
            .db
            .get_webhook_event(record_id)
            .ok_or_else(|| TaskflowError::not_found("webhook event", record_id))?;
        let raw: RawWebhookEvent = serde_json::from_value(record.payload)?;
        info!(event_id = %record.event_id, event_type = %raw.event_type, "Replaying webhook event");
        self.dispatch(&raw)
    }

    fn dispatch(&self, raw: &RawWebhookEvent) -> Result<SyncOutcome, WebhookError> {
        let outcome = match BillingEvent::parse(raw)? {
            BillingEvent::SubscriptionCreated(p) => self.subscription_created(p)?,
            BillingEvent::SubscriptionUpdated(p)
            | BillingEvent::SubscriptionActive(p)
            | BillingEvent::SubscriptionCanceled(p)
            | BillingEvent::SubscriptionRevoked(p) => self.subscription_patched(p, false)?,
            BillingEvent::SubscriptionUncanceled(p) => self.subscription_patched(p, true)?,
            BillingEvent::OrderCreated => SyncOutcome::NoOp,
            BillingEvent::Unhandled(event_type) => {
                debug!(event_type = %event_type, "Ignoring unhandled webhook event");
                SyncOutcome::Unhandled { event_type }
            }
        };
        debug!(event_type = %raw.event_type, ?outcome, "Webhook event applied");
        Ok(outcome)
    }

    fn subscription_created(&self, p: SubscriptionPayload) -> Result<SyncOutcome, WebhookError> {
        let organization_id = p
            .organization_ref()
            .and_then(|s| Uuid::parse_str(s).ok())
            .filter(|id| self.db.get_organization(*id).is_some());
        let plan = p
            .plan_ref()
            .and_then(|s| s.parse::<PlanTier>().ok())
            .unwrap_or(PlanTier::Pro);

        // A repeated delivery updates the existing row instead of duplicating it.
        let subscription = match self.db.find_subscription_by_polar_id(&p.id) {
            Some(existing) => {
                let now = self.clock.now();
                self.db.patch_subscription(existing.id, |sub| {
                    apply_payload(sub, &p, false);
                    if sub.organization_id.is_none() {
                        sub.organization_id = organization_id;
                    }
                    sub.updated_at = now;
                })?
            }
            None => self.db.insert_subscription(self.new_subscription(&p, organization_id))?,
        };

        if let Some(org_id) = organization_id {
            let now = self.clock.now();
            self.db.patch_organization(org_id, |org| {
                org.subscription_id = Some(subscription.id);
                org.plan = Some(plan);
                org.updated_at = now;
            })?;
        }

        info!(
            polar_id = %subscription.polar_id,
            subscription_id = %subscription.id,
            organization_id = ?organization_id,
            status = ?subscription.status,
            "Subscription created"
        );
        Ok(SyncOutcome::SubscriptionCreated {
            subscription_id: subscription.id,
            organization_id,
        })
    }

    fn subscription_patched(
        &self,
        p: SubscriptionPayload,
        uncancel: bool,
    ) -> Result<SyncOutcome, WebhookError> {
        let Some(existing) = self.db.find_subscription_by_polar_id(&p.id) else {
            warn!(polar_id = %p.id, "Webhook for unknown subscription dropped");
            return Ok(SyncOutcome::Dropped { polar_id: p.id });
        };
        let now = self.clock.now();
        let updated = self.db.patch_subscription(existing.id, |sub| {
            apply_payload(sub, &p, uncancel);
            sub.updated_at = now;
        })?;
        info!(
            polar_id = %updated.polar_id,
            status = ?updated.status,
            cancel_at_period_end = updated.cancel_at_period_end,
            "Subscription updated"
        );
        Ok(SyncOutcome::SubscriptionUpdated {
            subscription_id: updated.id,
        })
    }

    fn new_subscription(&self, p: &SubscriptionPayload, organization_id: Option<Uuid>) -> Subscription {
        let now = self.clock.now();
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            polar_id: p.id.clone(),
            organization_id,
            customer_id: None,
            product_id: None,
            status: p.status.unwrap_or(SubscriptionStatus::Incomplete),
            amount: None,
            currency: None,
            recurring_interval: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            started_at: None,
            ended_at: None,
            customer_cancellation_reason: None,
            customer_cancellation_comment: None,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        };
        apply_payload(&mut sub, p, false);
        sub
    }
}

/// Copy every field present in the payload onto the row. With `uncancel`,
/// the cancellation fields are cleared after the copy.
fn apply_payload(sub: &mut Subscription, p: &SubscriptionPayload, uncancel: bool) {
    fn set<T: Clone>(field: &mut T, value: &Option<T>) {
        if let Some(v) = value {
            *field = v.clone();
        }
    }
    fn set_some<T: Clone>(field: &mut Option<T>, value: &Option<T>) {
        if let Some(v) = value {
            *field = Some(v.clone());
        }
    }

    set(&mut sub.status, &p.status);
    set_some(&mut sub.amount, &p.amount);
    set_some(&mut sub.currency, &p.currency);
    set_some(&mut sub.recurring_interval, &p.recurring_interval);
    set_some(&mut sub.customer_id, &p.customer_id);
    set_some(&mut sub.product_id, &p.product_id);
    set(&mut sub.current_period_start, &p.current_period_start);
    set(&mut sub.current_period_end, &p.current_period_end);
    set(&mut sub.cancel_at_period_end, &p.cancel_at_period_end);
    set(&mut sub.canceled_at, &p.canceled_at);
    set(&mut sub.started_at, &p.started_at);
    set(&mut sub.ended_at, &p.ended_at);
    set(&mut sub.customer_cancellation_reason, &p.customer_cancellation_reason);
    set(&mut sub.customer_cancellation_comment, &p.customer_cancellation_comment);
    if !p.metadata.is_empty() {
        sub.metadata = serde_json::Value::Object(p.metadata.clone());
    }

    if uncancel {
        sub.cancel_at_period_end = false;
        sub.canceled_at = None;
        sub.customer_cancellation_reason = None;
        sub.customer_cancellation_comment = None;
    }
}
