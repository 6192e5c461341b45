//! Billing for taskflow: usage metering, plan quotas, and the webhook-driven
//! mirror of the billing provider's subscriptions.
//!
//! The provider owns the subscription state machine; this crate only
//! verifies its webhooks and patches local rows to match.

pub mod metering;
pub mod quota;
pub mod sync;
pub mod webhook;

pub use metering::UsageMeter;
pub use quota::{plan_limit, QuotaEnforcer, QuotaLimit, QuotaStatus};
pub use sync::{SubscriptionSync, SyncOutcome};
pub use webhook::{BillingEvent, WebhookError, WebhookHeaders, WebhookVerifier};
