//! Billing-provider webhooks: signature verification and typed events.
//!
//! Deliveries follow the Standard Webhooks scheme. The signed content is
//! `{webhook-id}.{webhook-timestamp}.{raw body}`, MACed with HMAC-SHA256 and
//! sent base64-encoded in `webhook-signature` as one or more space-separated
//! `v1,<signature>` entries.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use std::sync::Arc;
use taskflow_core::types::SubscriptionStatus;
use taskflow_core::{Clock, TaskflowError};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_SIGNATURE: &str = "webhook-signature";

const SECRET_PREFIX: &str = "whsec_";
const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid webhook timestamp")]
    InvalidTimestamp,
    #[error("webhook timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("no matching signature found")]
    InvalidSignature,
    #[error("webhook secret is not valid base64: {0}")]
    InvalidSecret(#[from] base64::DecodeError),
    #[error("webhook secret rejected by HMAC")]
    KeyLength,
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unsupported payload: {0}")]
    Unsupported(String),
    #[error("store error: {0}")]
    Store(#[from] TaskflowError),
}

impl WebhookError {
    /// Failures that must be answered with 403.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_)
                | Self::InvalidTimestamp
                | Self::TimestampOutOfTolerance
                | Self::InvalidSignature
        )
    }
}

/// The three `webhook-*` headers of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct WebhookHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

/// Verifies deliveries against the shared webhook secret.
pub struct WebhookVerifier {
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
    tolerance: Duration,
}

impl WebhookVerifier {
    /// A `whsec_`-prefixed secret is base64 after the prefix; any other
    /// secret is used as raw bytes.
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, WebhookError> {
        let key = match secret.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded)?,
            None => secret.as_bytes().to_vec(),
        };
        let mac = HmacSha256::new_from_slice(&key).map_err(|_| WebhookError::KeyLength)?;
        Ok(Self {
            mac,
            clock,
            tolerance: Duration::seconds(DEFAULT_TOLERANCE_SECS),
        })
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }

    /// Produce a `v1,<base64>` signature. Used by tests and local tooling.
    pub fn sign(&self, id: &str, timestamp: DateTime<Utc>, body: &[u8]) -> String {
        let ts = timestamp.timestamp().to_string();
        let digest = self.mac(id, &ts, body).finalize().into_bytes();
        format!(
            "v1,{}",
            base64::engine::general_purpose::STANDARD.encode(digest)
        )
    }

    /// Check the signature over the raw body. Nothing is parsed before this passes.
    pub fn verify(&self, headers: &WebhookHeaders<'_>, body: &[u8]) -> Result<(), WebhookError> {
        let sent: i64 = headers
            .timestamp
            .trim()
            .parse()
            .map_err(|_| WebhookError::InvalidTimestamp)?;
        let sent =
            DateTime::<Utc>::from_timestamp(sent, 0).ok_or(WebhookError::InvalidTimestamp)?;
        let skew = self.clock.now() - sent;
        if skew > self.tolerance || skew < -self.tolerance {
            return Err(WebhookError::TimestampOutOfTolerance);
        }

        let mac = self.mac(headers.id, headers.timestamp.trim(), body);
        let engine = base64::engine::general_purpose::STANDARD;
        let matched = headers
            .signature
            .split_whitespace()
            .filter_map(|entry| entry.strip_prefix("v1,"))
            .filter_map(|encoded| engine.decode(encoded).ok())
            .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());

        if matched {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Envelope common to every delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Subscription object as sent by the billing provider. Every field other
/// than `id` is optional so that partial updates only touch what was sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring_interval: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub current_period_start: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present")]
    pub current_period_end: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub canceled_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present")]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present")]
    pub ended_at: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub customer_cancellation_reason: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub customer_cancellation_comment: Option<Option<String>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SubscriptionPayload {
    /// Organization reference carried in checkout metadata.
    pub fn organization_ref(&self) -> Option<&str> {
        ["organization_id", "organizationId"]
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .and_then(|v| v.as_str())
    }

    pub fn plan_ref(&self) -> Option<&str> {
        self.metadata.get("plan").and_then(|v| v.as_str())
    }
}

/// One typed variant per event the sync routine understands.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionActive(SubscriptionPayload),
    SubscriptionCanceled(SubscriptionPayload),
    SubscriptionUncanceled(SubscriptionPayload),
    SubscriptionRevoked(SubscriptionPayload),
    OrderCreated,
    Unhandled(String),
}

impl BillingEvent {
    pub fn parse(raw: &RawWebhookEvent) -> Result<Self, WebhookError> {
        let subscription = || SubscriptionPayload::deserialize(&raw.data);
        Ok(match raw.event_type.as_str() {
            "subscription.created" => {
                let payload = subscription()?;
                if payload.status.is_none() {
                    return Err(WebhookError::Unsupported(
                        "subscription.created without status".into(),
                    ));
                }
                Self::SubscriptionCreated(payload)
            }
            "subscription.updated" => Self::SubscriptionUpdated(subscription()?),
            "subscription.active" => Self::SubscriptionActive(subscription()?),
            "subscription.canceled" => Self::SubscriptionCanceled(subscription()?),
            "subscription.uncanceled" => Self::SubscriptionUncanceled(subscription()?),
            "subscription.revoked" => Self::SubscriptionRevoked(subscription()?),
            "order.created" => Self::OrderCreated,
            other => Self::Unhandled(other.to_string()),
        })
    }
}
