//! POST /payments/webhook: billing-provider deliveries.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};
use taskflow_billing::webhook::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use taskflow_billing::{WebhookError, WebhookHeaders};
use taskflow_platform::AuditEntry;
use tracing::{error, warn};

use crate::state::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingHeader(name))
}

fn verify(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<String, WebhookError> {
    let verifier = state
        .webhooks
        .as_ref()
        .ok_or(WebhookError::InvalidSignature)?;
    let signed = WebhookHeaders {
        id: header(headers, HEADER_ID)?,
        timestamp: header(headers, HEADER_TIMESTAMP)?,
        signature: header(headers, HEADER_SIGNATURE)?,
    };
    verifier.verify(&signed, body)?;
    Ok(signed.id.to_string())
}

/// 200 on success, 403 when the signature does not verify (nothing is
/// stored), 400 for any other failure. Error bodies carry no detail.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event_id = match verify(&state, &headers, &body) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Webhook verification failed");
            metrics::counter!("webhook.signature_failures").increment(1);
            return (StatusCode::FORBIDDEN, Json(json!({ "error": "Forbidden" })));
        }
    };

    match state.sync.handle_webhook_event(&event_id, &body) {
        Ok(outcome) => {
            state.audit.log(
                AuditEntry::new("webhook.processed", "subscription")
                    .resource_id(&event_id)
                    .meta("outcome", serde_json::to_value(&outcome).unwrap_or(Value::Null)),
            );
            (StatusCode::OK, Json(json!({ "message": "Webhook received!" })))
        }
        Err(e) => {
            error!(event_id = %event_id, error = %e, "Webhook processing failed");
            state.audit.log(
                AuditEntry::new("webhook.processed", "subscription")
                    .resource_id(&event_id)
                    .failure("processing_error"),
            );
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "Bad request" })))
        }
    }
}
