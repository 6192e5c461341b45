//! POST /api/chat and conversation history.
//!
//! Order of checks: session (401), membership (403), organization (404),
//! rate limit (429), quota (429), then the model call. Usage, chat history
//! and the completion audit entry are written once the stream finishes,
//! whether or not the client is still connected.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use taskflow_billing::QuotaStatus;
use taskflow_core::types::{ChatMessage, ChatRole, MetricType, RecordState};
use taskflow_platform::{chat_policy, AuditEntry, RateLimitDecision};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::OrgMember;
use crate::error::{ApiError, ApiResult};
use crate::llm::PromptMessage;
use crate::state::AppState;

const MAX_MESSAGES: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn validate(request: &ChatRequest) -> Result<(), &'static str> {
    if request.messages.is_empty() {
        return Err("messages must not be empty");
    }
    if request.messages.len() > MAX_MESSAGES {
        return Err("too many messages");
    }
    if !request.messages.iter().any(|m| m.role == ChatRole::User) {
        return Err("at least one user message is required");
    }
    Ok(())
}

fn header_value(v: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&v.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        header_value(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        header_value(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        header_value(decision.reset_at.timestamp()),
    );
}

fn quota_headers(headers: &mut HeaderMap, status: &QuotaStatus) {
    headers.insert(HeaderName::from_static("x-quota-limit"), header_value(status.limit));
    headers.insert(HeaderName::from_static("x-quota-used"), header_value(status.used));
    headers.insert(
        HeaderName::from_static("x-quota-remaining"),
        header_value(status.remaining),
    );
}

pub async fn handle_chat(
    State(state): State<AppState>,
    member: OrgMember,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Response> {
    metrics::counter!("chat.requests").increment(1);
    let org = &member.organization;
    let user_id = member.claims.sub.clone();
    let plan = org.effective_plan();

    if let Err(msg) = validate(&request) {
        return Err(ApiError::bad_request(msg));
    }

    // ─── Rate limit ────────────────────────────────────────────────────────
    let decision = state
        .rate_limiter
        .check(&format!("chat:{}", org.id), chat_policy(plan))
        .await;
    if !decision.allowed {
        let retry_after = decision.retry_after_secs.unwrap_or(0);
        warn!(organization_id = %org.id, retry_after, "Chat rate limited");
        metrics::counter!("chat.rate_limited").increment(1);
        state.audit.log(
            AuditEntry::new("chat.completion", "chat")
                .organization(org.id)
                .user(&user_id)
                .failure("rate_limit_exceeded")
                .meta("plan", plan.as_str())
                .meta("limit", decision.limit),
        );

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please try again later.",
                "limit": decision.limit,
                "remaining": decision.remaining,
                "retryAfter": retry_after,
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        rate_limit_headers(headers, &decision);
        headers.insert(header::RETRY_AFTER, header_value(retry_after));
        return Ok(response);
    }

    // ─── Quota ─────────────────────────────────────────────────────────────
    let quota = state.quota.check_quota(org.id, MetricType::AiMessages)?;
    if !quota.has_quota {
        warn!(organization_id = %org.id, used = quota.used, "Chat quota exhausted");
        metrics::counter!("chat.quota_exceeded").increment(1);
        state.audit.log(
            AuditEntry::new("chat.completion", "chat")
                .organization(org.id)
                .user(&user_id)
                .failure("quota_exceeded")
                .meta("plan", plan.as_str())
                .meta("used", quota.used),
        );

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "quota_exceeded",
                "message": "Monthly AI message quota exceeded. Upgrade your plan for more.",
                "used": quota.used,
                "limit": quota.limit,
                "remaining": quota.remaining,
                "plan": plan,
            })),
        )
            .into_response();
        rate_limit_headers(response.headers_mut(), &decision);
        quota_headers(response.headers_mut(), &quota);
        return Ok(response);
    }

    // ─── Generation ────────────────────────────────────────────────────────
    let conversation_id = request
        .conversation_id
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut tokens = match state.model.stream_chat(&request.messages).await {
        Ok(tokens) => tokens,
        Err(e) => {
            error!(organization_id = %org.id, error = %e, "Chat model call failed");
            state.audit.log(
                AuditEntry::new("chat.completion", "chat")
                    .organization(org.id)
                    .user(&user_id)
                    .failure("model_error"),
            );
            return Err(ApiError::internal());
        }
    };

    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let organization_id = org.id;
    let model_name = state.model.model_name().to_string();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let task_state = state.clone();
    let task_conversation = conversation_id.clone();

    tokio::spawn(async move {
        let state = task_state;
        let mut reply = String::new();
        let mut failed = None;

        while let Some(item) = tokens.next().await {
            match item {
                Ok(text) => {
                    reply.push_str(&text);
                    // A closed receiver means the client left; keep draining.
                    let _ = tx.send(Ok(Bytes::from(text))).await;
                }
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failed {
            error!(organization_id = %organization_id, error = %e, "Chat stream failed");
            state.audit.log(
                AuditEntry::new("chat.completion", "chat")
                    .organization(organization_id)
                    .user(&user_id)
                    .resource_id(&task_conversation)
                    .failure("stream_error"),
            );
            let _ = tx.send(Err(std::io::Error::other("stream failed"))).await;
            return;
        }

        state.meter.record_usage(
            organization_id,
            Some(&user_id),
            MetricType::AiMessages,
            1,
            Some(json!({ "conversationId": task_conversation, "model": model_name.clone() })),
        );

        let now = state.clock.now();
        for (role, content) in [(ChatRole::User, prompt), (ChatRole::Assistant, reply)] {
            state.db.append_chat_message(ChatMessage {
                id: Uuid::new_v4(),
                organization_id,
                user_id: user_id.clone(),
                conversation_id: task_conversation.clone(),
                role,
                content,
                state: RecordState::Active,
                created_at: now,
            });
        }

        state.audit.log(
            AuditEntry::new("chat.completion", "chat")
                .organization(organization_id)
                .user(&user_id)
                .resource_id(&task_conversation)
                .meta("model", model_name),
        );
        info!(organization_id = %organization_id, conversation_id = %task_conversation, "Chat completed");
        drop(tx);
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        HeaderName::from_static("x-conversation-id"),
        header_value(&conversation_id),
    );
    rate_limit_headers(headers, &decision);
    quota_headers(headers, &quota);
    Ok(response)
}

/// GET /api/chat/:conversation_id
pub async fn get_conversation(
    State(state): State<AppState>,
    member: OrgMember,
    Path(conversation_id): Path<String>,
) -> Json<Vec<ChatMessage>> {
    Json(state.db.conversation(member.organization.id, &conversation_id))
}

/// DELETE /api/chat/:conversation_id. Messages are soft-deleted.
pub async fn delete_conversation(
    State(state): State<AppState>,
    member: OrgMember,
    Path(conversation_id): Path<String>,
) -> ApiResult<StatusCode> {
    let org_id = member.organization.id;
    let marked = state
        .db
        .soft_delete_conversation(org_id, &conversation_id, state.clock.now());
    if marked == 0 {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "conversation not found",
        ));
    }
    state.audit.log(
        AuditEntry::new("chat.conversation_deleted", "chat")
            .organization(org_id)
            .user(&member.claims.sub)
            .resource_id(&conversation_id)
            .meta("messages", marked as u64),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: ChatRole, content: &str) -> PromptMessage {
        PromptMessage {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn test_validate() {
        let ok = ChatRequest {
            messages: vec![msg(ChatRole::System, "be brief"), msg(ChatRole::User, "hi")],
            conversation_id: None,
        };
        assert!(validate(&ok).is_ok());

        let empty = ChatRequest {
            messages: vec![],
            conversation_id: None,
        };
        assert!(validate(&empty).is_err());

        let no_user = ChatRequest {
            messages: vec![msg(ChatRole::Assistant, "hello")],
            conversation_id: None,
        };
        assert!(validate(&no_user).is_err());
    }

    #[test]
    fn test_request_shape() {
        let req: ChatRequest = serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }],
            "conversationId": "c1"
        }))
        .unwrap();
        assert_eq!(req.conversation_id.as_deref(), Some("c1"));
    }
}
