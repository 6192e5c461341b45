//! End-to-end HTTP flows over the in-memory store and local cache.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::{Duration, TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use taskflow_api::llm::{PromptMessage, TokenStream};
use taskflow_api::{router, AppState, ChatModel};
use taskflow_billing::WebhookVerifier;
use taskflow_cache::{CacheBackend, CacheError, CacheResult, LocalCache};
use taskflow_core::types::{AuditStatus, ChatRole, MetricType, Organization};
use taskflow_core::config::RateLimitAlgorithm;
use taskflow_core::{AppConfig, Clock, ManualClock};
use taskflow_platform::{SessionVerifier, UserRole};
use taskflow_store::Database;
use tower::ServiceExt;

const SESSION_SECRET: &str = "integration-session-secret";
const WEBHOOK_SECRET: &str = "integration-webhook-secret";

struct StubModel;

#[async_trait]
impl ChatModel for StubModel {
    fn model_name(&self) -> &str {
        "stub-model"
    }

    async fn stream_chat(&self, _messages: &[PromptMessage]) -> anyhow::Result<TokenStream> {
        Ok(futures::stream::iter(vec![Ok("Hello".to_string()), Ok(" world".to_string())]).boxed())
    }
}

/// Sends one token, then fails mid-stream.
struct FailingModel;

#[async_trait]
impl ChatModel for FailingModel {
    fn model_name(&self) -> &str {
        "failing-model"
    }

    async fn stream_chat(&self, _messages: &[PromptMessage]) -> anyhow::Result<TokenStream> {
        Ok(futures::stream::iter(vec![
            Ok("Hel".to_string()),
            Err(anyhow::anyhow!("upstream reset")),
        ])
        .boxed())
    }
}

/// A cache whose every call fails, as when Redis is unreachable.
struct UnreachableCache;

fn unreachable<T>() -> CacheResult<T> {
    Err(CacheError::Unavailable("connection refused".into()))
}

#[async_trait]
impl CacheBackend for UnreachableCache {
    async fn incr(&self, _: &str) -> CacheResult<i64> {
        unreachable()
    }
    async fn expire(&self, _: &str, _: u64) -> CacheResult<()> {
        unreachable()
    }
    async fn ttl(&self, _: &str) -> CacheResult<i64> {
        unreachable()
    }
    async fn zadd(&self, _: &str, _: i64, _: &str) -> CacheResult<()> {
        unreachable()
    }
    async fn zrem_range_by_score(&self, _: &str, _: i64, _: i64) -> CacheResult<u64> {
        unreachable()
    }
    async fn zcard(&self, _: &str) -> CacheResult<u64> {
        unreachable()
    }
    async fn zoldest(&self, _: &str) -> CacheResult<Option<i64>> {
        unreachable()
    }
    async fn ping(&self) -> CacheResult<()> {
        unreachable()
    }
}

struct Harness {
    state: AppState,
    clock: Arc<ManualClock>,
    sessions: SessionVerifier,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(configured())
    }

    fn with_config(config: AppConfig) -> Self {
        Self::build(config, None, Arc::new(StubModel))
    }

    /// `cache: None` uses a local cache on the harness clock.
    fn build(
        config: AppConfig,
        cache: Option<Arc<dyn CacheBackend>>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 12, 14, 0, 0).unwrap(),
        ));
        let db = Arc::new(Database::new());
        let cache = cache.unwrap_or_else(|| Arc::new(LocalCache::new(clock.clone())));
        let state = AppState::new(config, db, cache, clock.clone(), model).unwrap();
        let sessions = SessionVerifier::new(SESSION_SECRET, clock.clone()).unwrap();
        Self {
            state,
            clock,
            sessions,
        }
    }

    fn token(&self, user: &str, role: UserRole) -> String {
        self.sessions
            .issue(user, None, role, Duration::hours(1))
            .unwrap()
    }

    fn organization(&self, owner: &str) -> Organization {
        self.state
            .tenants
            .create_organization("Acme Inc", owner)
            .unwrap()
            .0
    }

    async fn send(&self, request: Request<Body>) -> Response {
        router(self.state.clone()).oneshot(request).await.unwrap()
    }

    async fn chat(&self, token: &str) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "messages": [{ "role": "user", "content": "Plan my sprint" }] }).to_string(),
            ))
            .unwrap();
        self.send(request).await
    }
}

fn configured() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.session_secret = Some(SESSION_SECRET.into());
    config.payments.webhook_secret = Some(WEBHOOK_SECRET.into());
    config.payments.access_token = Some("polar_at_test".into());
    config
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

// ─── Health ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_checks() {
    let h = Harness::new();
    let response = h
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["rateLimit"], true);

    let bare = Harness::with_config(AppConfig::default());
    let response = bare
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["authentication"], false);
    assert_eq!(body["checks"]["payments"], false);
}

#[tokio::test]
async fn test_health_unavailable_when_cache_down() {
    let h = Harness::build(configured(), Some(Arc::new(UnreachableCache)), Arc::new(StubModel));
    let response = h
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["rateLimit"], false);
    assert_eq!(body["checks"]["database"], true);
    assert_eq!(body["checks"]["authentication"], true);
    assert_eq!(body["checks"]["payments"], true);
}

// ─── Chat ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_requires_identity_and_organization() {
    let h = Harness::new();

    let response = h.chat("garbage").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"messages":[]}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let loner = h.token("user_without_org", UserRole::User);
    let response = h.chat(&loner).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_chat_streams_and_records_usage() {
    let h = Harness::new();
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);

    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["x-ratelimit-limit"], "10");
    assert_eq!(headers["x-ratelimit-remaining"], "9");
    assert_eq!(headers["x-quota-limit"], "100");
    assert_eq!(headers["x-quota-used"], "0");
    let conversation = headers["x-conversation-id"].to_str().unwrap().to_string();

    let body = body_bytes(response).await;
    assert_eq!(body, b"Hello world");

    assert_eq!(h.state.meter.current_usage(org.id, MetricType::AiMessages), 1);
    let messages = h.state.db.conversation(org.id, &conversation);
    assert_eq!(messages.len(), 2);
    assert!(messages
        .iter()
        .any(|m| m.role == ChatRole::User && m.content == "Plan my sprint"));
    assert!(messages
        .iter()
        .any(|m| m.role == ChatRole::Assistant && m.content == "Hello world"));
    assert!(h
        .state
        .db
        .audit_logs()
        .iter()
        .any(|l| l.action == "chat.completion" && l.status == AuditStatus::Success));

    // History endpoints.
    let response = h.send(get(&format!("/api/chat/{conversation}"), &token)).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
    let response = h
        .send(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/chat/{conversation}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(h.state.db.conversation(org.id, &conversation).is_empty());
}

#[tokio::test]
async fn test_rate_limited_chat_skips_quota_and_generation() {
    let h = Harness::new();
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);

    // Free plan: 10 chat requests per hour.
    for _ in 0..10 {
        let response = h.chat(&token).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_bytes(response).await;
    }
    let rows_before = h.state.db.usage_rows(org.id);

    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
    let body = body_json(response).await;
    assert_eq!(body["error"], "rate_limit_exceeded");

    assert_eq!(h.state.db.usage_rows(org.id), rows_before);
    let failure = h
        .state
        .db
        .audit_logs()
        .into_iter()
        .find(|l| l.status == AuditStatus::Failure)
        .unwrap();
    assert_eq!(failure.metadata["reason"], "rate_limit_exceeded");

    // The window resets.
    h.clock.advance(Duration::hours(1));
    assert_eq!(h.chat(&token).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sliding_window_chat_limit() {
    let mut config = configured();
    config.cache.rate_limit_algorithm = RateLimitAlgorithm::SlidingWindow;
    let h = Harness::with_config(config);
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);

    for _ in 0..10 {
        let response = h.chat(&token).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_bytes(response).await;
    }

    // Half an hour later the first ten requests are still inside the window.
    h.clock.advance(Duration::minutes(30));
    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1800");
    assert_eq!(h.state.db.usage_rows(org.id), 10);

    h.clock.advance(Duration::minutes(30));
    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
    body_bytes(response).await;
    assert_eq!(h.state.db.usage_rows(org.id), 11);
}

#[tokio::test]
async fn test_chat_fails_open_when_cache_down() {
    let h = Harness::build(configured(), Some(Arc::new(UnreachableCache)), Arc::new(StubModel));
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);

    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"Hello world");
    assert_eq!(h.state.meter.current_usage(org.id, MetricType::AiMessages), 1);
}

#[tokio::test]
async fn test_chat_stream_failure_records_no_usage() {
    let h = Harness::build(configured(), None, Arc::new(FailingModel));
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);

    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .is_err());

    assert_eq!(h.state.db.usage_rows(org.id), 0);
    let failure = h
        .state
        .db
        .audit_logs()
        .into_iter()
        .find(|l| l.status == AuditStatus::Failure)
        .unwrap();
    assert_eq!(failure.metadata["reason"], "stream_error");
}

#[tokio::test]
async fn test_quota_exhausted_chat() {
    let h = Harness::new();
    let org = h.organization("user_1");
    let token = h.token("user_1", UserRole::User);
    h.state
        .meter
        .record_usage(org.id, Some("user_1"), MetricType::AiMessages, 100, None);

    let response = h.chat(&token).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["used"], 100);
    assert_eq!(body["limit"], 100);
    assert_eq!(body["plan"], "free");

    let failure = h
        .state
        .db
        .audit_logs()
        .into_iter()
        .find(|l| l.status == AuditStatus::Failure)
        .unwrap();
    assert_eq!(failure.metadata["reason"], "quota_exceeded");

    let response = h.send(get("/api/usage", &token)).await;
    let usage = body_json(response).await;
    assert_eq!(usage["plan"], "free");
    assert_eq!(usage["metrics"][0]["metricType"], "ai_messages");
    assert_eq!(usage["metrics"][0]["hasQuota"], false);
    assert_eq!(usage["metrics"][0]["percentage"], 100.0);
}

// ─── Webhooks ──────────────────────────────────────────────────────────────

fn webhook_request(h: &Harness, body: &[u8], signed_body: &[u8]) -> Request<Body> {
    let verifier = WebhookVerifier::new(WEBHOOK_SECRET, h.clock.clone()).unwrap();
    let now = h.clock.now();
    Request::builder()
        .method("POST")
        .uri("/payments/webhook")
        .header("webhook-id", "msg_2f1")
        .header("webhook-timestamp", now.timestamp().to_string())
        .header("webhook-signature", verifier.sign("msg_2f1", now, signed_body))
        .header("content-type", "application/json")
        .body(Body::from(body.to_vec()))
        .unwrap()
}

#[tokio::test]
async fn test_webhook_creates_subscription() {
    let h = Harness::new();
    let org = h.organization("user_1");
    let payload = json!({
        "type": "subscription.created",
        "data": {
            "id": "sub_polar_42",
            "status": "active",
            "amount": 4900,
            "currency": "usd",
            "metadata": { "organization_id": org.id.to_string(), "plan": "enterprise" }
        }
    })
    .to_string();

    let response = h.send(webhook_request(&h, payload.as_bytes(), payload.as_bytes())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "Webhook received!");

    let sub = h.state.db.find_subscription_by_polar_id("sub_polar_42").unwrap();
    let org = h.state.db.get_organization(org.id).unwrap();
    assert_eq!(org.subscription_id, Some(sub.id));
    assert_eq!(org.effective_plan().as_str(), "enterprise");
    assert_eq!(h.state.db.webhook_events().len(), 1);
}

#[tokio::test]
async fn test_webhook_tampered_body_forbidden() {
    let h = Harness::new();
    let signed = br#"{"type":"order.created","data":{"id":"ord_1"}}"#;
    let tampered = br#"{"type":"order.created","data":{"id":"ord_2"}}"#;

    let response = h.send(webhook_request(&h, tampered, signed)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(h.state.db.webhook_events().is_empty());

    let unsigned = Request::builder()
        .method("POST")
        .uri("/payments/webhook")
        .body(Body::from(signed.to_vec()))
        .unwrap();
    assert_eq!(h.send(unsigned).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_bad_payload_is_400() {
    let h = Harness::new();
    let body = b"not json at all";
    let response = h.send(webhook_request(&h, body, body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Bad request");

    let events = h.state.db.webhook_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "unknown");
    assert_eq!(events[0].event_id, "msg_2f1");
}

// ─── Organizations and admin ───────────────────────────────────────────────

#[tokio::test]
async fn test_organization_membership_flow() {
    let h = Harness::new();
    let owner = h.token("owner_1", UserRole::User);

    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/organizations")
                .header("authorization", format!("Bearer {owner}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"Launch Team"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["organization"]["slug"], "launch-team");
    assert_eq!(created["membership"]["role"], "owner");

    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri("/api/organizations/members")
                .header("authorization", format!("Bearer {owner}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"userId":"teammate","role":"admin"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = h
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/api/organizations/members/owner_1")
                .header("authorization", format!("Bearer {owner}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h.send(get("/api/organizations/members", &owner)).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_admin_routes_require_super_admin() {
    let h = Harness::new();
    let org = h.organization("user_1");
    let user = h.token("user_1", UserRole::User);
    let admin = h.token("root", UserRole::SuperAdmin);

    let response = h.send(get("/api/admin/organizations", &user)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h.send(get("/api/admin/organizations", &admin)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = h
        .send(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/admin/organizations/{}/plan", org.id))
                .header("authorization", format!("Bearer {admin}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"plan":"pro"}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["plan"], "pro");

    let response = h
        .send(get("/api/admin/audit-logs?action=admin.plan_override", &admin))
        .await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_admin_webhook_replay() {
    let h = Harness::new();
    let admin = h.token("root", UserRole::SuperAdmin);
    let body = br#"{"type":"order.created","data":{"id":"ord_9"}}"#;
    assert_eq!(
        h.send(webhook_request(&h, body, body)).await.status(),
        StatusCode::OK
    );
    let record = h.state.db.webhook_events().remove(0);

    let response = h
        .send(
            Request::builder()
                .method("POST")
                .uri(format!("/api/admin/webhook-events/{}/replay", record.id))
                .header("authorization", format!("Bearer {admin}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "no_op");
    assert_eq!(h.state.db.webhook_events().len(), 1);
}
