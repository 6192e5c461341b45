//! API server: the HTTP router plus the Prometheus exporter.

use std::net::SocketAddr;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;
use crate::{admin_rest, chat, health, organizations_rest, usage_rest, webhook_rest};

/// Build the full route table over `state`.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/organizations", get(admin_rest::list_organizations))
        .route(
            "/organizations/:id",
            axum::routing::delete(admin_rest::delete_organization),
        )
        .route("/organizations/:id/plan", put(admin_rest::override_plan))
        .route("/subscriptions", get(admin_rest::list_subscriptions))
        .route("/audit-logs", get(admin_rest::audit_logs))
        .route("/compliance-report", get(admin_rest::compliance_report))
        .route("/webhook-events", get(admin_rest::webhook_events))
        .route(
            "/webhook-events/:id/replay",
            post(admin_rest::replay_webhook),
        )
        .route(
            "/feature-flags",
            get(admin_rest::list_flags).post(admin_rest::create_flag),
        )
        .route(
            "/feature-flags/:name",
            put(admin_rest::update_flag).delete(admin_rest::delete_flag),
        )
        .route(
            "/feature-flags/:name/evaluate",
            get(admin_rest::evaluate_flag),
        );

    Router::new()
        // Chat
        .route("/api/chat", post(chat::handle_chat))
        .route(
            "/api/chat/:conversation_id",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        // Usage and tenancy
        .route("/api/usage", get(usage_rest::usage_overview))
        .route("/api/organizations", post(organizations_rest::create_organization))
        .route(
            "/api/organizations/current",
            get(organizations_rest::current_organization),
        )
        .route(
            "/api/organizations/members",
            get(organizations_rest::list_members).post(organizations_rest::add_member),
        )
        .route(
            "/api/organizations/members/:user_id",
            put(organizations_rest::update_member).delete(organizations_rest::remove_member),
        )
        .route("/api/flags/:name", get(organizations_rest::evaluate_flag))
        .nest("/api/admin", admin)
        // Billing provider
        .route("/payments/webhook", post(webhook_rest::handle_webhook))
        // Operational endpoints
        .route("/health", get(health::health_check))
        .route("/live", get(health::liveness))
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve HTTP until the listener fails.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let api = &self.state.config.api;
        let addr = SocketAddr::new(api.host.parse()?, api.http_port);
        let app = router(self.state.clone());

        info!(addr = %addr, "Starting HTTP server");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Install the Prometheus recorder and serve it on the metrics port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let api = &self.state.config.api;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(api.host.parse()?, api.metrics_port))
            .install()?;
        info!(port = api.metrics_port, "Metrics exporter started");
        Ok(())
    }
}
