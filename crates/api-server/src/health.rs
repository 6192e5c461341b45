//! Operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub database: bool,
    pub rate_limit: bool,
    pub authentication: bool,
    pub payments: bool,
}

impl HealthChecks {
    fn all_ok(&self) -> bool {
        self.database && self.rate_limit && self.authentication && self.payments
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub checks: HealthChecks,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health: 200 when every dependency is reachable and configured, 503 otherwise.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.db.ping().is_ok();
    let rate_limit = match state.cache.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Cache ping failed");
            false
        }
    };
    let checks = HealthChecks {
        database,
        rate_limit,
        authentication: state.sessions.is_some(),
        payments: state.config.payments.is_configured(),
    };

    let (code, status) = if checks.all_ok() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (
        code,
        Json(HealthResponse {
            status,
            checks,
            node_id: state.config.node_id.clone(),
            uptime_secs: state.start_time.elapsed().as_secs(),
        }),
    )
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
