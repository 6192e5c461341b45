//! Shared application state for HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use taskflow_billing::{QuotaEnforcer, SubscriptionSync, UsageMeter, WebhookVerifier};
use taskflow_cache::CacheBackend;
use taskflow_core::{AppConfig, Clock, TaskflowError, TaskflowResult};
use taskflow_platform::{
    AuditLogger, FeatureFlagManager, RateLimiter, SessionVerifier, TenantManager,
};
use taskflow_store::Database;
use tracing::warn;

use crate::llm::ChatModel;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub start_time: Instant,
    pub clock: Arc<dyn Clock>,
    pub db: Arc<Database>,
    pub cache: Arc<dyn CacheBackend>,
    /// `None` when no session secret is configured; every authenticated route then answers 401.
    pub sessions: Option<Arc<SessionVerifier>>,
    /// `None` when no webhook secret is configured; every delivery then answers 403.
    pub webhooks: Option<Arc<WebhookVerifier>>,
    pub tenants: TenantManager,
    pub meter: UsageMeter,
    pub quota: QuotaEnforcer,
    pub rate_limiter: Arc<RateLimiter>,
    pub audit: AuditLogger,
    pub flags: FeatureFlagManager,
    pub sync: SubscriptionSync,
    pub model: Arc<dyn ChatModel>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        cache: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        model: Arc<dyn ChatModel>,
    ) -> TaskflowResult<Self> {
        let sessions = match config.auth.session_secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                Some(Arc::new(SessionVerifier::new(secret, clock.clone())?))
            }
            _ => {
                warn!("auth.session_secret not set; authenticated routes are disabled");
                None
            }
        };

        let webhooks = match config.payments.webhook_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Some(Arc::new(
                WebhookVerifier::new(secret, clock.clone())
                    .map_err(|e| TaskflowError::Config(e.to_string()))?,
            )),
            _ => {
                warn!("payments.webhook_secret not set; webhooks will be rejected");
                None
            }
        };

        let meter = UsageMeter::new(db.clone(), clock.clone());
        let rate_limiter = RateLimiter::new(
            cache.clone(),
            clock.clone(),
            format!("{}:ratelimit", config.cache.key_prefix),
            config.cache.rate_limit_algorithm,
        );

        Ok(Self {
            start_time: Instant::now(),
            sessions,
            webhooks,
            tenants: TenantManager::new(db.clone(), clock.clone()),
            quota: QuotaEnforcer::new(meter.clone()),
            meter,
            rate_limiter: Arc::new(rate_limiter),
            audit: AuditLogger::new(db.clone(), clock.clone()),
            flags: FeatureFlagManager::new(db.clone(), clock.clone()),
            sync: SubscriptionSync::new(db.clone(), clock.clone()),
            config: Arc::new(config),
            clock,
            db,
            cache,
            model,
        })
    }
}
