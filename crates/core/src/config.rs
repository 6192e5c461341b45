use serde::{Deserialize, Serialize};

/// Root application configuration. Loaded from environment variables
/// with the prefix `TASKFLOW__`, e.g. `TASKFLOW__PAYMENTS__WEBHOOK_SECRET`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Base URL of the web dashboard, used for redirect links.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub rate_limit_algorithm: RateLimitAlgorithm,
}

/// Counting algorithm used by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Sorted set of request timestamps; precise but heavier.
    SlidingWindow,
    /// One counter per window, reset by TTL.
    #[default]
    FixedWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentsServer {
    Sandbox,
    Production,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_payments_server")]
    pub server: PaymentsServer,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for verifying identity-provider session tokens.
    #[serde(default)]
    pub session_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

// Default functions
fn default_node_id() -> String {
    "taskflow-01".to_string()
}
fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Redis
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "taskflow".to_string()
}
fn default_payments_server() -> PaymentsServer {
    PaymentsServer::Sandbox
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_from_address() -> String {
    "noreply@taskflow.dev".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
            rate_limit_algorithm: RateLimitAlgorithm::default(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            server: default_payments_server(),
            organization_id: None,
            webhook_secret: None,
        }
    }
}

impl PaymentsConfig {
    /// Both the API token and the webhook secret are set.
    pub fn is_configured(&self) -> bool {
        self.webhook_secret.as_deref().is_some_and(|s| !s.is_empty())
            && self.access_token.as_deref().is_some_and(|s| !s.is_empty())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from_address: default_from_address(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            frontend_url: default_frontend_url(),
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            payments: PaymentsConfig::default(),
            auth: AuthConfig::default(),
            llm: LlmConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("TASKFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("cache.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert_eq!(config.cache.backend, CacheBackendKind::Redis);
        assert_eq!(config.payments.server, PaymentsServer::Sandbox);
        assert!(!config.payments.is_configured());
        assert!(config.auth.session_secret.is_none());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "cache": { "backend": "memory" },
            "payments": { "webhook_secret": "whsec", "access_token": "tok" }
        }))
        .unwrap();
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.cache.key_prefix, "taskflow");
        assert!(config.payments.is_configured());
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }
}
