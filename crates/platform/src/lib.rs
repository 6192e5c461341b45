//! SaaS platform services for taskflow: session authentication, tenancy,
//! cache-backed rate limiting, audit logging, and feature flags.

pub mod audit;
pub mod auth;
pub mod feature_flags;
pub mod rate_limit;
pub mod tenancy;

pub use audit::{AuditEntry, AuditLogger, AuditQuery, ComplianceReport};
pub use auth::{SessionClaims, SessionVerifier, UserRole};
pub use feature_flags::{FeatureFlagManager, FlagEvaluation};
pub use rate_limit::{
    api_policy, chat_policy, RateLimitAlgorithm, RateLimitDecision, RateLimitPolicy, RateLimiter,
};
pub use tenancy::TenantManager;
