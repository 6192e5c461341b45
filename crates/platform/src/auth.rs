//! Session tokens: `<base64 claims>.<base64 HMAC-SHA256 signature>`.
//!
//! The identity provider issues a token per sign-in; the API only verifies
//! it and reads the claims.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use taskflow_core::{Clock, TaskflowError, TaskflowResult};

type HmacSha256 = Hmac<Sha256>;

/// Platform-wide role carried in the session, distinct from organization roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Identity-provider user id.
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: UserRole,
    /// Unix seconds.
    pub exp: i64,
}

impl SessionClaims {
    pub fn is_super_admin(&self) -> bool {
        self.role == UserRole::SuperAdmin
    }
}

pub struct SessionVerifier {
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
}

impl SessionVerifier {
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> TaskflowResult<Self> {
        if secret.is_empty() {
            return Err(TaskflowError::Config("auth.session_secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| TaskflowError::Config(format!("invalid session secret: {e}")))?;
        Ok(Self { mac, clock })
    }

    /// Sign a token for `sub` valid for `ttl`.
    pub fn issue(
        &self,
        sub: &str,
        email: Option<&str>,
        role: UserRole,
        ttl: Duration,
    ) -> TaskflowResult<String> {
        let claims = SessionClaims {
            sub: sub.to_string(),
            email: email.map(str::to_string),
            role,
            exp: (self.clock.now() + ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &SessionClaims) -> TaskflowResult<String> {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload = serde_json::to_vec(claims)?;
        let mut mac = self.mac.clone();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        Ok(format!("{}.{}", engine.encode(&payload), engine.encode(signature)))
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> TaskflowResult<SessionClaims> {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let invalid = || TaskflowError::Unauthorized("invalid session token".into());

        let (payload_b64, sig_b64) = token.trim().split_once('.').ok_or_else(invalid)?;
        let payload = engine.decode(payload_b64).map_err(|_| invalid())?;
        let signature = engine.decode(sig_b64).map_err(|_| invalid())?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let claims: SessionClaims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or_else(invalid)?;
        if expires_at <= self.clock.now() {
            return Err(TaskflowError::Unauthorized("session expired".into()));
        }
        Ok(claims)
    }
}
