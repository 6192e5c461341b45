//! Feature flags: global or per-organization toggles with percentage rollout.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taskflow_core::types::FeatureFlag;
use taskflow_core::{Clock, TaskflowError, TaskflowResult};
use taskflow_store::Database;
use tracing::info;
use uuid::Uuid;

/// Feature flag evaluation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagEvaluation {
    pub flag: String,
    pub enabled: bool,
    pub reason: String,
}

#[derive(Clone)]
pub struct FeatureFlagManager {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl FeatureFlagManager {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Create a flag. Scoped to one organization when `organization_id` is set.
    pub fn create_flag(
        &self,
        name: &str,
        description: &str,
        organization_id: Option<Uuid>,
        rollout_percentage: u8,
    ) -> TaskflowResult<FeatureFlag> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TaskflowError::Validation("flag name is required".into()));
        }
        check_percentage(rollout_percentage)?;
        let now = self.clock.now();
        let flag = self.db.insert_flag(FeatureFlag {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            enabled: false,
            organization_id,
            rollout_percentage,
            created_at: now,
            updated_at: now,
        })?;
        info!(flag = %flag.name, "Feature flag created");
        Ok(flag)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> TaskflowResult<FeatureFlag> {
        let now = self.clock.now();
        let flag = self.db.patch_flag(name, |f| {
            f.enabled = enabled;
            f.updated_at = now;
        })?;
        info!(flag = %name, enabled, "Feature flag toggled");
        Ok(flag)
    }

    pub fn set_rollout(&self, name: &str, percentage: u8) -> TaskflowResult<FeatureFlag> {
        check_percentage(percentage)?;
        let now = self.clock.now();
        self.db.patch_flag(name, |f| {
            f.rollout_percentage = percentage;
            f.updated_at = now;
        })
    }

    /// Whether the flag is on for an organization. The rollout bucket is a
    /// stable function of flag name and organization id.
    pub fn evaluate(&self, name: &str, organization_id: Uuid) -> FlagEvaluation {
        let result = |enabled: bool, reason: String| FlagEvaluation {
            flag: name.to_string(),
            enabled,
            reason,
        };
        let Some(flag) = self.db.get_flag(name) else {
            return result(false, "Flag not found".into());
        };
        if !flag.enabled {
            return result(false, "Flag disabled".into());
        }
        if let Some(scope) = flag.organization_id {
            if scope != organization_id {
                return result(false, "Flag scoped to another organization".into());
            }
        }
        let pct = flag.rollout_percentage;
        if pct >= 100 {
            return result(true, "Full rollout".into());
        }
        if rollout_bucket(name, organization_id) < pct {
            result(true, format!("Organization in {pct}% rollout"))
        } else {
            result(false, format!("Organization outside {pct}% rollout"))
        }
    }

    pub fn list_flags(&self) -> Vec<FeatureFlag> {
        self.db.list_flags()
    }

    pub fn delete_flag(&self, name: &str) -> bool {
        self.db.delete_flag(name)
    }
}

fn check_percentage(pct: u8) -> TaskflowResult<()> {
    if pct > 100 {
        return Err(TaskflowError::Validation(format!(
            "rollout percentage must be within 0..=100, got {pct}"
        )));
    }
    Ok(())
}

/// Bucket in `0..100`.
fn rollout_bucket(flag: &str, organization_id: Uuid) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(flag.as_bytes());
    hasher.update(b":");
    hasher.update(organization_id.as_bytes());
    let digest = hasher.finalize();
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (head % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskflow_core::ManualClock;

    fn manager() -> FeatureFlagManager {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        FeatureFlagManager::new(Arc::new(Database::new()), clock)
    }

    #[test]
    fn test_create_and_toggle() {
        let flags = manager();
        let org = Uuid::new_v4();
        flags.create_flag("ai_assistant", "Chat assistant", None, 100).unwrap();
        assert!(matches!(
            flags.create_flag("ai_assistant", "dup", None, 100),
            Err(TaskflowError::Conflict(_))
        ));
        assert!(matches!(
            flags.create_flag("too_much", "", None, 101),
            Err(TaskflowError::Validation(_))
        ));

        // Created disabled.
        assert!(!flags.evaluate("ai_assistant", org).enabled);
        flags.set_enabled("ai_assistant", true).unwrap();
        assert!(flags.evaluate("ai_assistant", org).enabled);

        assert!(!flags.evaluate("missing", org).enabled);
        assert!(flags.delete_flag("ai_assistant"));
        assert!(flags.list_flags().is_empty());
    }

    #[test]
    fn test_scoped_flag() {
        let flags = manager();
        let org = Uuid::new_v4();
        flags.create_flag("beta", "", Some(org), 100).unwrap();
        flags.set_enabled("beta", true).unwrap();
        assert!(flags.evaluate("beta", org).enabled);
        assert!(!flags.evaluate("beta", Uuid::new_v4()).enabled);
    }

    #[test]
    fn test_rollout_is_deterministic() {
        let flags = manager();
        flags.create_flag("gradual", "", None, 0).unwrap();
        flags.set_enabled("gradual", true).unwrap();

        let orgs: Vec<Uuid> = (0..200).map(|_| Uuid::new_v4()).collect();
        assert!(orgs.iter().all(|o| !flags.evaluate("gradual", *o).enabled));

        flags.set_rollout("gradual", 50).unwrap();
        let first: Vec<bool> = orgs.iter().map(|o| flags.evaluate("gradual", *o).enabled).collect();
        let second: Vec<bool> = orgs.iter().map(|o| flags.evaluate("gradual", *o).enabled).collect();
        assert_eq!(first, second);
        let on = first.iter().filter(|e| **e).count();
        assert!(on > 0 && on < orgs.len());

        // Raising the percentage never turns an organization off.
        flags.set_rollout("gradual", 80).unwrap();
        for (org, was_on) in orgs.iter().zip(&first) {
            if *was_on {
                assert!(flags.evaluate("gradual", *org).enabled);
            }
        }
    }
}
