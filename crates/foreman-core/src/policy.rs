//! Versioned key→JSON policy configuration.
//!
//! The read path is always "latest value for key"; the only history kept is
//! the per-proposal snapshot captured at admission time. Known keys have
//! typed shapes so gate logic stays exhaustive instead of poking at maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Well-known keys
// ---------------------------------------------------------------------------

pub const AUTO_APPROVE: &str = "auto_approve";
pub const DAILY_PROPOSAL_CAP: &str = "daily_proposal_cap";
pub const STALE_STEP_TIMEOUT_MIN: &str = "stale_step_timeout_min";

/// Per-kind cap keys follow the original naming: `<kind>_cap`.
pub fn kind_cap_key(kind: &str) -> String {
    format!("{kind}_cap")
}

// ---------------------------------------------------------------------------
// PolicyEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Typed policy shapes
// ---------------------------------------------------------------------------

/// `auto_approve` — per-kind allow-list for skipping the human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoApprovePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl Default for AutoApprovePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            kinds: Vec::new(),
        }
    }
}

impl AutoApprovePolicy {
    pub fn allows(&self, kind: &str) -> bool {
        self.enabled && self.kinds.iter().any(|k| k == kind)
    }
}

/// `daily_proposal_cap` — per-agent proposals admitted per UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCapPolicy {
    #[serde(default = "default_daily_max")]
    pub max: u32,
}

fn default_daily_max() -> u32 {
    50
}

impl Default for DailyCapPolicy {
    fn default() -> Self {
        Self {
            max: default_daily_max(),
        }
    }
}

/// `<kind>_cap` — proposals of one kind admitted per UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindCapPolicy {
    pub max_per_day: u32,
}

/// `stale_step_timeout_min` — minutes a step may sit `running` before the
/// recovery sweep declares its claim stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleTimeoutPolicy {
    #[serde(default = "default_stale_minutes")]
    pub value: u32,
}

fn default_stale_minutes() -> u32 {
    30
}

impl Default for StaleTimeoutPolicy {
    fn default() -> Self {
        Self {
            value: default_stale_minutes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Seed values written by `init` for keys not already present.
pub fn default_policies() -> Vec<(String, Value)> {
    vec![
        (
            AUTO_APPROVE.to_string(),
            serde_json::json!({
                "enabled": true,
                "kinds": ["analysis", "content", "research"],
            }),
        ),
        (
            DAILY_PROPOSAL_CAP.to_string(),
            serde_json::json!({ "max": 50 }),
        ),
        (
            kind_cap_key("content"),
            serde_json::json!({ "max_per_day": 20 }),
        ),
        (
            STALE_STEP_TIMEOUT_MIN.to_string(),
            serde_json::json!({ "value": 30 }),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_approve_allows() {
        let policy = AutoApprovePolicy {
            enabled: true,
            kinds: vec!["analysis".into(), "content".into()],
        };
        assert!(policy.allows("analysis"));
        assert!(!policy.allows("deploy"));

        let disabled = AutoApprovePolicy {
            enabled: false,
            kinds: vec!["analysis".into()],
        };
        assert!(!disabled.allows("analysis"));
    }

    #[test]
    fn policy_shapes_decode_original_json() {
        let auto: AutoApprovePolicy =
            serde_json::from_value(serde_json::json!({"enabled": true, "kinds": ["analysis"]}))
                .unwrap();
        assert!(auto.allows("analysis"));

        let cap: DailyCapPolicy = serde_json::from_value(serde_json::json!({"max": 5})).unwrap();
        assert_eq!(cap.max, 5);

        let kind_cap: KindCapPolicy =
            serde_json::from_value(serde_json::json!({"max_per_day": 20})).unwrap();
        assert_eq!(kind_cap.max_per_day, 20);

        let stale: StaleTimeoutPolicy =
            serde_json::from_value(serde_json::json!({"value": 30})).unwrap();
        assert_eq!(stale.value, 30);
    }

    #[test]
    fn defaults_cover_documented_keys() {
        let keys: Vec<String> = default_policies().into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&AUTO_APPROVE.to_string()));
        assert!(keys.contains(&DAILY_PROPOSAL_CAP.to_string()));
        assert!(keys.contains(&"content_cap".to_string()));
        assert!(keys.contains(&STALE_STEP_TIMEOUT_MIN.to_string()));
    }
}
