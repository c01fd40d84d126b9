//! Triggers and reactions — standing conditions over the event log.
//!
//! A trigger watches one event kind. When a scanned payload matches its
//! condition outside the cooldown window, a `Reaction` is queued and later
//! drained by the reaction processor (see `Db::process_reaction_queue`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::ReactionStatus;

// ---------------------------------------------------------------------------
// TriggerCondition
// ---------------------------------------------------------------------------

/// Structured predicate over an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Every event of the watched kind matches.
    Always,
    /// Payload field equals a JSON value.
    FieldEquals { field: String, value: Value },
    /// Payload field is a number `>= min`.
    FieldAtLeast { field: String, min: f64 },
}

impl TriggerCondition {
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            TriggerCondition::Always => true,
            TriggerCondition::FieldEquals { field, value } => {
                payload.get(field) == Some(value)
            }
            TriggerCondition::FieldAtLeast { field, min } => payload
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|n| n >= *min),
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerAction
// ---------------------------------------------------------------------------

/// What a fired trigger's reaction does when drained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Route new work through the proposal service (and its gates).
    CreateProposal {
        agent_id: String,
        kind: String,
        title: String,
        #[serde(default)]
        body: Option<String>,
    },
    /// Append an event, e.g. to chain further triggers.
    EmitEvent { kind: String, payload: Value },
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub name: String,
    /// Event kind this trigger watches.
    pub event_kind: String,
    pub condition: TriggerCondition,
    pub action: TriggerAction,
    pub enabled: bool,
    /// Minimum seconds between firings; matches inside the window are
    /// consumed without firing.
    pub cooldown_s: u64,
    pub last_fired: Option<DateTime<Utc>>,
    /// Event-log high-water mark: evaluation scans `seq > last_seq` only.
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(
        name: impl Into<String>,
        event_kind: impl Into<String>,
        condition: TriggerCondition,
        action: TriggerAction,
        cooldown_s: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            event_kind: event_kind.into(),
            condition,
            action,
            enabled: true,
            cooldown_s,
            last_fired: None,
            last_seq: 0,
            created_at: Utc::now(),
        }
    }

    /// True when `now` is outside the cooldown window (or it never fired).
    pub fn cooled_down(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired {
            None => true,
            Some(fired) => (now - fired).num_seconds() >= self.cooldown_s as i64,
        }
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// Queued effect of a fired trigger, processed asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub status: ReactionStatus,
    /// The matched event's payload, kept for the action and for audit.
    pub payload: Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Reaction {
    pub fn new(trigger_id: Uuid, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_id,
            status: ReactionStatus::Queued,
            payload,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn always_matches_anything() {
        assert!(TriggerCondition::Always.matches(&serde_json::json!({})));
        assert!(TriggerCondition::Always.matches(&Value::Null));
    }

    #[test]
    fn field_equals() {
        let cond = TriggerCondition::FieldEquals {
            field: "kind".into(),
            value: serde_json::json!("deploy"),
        };
        assert!(cond.matches(&serde_json::json!({"kind": "deploy"})));
        assert!(!cond.matches(&serde_json::json!({"kind": "content"})));
        assert!(!cond.matches(&serde_json::json!({})));
    }

    #[test]
    fn field_at_least() {
        let cond = TriggerCondition::FieldAtLeast {
            field: "failed".into(),
            min: 3.0,
        };
        assert!(cond.matches(&serde_json::json!({"failed": 3})));
        assert!(cond.matches(&serde_json::json!({"failed": 7.5})));
        assert!(!cond.matches(&serde_json::json!({"failed": 2})));
        assert!(!cond.matches(&serde_json::json!({"failed": "many"})));
    }

    #[test]
    fn cooldown_window() {
        let mut trigger = Trigger::new(
            "on-failure",
            "step.failed",
            TriggerCondition::Always,
            TriggerAction::EmitEvent {
                kind: "alert".into(),
                payload: Value::Null,
            },
            300,
        );
        let t0 = Utc::now();
        assert!(trigger.cooled_down(t0));

        trigger.last_fired = Some(t0);
        assert!(!trigger.cooled_down(t0 + Duration::seconds(100)));
        assert!(trigger.cooled_down(t0 + Duration::seconds(301)));
    }

    #[test]
    fn condition_json_is_tagged() {
        let cond = TriggerCondition::FieldEquals {
            field: "kind".into(),
            value: serde_json::json!("deploy"),
        };
        let json = serde_json::to_string(&cond).unwrap();
        assert!(json.contains("\"type\":\"field_equals\""));
        let parsed: TriggerCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cond);
    }

    #[test]
    fn action_json_is_tagged() {
        let action = TriggerAction::CreateProposal {
            agent_id: "watchdog".into(),
            kind: "analysis".into(),
            title: "Investigate failures".into(),
            body: None,
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"create_proposal\""));
        let parsed: TriggerAction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, action);
    }
}
