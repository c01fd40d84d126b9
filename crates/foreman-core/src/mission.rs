//! Missions and steps — the unit of accepted work and its claimable parts.

use crate::types::{MissionStatus, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mission
// ---------------------------------------------------------------------------

/// Accepted work derived from exactly one approved proposal. Its lifecycle
/// is computed from its steps; nothing transitions a mission directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub title: String,
    pub status: MissionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn new(proposal_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            title: title.into(),
            status: MissionStatus::Active,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One atomic, independently claimable unit of mission execution.
///
/// Exactly one worker holds a step while `status = running`; the only way
/// into `running` is the store's atomic claim, which stamps `worker_id`
/// and `claimed_at` in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub mission_id: Uuid,
    /// Selects which worker pool services this step.
    pub kind: String,
    pub title: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: StepStatus,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(
        mission_id: Uuid,
        kind: impl Into<String>,
        title: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mission_id,
            kind: kind.into(),
            title: title.into(),
            input,
            output: None,
            status: StepStatus::Queued,
            worker_id: None,
            claimed_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    /// A fresh queued copy for stale-claim recovery: same mission, kind,
    /// title, and input; new identity and timestamps.
    pub fn requeued(&self) -> Self {
        Self::new(self.mission_id, self.kind.clone(), self.title.clone(), self.input.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_step_is_queued_and_unclaimed() {
        let step = Step::new(Uuid::new_v4(), "analyze", "Run analysis", Value::Null);
        assert_eq!(step.status, StepStatus::Queued);
        assert!(step.worker_id.is_none());
        assert!(step.claimed_at.is_none());
        assert!(step.output.is_none());
    }

    #[test]
    fn requeued_copies_work_not_identity() {
        let original = Step::new(
            Uuid::new_v4(),
            "analyze",
            "Run analysis",
            serde_json::json!({"proposal_id": "x"}),
        );
        let copy = original.requeued();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.mission_id, original.mission_id);
        assert_eq!(copy.kind, original.kind);
        assert_eq!(copy.input, original.input);
        assert_eq!(copy.status, StepStatus::Queued);
    }
}
