//! Append-only event log records.
//!
//! Every component writes here; nothing is ever updated or deleted. The log
//! is the source of truth for "what happened": trigger evaluation and any
//! other derived state scan it forward from a per-consumer high-water mark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Engine-emitted event kinds
// ---------------------------------------------------------------------------

pub const PROPOSAL_CREATED: &str = "proposal.created";
pub const PROPOSAL_APPROVED: &str = "proposal.approved";
pub const PROPOSAL_REJECTED: &str = "proposal.rejected";
pub const PROPOSAL_HELD: &str = "proposal.held";
pub const MISSION_CREATED: &str = "mission.created";
pub const MISSION_COMPLETED: &str = "mission.completed";
pub const STEP_STARTED: &str = "step.started";
pub const STEP_COMPLETED: &str = "step.completed";
pub const STEP_FAILED: &str = "step.failed";
pub const STEP_STALE_RECOVERED: &str = "step.stale_recovered";
pub const TRIGGER_FIRED: &str = "trigger.fired";
pub const HEARTBEAT_TICK: &str = "heartbeat.tick";

/// Kinds under this prefix are reserved for the legacy file-runner bridge,
/// which only ever appends (e.g. `file.task_created`, `file.output_created`).
pub const FILE_BRIDGE_PREFIX: &str = "file.";

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable fact. `seq` is assigned by the store at append time and is
/// strictly monotonic, so `seq`-based watermarks never miss or re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub kind: String,
    pub source: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}
