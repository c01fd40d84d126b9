//! Step claiming and lifecycle — the concurrency core.
//!
//! The claim is one conditional update inside one write transaction: select
//! the oldest queued step of a kind, flip it to running, stamp the worker.
//! redb's single-writer discipline makes the check-and-set indivisible, so
//! N concurrent claimants produce exactly one winner; the rest see no
//! claimable step. There is no read-then-write window to race through.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::event;
use crate::mission::{Mission, Step};
use crate::types::{MissionStatus, ProposalStatus, StepStatus};

use super::{append_event_tx, decode, encode, storage, Db, MISSIONS, PROPOSALS, STEPS};
use redb::{ReadableTable, WriteTransaction};

// ---------------------------------------------------------------------------
// MissionDetail
// ---------------------------------------------------------------------------

/// A mission together with its steps, oldest step first.
#[derive(Debug, Clone, Serialize)]
pub struct MissionDetail {
    pub mission: Mission,
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Claiming and terminal transitions
// ---------------------------------------------------------------------------

impl Db {
    /// Atomically claim the oldest queued step of `kind` for `worker_id`.
    ///
    /// Returns `Ok(None)` when no step is claimable: an expected outcome,
    /// not an error. Callers back off and poll again.
    pub fn claim_step(&self, kind: &str, worker_id: &str) -> Result<Option<Step>> {
        let wt = self.begin_write()?;
        let claimed = {
            let mut table = wt.open_table(STEPS).map_err(storage)?;
            let candidate = {
                let mut best: Option<Step> = None;
                for entry in table.iter().map_err(storage)? {
                    let (_, v) = entry.map_err(storage)?;
                    let step: Step = decode(v.value())?;
                    if step.status != StepStatus::Queued || step.kind != kind {
                        continue;
                    }
                    let better = best
                        .as_ref()
                        .map_or(true, |b| (step.created_at, step.id) < (b.created_at, b.id));
                    if better {
                        best = Some(step);
                    }
                }
                best
            };
            match candidate {
                Some(mut step) => {
                    step.status = StepStatus::Running;
                    step.worker_id = Some(worker_id.to_string());
                    step.claimed_at = Some(Utc::now());
                    table
                        .insert(step.id.as_bytes().as_slice(), encode(&step)?.as_slice())
                        .map_err(storage)?;
                    Some(step)
                }
                None => None,
            }
        };
        wt.commit().map_err(storage)?;
        Ok(claimed)
    }

    /// Mark a running step completed with its output, then re-derive the
    /// owning mission's status in the same transaction.
    pub fn complete_step(&self, id: Uuid, output: Value) -> Result<Step> {
        self.finish_step(id, StepStatus::Completed, Some(output), None)
    }

    /// Mark a running step failed, recording the failure detail as output.
    pub fn fail_step(&self, id: Uuid, error_msg: &str) -> Result<Step> {
        self.finish_step(
            id,
            StepStatus::Failed,
            Some(json!({ "error": error_msg })),
            Some(error_msg.to_string()),
        )
    }

    fn finish_step(
        &self,
        id: Uuid,
        terminal: StepStatus,
        output: Option<Value>,
        error_msg: Option<String>,
    ) -> Result<Step> {
        debug_assert!(terminal.is_terminal());
        let wt = self.begin_write()?;
        let step = {
            let mut table = wt.open_table(STEPS).map_err(storage)?;
            let mut step = match table.get(id.as_bytes().as_slice()).map_err(storage)? {
                Some(v) => decode::<Step>(v.value())?,
                None => return Err(ForemanError::StepNotFound(id.to_string())),
            };
            // Terminal transitions apply only to a held claim; re-completing
            // a finished step must not double-apply output.
            if step.status != StepStatus::Running {
                return Err(ForemanError::InvalidTransition {
                    entity: "step",
                    from: step.status.to_string(),
                    to: terminal.to_string(),
                });
            }
            step.status = terminal;
            step.output = output;
            step.completed_at = Some(Utc::now());
            table
                .insert(step.id.as_bytes().as_slice(), encode(&step)?.as_slice())
                .map_err(storage)?;
            step
        };

        let source = step.worker_id.clone().unwrap_or_else(|| "worker".to_string());
        match terminal {
            StepStatus::Completed => {
                append_event_tx(
                    &wt,
                    event::STEP_COMPLETED,
                    &source,
                    json!({ "step_id": step.id, "mission_id": step.mission_id }),
                )?;
            }
            _ => {
                append_event_tx(
                    &wt,
                    event::STEP_FAILED,
                    &source,
                    json!({ "step_id": step.id, "error": error_msg }),
                )?;
            }
        }

        finalize_mission_tx(&wt, step.mission_id, &source)?;
        wt.commit().map_err(storage)?;
        Ok(step)
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Fail every running step claimed before `older_than` and queue a fresh
    /// copy of each, so the mission can still complete. Returns the number
    /// of steps recovered.
    pub fn recover_stale_steps(&self, older_than: DateTime<Utc>) -> Result<u32> {
        let wt = self.begin_write()?;
        let mut recovered = Vec::new();
        {
            let mut table = wt.open_table(STEPS).map_err(storage)?;
            let stale: Vec<Step> = {
                let mut out = Vec::new();
                for entry in table.iter().map_err(storage)? {
                    let (_, v) = entry.map_err(storage)?;
                    let step: Step = decode(v.value())?;
                    if step.status == StepStatus::Running
                        && step.claimed_at.is_some_and(|t| t < older_than)
                    {
                        out.push(step);
                    }
                }
                out
            };
            for mut step in stale {
                step.status = StepStatus::Failed;
                step.output = Some(json!({ "error": "stale claim recovered" }));
                step.completed_at = Some(Utc::now());
                table
                    .insert(step.id.as_bytes().as_slice(), encode(&step)?.as_slice())
                    .map_err(storage)?;

                let replacement = step.requeued();
                table
                    .insert(
                        replacement.id.as_bytes().as_slice(),
                        encode(&replacement)?.as_slice(),
                    )
                    .map_err(storage)?;
                recovered.push((step, replacement));
            }
        }

        for (old, new) in &recovered {
            append_event_tx(
                &wt,
                event::STEP_STALE_RECOVERED,
                "heartbeat",
                json!({
                    "old_step_id": old.id,
                    "new_step_id": new.id,
                    "kind": old.kind,
                    "worker_id": old.worker_id,
                }),
            )?;
            tracing::warn!(step_id = %old.id, kind = %old.kind, "recovered stale step");
        }

        wt.commit().map_err(storage)?;
        Ok(recovered.len() as u32)
    }

    /// Deferred mission-completion sweep over active missions. The worker
    /// path finalizes after each terminal transition, so this normally
    /// finds nothing; it exists so a crashed worker's last write is still
    /// accounted for. Returns the number of missions finalized.
    pub fn finalize_missions(&self) -> Result<u32> {
        let mission_ids: Vec<Uuid> = self
            .list_missions(usize::MAX)?
            .into_iter()
            .filter(|m| m.status == MissionStatus::Active)
            .map(|m| m.id)
            .collect();

        let mut finalized = 0;
        for id in mission_ids {
            let wt = self.begin_write()?;
            if finalize_mission_tx(&wt, id, "heartbeat")?.is_some() {
                finalized += 1;
            }
            wt.commit().map_err(storage)?;
        }
        Ok(finalized)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_step(&self, id: Uuid) -> Result<Option<Step>> {
        self.read_by_id(STEPS, id)
    }

    /// Steps newest first, optionally filtered by kind and status.
    pub fn list_steps(
        &self,
        kind: Option<&str>,
        status: Option<StepStatus>,
        limit: usize,
    ) -> Result<Vec<Step>> {
        let mut rows: Vec<Step> = self.read_all(STEPS)?;
        rows.retain(|s| {
            kind.map_or(true, |k| s.kind == k) && status.map_or(true, |st| s.status == st)
        });
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn get_mission(&self, id: Uuid) -> Result<Option<Mission>> {
        self.read_by_id(MISSIONS, id)
    }

    /// Missions newest first, bounded.
    pub fn list_missions(&self, limit: usize) -> Result<Vec<Mission>> {
        let mut rows: Vec<Mission> = self.read_all(MISSIONS)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    /// A mission plus its steps in creation order.
    pub fn mission_detail(&self, id: Uuid) -> Result<Option<MissionDetail>> {
        let Some(mission) = self.get_mission(id)? else {
            return Ok(None);
        };
        let mut steps: Vec<Step> = self.read_all(STEPS)?;
        steps.retain(|s| s.mission_id == id);
        steps.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(Some(MissionDetail { mission, steps }))
    }
}

// ---------------------------------------------------------------------------
// Mission finalization
// ---------------------------------------------------------------------------

/// If no step of the mission remains queued or running, derive the terminal
/// mission status and apply it. Conditional on the mission still being
/// active, so the worker-side check and the heartbeat sweep cannot both
/// apply it. A completed mission also completes its proposal.
fn finalize_mission_tx(
    wt: &WriteTransaction,
    mission_id: Uuid,
    source: &str,
) -> Result<Option<MissionStatus>> {
    let (total, done, failed, open) = {
        let table = wt.open_table(STEPS).map_err(storage)?;
        let mut total = 0u32;
        let mut done = 0u32;
        let mut failed = 0u32;
        let mut open = 0u32;
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            let step: Step = decode(v.value())?;
            if step.mission_id != mission_id {
                continue;
            }
            total += 1;
            match step.status {
                StepStatus::Completed => done += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::Queued | StepStatus::Running => open += 1,
            }
        }
        (total, done, failed, open)
    };

    if total == 0 || open > 0 {
        return Ok(None);
    }

    let mission = {
        let mut table = wt.open_table(MISSIONS).map_err(storage)?;
        let mut mission = match table.get(mission_id.as_bytes().as_slice()).map_err(storage)? {
            Some(v) => decode::<Mission>(v.value())?,
            None => return Err(ForemanError::MissionNotFound(mission_id.to_string())),
        };
        if mission.status != MissionStatus::Active {
            return Ok(None);
        }
        mission.status = if failed == 0 {
            MissionStatus::Completed
        } else {
            MissionStatus::Failed
        };
        mission.completed_at = Some(Utc::now());
        table
            .insert(mission.id.as_bytes().as_slice(), encode(&mission)?.as_slice())
            .map_err(storage)?;
        mission
    };

    if mission.status == MissionStatus::Completed {
        let mut table = wt.open_table(PROPOSALS).map_err(storage)?;
        let existing = table
            .get(mission.proposal_id.as_bytes().as_slice())
            .map_err(storage)?
            .map(|v| decode::<crate::proposal::Proposal>(v.value()))
            .transpose()?;
        if let Some(mut proposal) = existing {
            if proposal.status == ProposalStatus::Approved {
                proposal.status = ProposalStatus::Completed;
                table
                    .insert(
                        proposal.id.as_bytes().as_slice(),
                        encode(&proposal)?.as_slice(),
                    )
                    .map_err(storage)?;
            }
        }
    }

    append_event_tx(
        wt,
        event::MISSION_COMPLETED,
        source,
        json!({
            "mission_id": mission.id,
            "status": mission.status,
            "steps_done": done,
            "steps_failed": failed,
        }),
    )?;
    tracing::info!(mission_id = %mission.id, status = %mission.status, done, failed, "mission finalized");

    Ok(Some(mission.status))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
