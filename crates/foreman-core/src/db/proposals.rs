//! Proposal admission: gate evaluation, approval, rejection.
//!
//! The whole of `submit_proposal` runs in one write transaction: policy
//! snapshot, cap counting, gate decision, insert, and (on auto-approval)
//! mission/step creation. Two concurrent submissions therefore serialize,
//! and a cap with one slot left admits exactly one of them.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::event;
use crate::mission::{Mission, Step};
use crate::policy::{AutoApprovePolicy, DailyCapPolicy, KindCapPolicy};
use crate::proposal::{Proposal, ProposalDraft, TemplateRegistry};
use crate::types::ProposalStatus;

use super::{
    append_event_tx, decode, encode, snapshot_policy_tx, storage, today_start, Db, MISSIONS,
    PROPOSALS, STEPS,
};
use redb::{ReadableTable, WriteTransaction};

const SOURCE: &str = "proposal_service";

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Outcome of a gated admission. `held_reason` is set when a cap kept the
/// proposal pending; that is a decision, not an error.
#[derive(Debug, Clone)]
pub struct Submission {
    pub proposal: Proposal,
    pub mission: Option<Mission>,
    pub steps: Vec<Step>,
    pub held_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Db {
    /// Create a proposal, apply policy gates, and auto-approve when the
    /// policy allows, all atomically.
    pub fn submit_proposal(
        &self,
        draft: &ProposalDraft,
        templates: &TemplateRegistry,
    ) -> Result<Submission> {
        let now = Utc::now();
        let wt = self.begin_write()?;

        let snapshot = snapshot_policy_tx(&wt)?;
        let auto: AutoApprovePolicy = decode_policy(&snapshot, crate::policy::AUTO_APPROVE)?
            .unwrap_or_default();
        let daily: DailyCapPolicy = decode_policy(&snapshot, crate::policy::DAILY_PROPOSAL_CAP)?
            .unwrap_or_default();
        let kind_cap: Option<KindCapPolicy> =
            decode_policy(&snapshot, &crate::policy::kind_cap_key(&draft.kind))?;

        // Cap counters are aggregates over persisted rows scoped to the
        // current UTC day, never in-memory counts.
        let start = today_start(now);
        let (agent_today, kind_today) = {
            let table = wt.open_table(PROPOSALS).map_err(storage)?;
            let mut agent_count = 0u32;
            let mut kind_count = 0u32;
            for entry in table.iter().map_err(storage)? {
                let (_, v) = entry.map_err(storage)?;
                let row: Proposal = decode(v.value())?;
                if row.created_at < start {
                    continue;
                }
                if row.agent_id == draft.agent_id {
                    agent_count += 1;
                }
                if row.kind == draft.kind {
                    kind_count += 1;
                }
            }
            (agent_count, kind_count)
        };

        let held_reason = if agent_today >= daily.max {
            Some(format!(
                "daily cap reached for '{}': {agent_today}/{}",
                draft.agent_id, daily.max
            ))
        } else if let Some(cap) = &kind_cap {
            (kind_today >= cap.max_per_day).then(|| {
                format!(
                    "kind cap reached for '{}': {kind_today}/{}",
                    draft.kind, cap.max_per_day
                )
            })
        } else {
            None
        };

        let auto_approved = held_reason.is_none() && auto.allows(&draft.kind);

        let mut proposal = Proposal {
            id: Uuid::new_v4(),
            agent_id: draft.agent_id.clone(),
            kind: draft.kind.clone(),
            title: draft.title.clone(),
            body: draft.body.clone(),
            status: ProposalStatus::Pending,
            policy_snapshot: snapshot,
            created_at: now,
            decided_at: None,
        };
        if auto_approved {
            proposal.status = ProposalStatus::Approved;
            proposal.decided_at = Some(now);
        }

        {
            let mut table = wt.open_table(PROPOSALS).map_err(storage)?;
            table
                .insert(proposal.id.as_bytes().as_slice(), encode(&proposal)?.as_slice())
                .map_err(storage)?;
        }

        append_event_tx(
            &wt,
            event::PROPOSAL_CREATED,
            SOURCE,
            json!({
                "proposal_id": proposal.id,
                "agent_id": proposal.agent_id,
                "kind": proposal.kind,
            }),
        )?;

        let mut mission = None;
        let mut steps = Vec::new();
        if let Some(reason) = &held_reason {
            tracing::warn!(agent_id = %proposal.agent_id, kind = %proposal.kind, %reason, "proposal held");
            append_event_tx(
                &wt,
                event::PROPOSAL_HELD,
                SOURCE,
                json!({ "proposal_id": proposal.id, "reason": reason }),
            )?;
        } else if auto_approved {
            append_event_tx(
                &wt,
                event::PROPOSAL_APPROVED,
                SOURCE,
                json!({ "proposal_id": proposal.id, "auto": true }),
            )?;
            let (m, s) = create_mission_tx(&wt, &proposal, templates)?;
            mission = Some(m);
            steps = s;
            tracing::info!(title = %proposal.title, kind = %proposal.kind, agent_id = %proposal.agent_id, "proposal auto-approved");
        } else {
            tracing::info!(title = %proposal.title, kind = %proposal.kind, agent_id = %proposal.agent_id, "proposal pending review");
        }

        wt.commit().map_err(storage)?;
        Ok(Submission {
            proposal,
            mission,
            steps,
            held_reason,
        })
    }

    /// Manually approve a pending proposal, materializing its mission.
    pub fn approve_proposal(
        &self,
        id: Uuid,
        templates: &TemplateRegistry,
    ) -> Result<(Proposal, Mission, Vec<Step>)> {
        let wt = self.begin_write()?;
        let mut proposal = {
            let table = wt.open_table(PROPOSALS).map_err(storage)?;
            let decoded = match table.get(id.as_bytes().as_slice()).map_err(storage)? {
                Some(v) => decode::<Proposal>(v.value())?,
                None => return Err(ForemanError::ProposalNotFound(id.to_string())),
            };
            decoded
        };
        if proposal.status != ProposalStatus::Pending {
            return Err(ForemanError::InvalidTransition {
                entity: "proposal",
                from: proposal.status.to_string(),
                to: ProposalStatus::Approved.to_string(),
            });
        }

        proposal.status = ProposalStatus::Approved;
        proposal.decided_at = Some(Utc::now());
        {
            let mut table = wt.open_table(PROPOSALS).map_err(storage)?;
            table
                .insert(proposal.id.as_bytes().as_slice(), encode(&proposal)?.as_slice())
                .map_err(storage)?;
        }

        append_event_tx(
            &wt,
            event::PROPOSAL_APPROVED,
            SOURCE,
            json!({ "proposal_id": proposal.id, "auto": false }),
        )?;
        let (mission, steps) = create_mission_tx(&wt, &proposal, templates)?;

        wt.commit().map_err(storage)?;
        Ok((proposal, mission, steps))
    }

    /// Reject a pending proposal. No mission is ever created.
    pub fn reject_proposal(&self, id: Uuid, reason: Option<&str>) -> Result<Proposal> {
        let wt = self.begin_write()?;
        let mut proposal = {
            let table = wt.open_table(PROPOSALS).map_err(storage)?;
            let decoded = match table.get(id.as_bytes().as_slice()).map_err(storage)? {
                Some(v) => decode::<Proposal>(v.value())?,
                None => return Err(ForemanError::ProposalNotFound(id.to_string())),
            };
            decoded
        };
        if proposal.status != ProposalStatus::Pending {
            return Err(ForemanError::InvalidTransition {
                entity: "proposal",
                from: proposal.status.to_string(),
                to: ProposalStatus::Rejected.to_string(),
            });
        }

        proposal.status = ProposalStatus::Rejected;
        proposal.decided_at = Some(Utc::now());
        {
            let mut table = wt.open_table(PROPOSALS).map_err(storage)?;
            table
                .insert(proposal.id.as_bytes().as_slice(), encode(&proposal)?.as_slice())
                .map_err(storage)?;
        }

        append_event_tx(
            &wt,
            event::PROPOSAL_REJECTED,
            SOURCE,
            json!({ "proposal_id": proposal.id, "reason": reason }),
        )?;

        wt.commit().map_err(storage)?;
        Ok(proposal)
    }

    pub fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>> {
        self.read_by_id(PROPOSALS, id)
    }

    /// Proposals newest first, bounded.
    pub fn list_proposals(&self, limit: usize) -> Result<Vec<Proposal>> {
        let mut rows: Vec<Proposal> = self.read_all(PROPOSALS)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_policy<T: serde::de::DeserializeOwned>(
    snapshot: &std::collections::BTreeMap<String, serde_json::Value>,
    key: &str,
) -> Result<Option<T>> {
    match snapshot.get(key) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}

/// Create the mission and its templated steps for an approved proposal.
/// Emits `mission.created`. Caller owns the transaction.
fn create_mission_tx(
    wt: &WriteTransaction,
    proposal: &Proposal,
    templates: &TemplateRegistry,
) -> Result<(Mission, Vec<Step>)> {
    let mission = Mission::new(proposal.id, proposal.title.clone());
    {
        let mut table = wt.open_table(MISSIONS).map_err(storage)?;
        table
            .insert(mission.id.as_bytes().as_slice(), encode(&mission)?.as_slice())
            .map_err(storage)?;
    }

    let input = json!({ "proposal_id": proposal.id, "kind": proposal.kind });
    let mut steps = Vec::new();
    {
        let mut table = wt.open_table(STEPS).map_err(storage)?;
        for template in templates.steps_for(&proposal.kind, &proposal.title) {
            let step = Step::new(mission.id, template.kind, template.title, input.clone());
            table
                .insert(step.id.as_bytes().as_slice(), encode(&step)?.as_slice())
                .map_err(storage)?;
            steps.push(step);
        }
    }

    append_event_tx(
        wt,
        event::MISSION_CREATED,
        SOURCE,
        json!({
            "mission_id": mission.id,
            "proposal_id": proposal.id,
            "step_count": steps.len(),
        }),
    )?;

    Ok((mission, steps))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
