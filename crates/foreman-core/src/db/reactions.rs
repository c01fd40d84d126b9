//! Trigger evaluation and the reaction queue.
//!
//! Triggers are evaluated in a stable order (by id), each in its own
//! transaction over the already-committed log, so no trigger observes
//! another's same-tick effects. Reactions drain with the same conditional
//! claim discipline as steps.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::{ForemanError, Result};
use crate::event;
use crate::proposal::{ProposalDraft, TemplateRegistry};
use crate::trigger::{Reaction, Trigger, TriggerAction};
use crate::types::ReactionStatus;

use super::{append_event_tx, decode, encode, storage, Db, EVENTS, REACTIONS, TRIGGERS};
use redb::ReadableTable;

const SOURCE: &str = "trigger_engine";

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EvaluationSummary {
    pub evaluated: u32,
    pub fired: u32,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DrainSummary {
    pub processed: u32,
    pub completed: u32,
    pub failed: u32,
}

// ---------------------------------------------------------------------------
// Trigger persistence
// ---------------------------------------------------------------------------

impl Db {
    /// Register a trigger. Its watermark starts at the current log tail, so
    /// a new trigger never reacts to history.
    pub fn insert_trigger(&self, trigger: &Trigger) -> Result<Trigger> {
        let wt = self.begin_write()?;
        let mut stored = trigger.clone();
        {
            let events = wt.open_table(EVENTS).map_err(storage)?;
            let tail = events
                .last()
                .map_err(storage)?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            stored.last_seq = stored.last_seq.max(tail);
        }
        {
            let mut table = wt.open_table(TRIGGERS).map_err(storage)?;
            table
                .insert(stored.id.as_bytes().as_slice(), encode(&stored)?.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(stored)
    }

    pub fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>> {
        self.read_by_id(TRIGGERS, id)
    }

    /// All triggers in stable (id) order, which is the evaluation order.
    pub fn list_triggers(&self) -> Result<Vec<Trigger>> {
        let mut rows: Vec<Trigger> = self.read_all(TRIGGERS)?;
        rows.sort_by_key(|t| t.id);
        Ok(rows)
    }

    pub fn set_trigger_enabled(&self, id: Uuid, enabled: bool) -> Result<Trigger> {
        let wt = self.begin_write()?;
        let trigger = {
            let mut table = wt.open_table(TRIGGERS).map_err(storage)?;
            let mut trigger = match table.get(id.as_bytes().as_slice()).map_err(storage)? {
                Some(v) => decode::<Trigger>(v.value())?,
                None => return Err(ForemanError::TriggerNotFound(id.to_string())),
            };
            trigger.enabled = enabled;
            table
                .insert(trigger.id.as_bytes().as_slice(), encode(&trigger)?.as_slice())
                .map_err(storage)?;
            trigger
        };
        wt.commit().map_err(storage)?;
        Ok(trigger)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Scan each enabled trigger's unseen log tail for a matching event.
    ///
    /// The watermark advances to the log tail whether or not the trigger
    /// fires, so matches consumed inside a cooldown window yield at most
    /// one reaction per window and are never revisited.
    pub fn evaluate_triggers(&self, now: DateTime<Utc>) -> Result<EvaluationSummary> {
        let mut summary = EvaluationSummary::default();
        for trigger in self.list_triggers()? {
            if !trigger.enabled {
                continue;
            }
            summary.evaluated += 1;
            if self.evaluate_one(trigger, now)? {
                summary.fired += 1;
            }
        }
        Ok(summary)
    }

    fn evaluate_one(&self, mut trigger: Trigger, now: DateTime<Utc>) -> Result<bool> {
        let wt = self.begin_write()?;

        let (tail, matched) = {
            let events = wt.open_table(EVENTS).map_err(storage)?;
            let mut tail = trigger.last_seq;
            let mut matched: Option<crate::event::Event> = None;
            for entry in events.range((trigger.last_seq + 1)..).map_err(storage)? {
                let (k, v) = entry.map_err(storage)?;
                tail = k.value();
                if matched.is_none() {
                    let ev: crate::event::Event = decode(v.value())?;
                    if ev.kind == trigger.event_kind && trigger.condition.matches(&ev.payload) {
                        matched = Some(ev);
                    }
                }
            }
            (tail, matched)
        };

        if tail == trigger.last_seq {
            return Ok(false);
        }

        trigger.last_seq = tail;
        let fired = match matched {
            Some(ev) if trigger.cooled_down(now) => {
                trigger.last_fired = Some(now);
                let reaction = Reaction::new(trigger.id, ev.payload.clone());
                {
                    let mut table = wt.open_table(REACTIONS).map_err(storage)?;
                    table
                        .insert(reaction.id.as_bytes().as_slice(), encode(&reaction)?.as_slice())
                        .map_err(storage)?;
                }
                append_event_tx(
                    &wt,
                    event::TRIGGER_FIRED,
                    SOURCE,
                    json!({
                        "trigger_id": trigger.id,
                        "name": trigger.name,
                        "event_seq": ev.seq,
                        "reaction_id": reaction.id,
                    }),
                )?;
                tracing::info!(name = %trigger.name, event_seq = ev.seq, "trigger fired");
                true
            }
            _ => false,
        };

        {
            let mut table = wt.open_table(TRIGGERS).map_err(storage)?;
            table
                .insert(trigger.id.as_bytes().as_slice(), encode(&trigger)?.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(fired)
    }

    // -----------------------------------------------------------------------
    // Reaction queue
    // -----------------------------------------------------------------------

    /// Claim the oldest queued reaction (queued → processing).
    pub fn claim_reaction(&self) -> Result<Option<Reaction>> {
        let wt = self.begin_write()?;
        let claimed = {
            let mut table = wt.open_table(REACTIONS).map_err(storage)?;
            let candidate = {
                let mut best: Option<Reaction> = None;
                for entry in table.iter().map_err(storage)? {
                    let (_, v) = entry.map_err(storage)?;
                    let reaction: Reaction = decode(v.value())?;
                    if reaction.status != ReactionStatus::Queued {
                        continue;
                    }
                    let better = best.as_ref().map_or(true, |b| {
                        (reaction.created_at, reaction.id) < (b.created_at, b.id)
                    });
                    if better {
                        best = Some(reaction);
                    }
                }
                best
            };
            match candidate {
                Some(mut reaction) => {
                    reaction.status = ReactionStatus::Processing;
                    table
                        .insert(reaction.id.as_bytes().as_slice(), encode(&reaction)?.as_slice())
                        .map_err(storage)?;
                    Some(reaction)
                }
                None => None,
            }
        };
        wt.commit().map_err(storage)?;
        Ok(claimed)
    }

    /// Finish a processing reaction (processing → completed | failed).
    pub fn finish_reaction(&self, id: Uuid, error: Option<String>) -> Result<Reaction> {
        let wt = self.begin_write()?;
        let reaction = {
            let mut table = wt.open_table(REACTIONS).map_err(storage)?;
            let mut reaction = match table.get(id.as_bytes().as_slice()).map_err(storage)? {
                Some(v) => decode::<Reaction>(v.value())?,
                None => return Err(ForemanError::ReactionNotFound(id.to_string())),
            };
            if reaction.status != ReactionStatus::Processing {
                return Err(ForemanError::InvalidTransition {
                    entity: "reaction",
                    from: reaction.status.to_string(),
                    to: if error.is_none() {
                        ReactionStatus::Completed.to_string()
                    } else {
                        ReactionStatus::Failed.to_string()
                    },
                });
            }
            reaction.status = if error.is_none() {
                ReactionStatus::Completed
            } else {
                ReactionStatus::Failed
            };
            reaction.error = error;
            reaction.processed_at = Some(Utc::now());
            table
                .insert(reaction.id.as_bytes().as_slice(), encode(&reaction)?.as_slice())
                .map_err(storage)?;
            reaction
        };
        wt.commit().map_err(storage)?;
        Ok(reaction)
    }

    /// Reactions newest first, bounded.
    pub fn list_reactions(&self, limit: usize) -> Result<Vec<Reaction>> {
        let mut rows: Vec<Reaction> = self.read_all(REACTIONS)?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Drain the queue, executing each owning trigger's action. One failed
    /// reaction never aborts the drain.
    pub fn process_reaction_queue(&self, templates: &TemplateRegistry) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        while let Some(reaction) = self.claim_reaction()? {
            summary.processed += 1;
            let outcome = self.execute_reaction(&reaction, templates);
            match outcome {
                Ok(()) => {
                    self.finish_reaction(reaction.id, None)?;
                    summary.completed += 1;
                }
                Err(e) => {
                    tracing::warn!(reaction_id = %reaction.id, error = %e, "reaction failed");
                    self.finish_reaction(reaction.id, Some(e.to_string()))?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    fn execute_reaction(&self, reaction: &Reaction, templates: &TemplateRegistry) -> Result<()> {
        let trigger = self
            .get_trigger(reaction.trigger_id)?
            .ok_or_else(|| ForemanError::TriggerNotFound(reaction.trigger_id.to_string()))?;
        match trigger.action {
            TriggerAction::CreateProposal {
                agent_id,
                kind,
                title,
                body,
            } => {
                // Reaction-derived work goes through the same gates as any
                // other proposal; this is what closes the loop.
                let draft = ProposalDraft::new(agent_id, kind, title, body)?;
                self.submit_proposal(&draft, templates)?;
                Ok(())
            }
            TriggerAction::EmitEvent { kind, payload } => {
                self.append_event(&kind, SOURCE, payload)?;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_tmp;
    use crate::trigger::TriggerCondition;
    use crate::types::ProposalStatus;
    use chrono::Duration;

    fn emit_event_trigger(name: &str, watched: &str, cooldown_s: u64) -> Trigger {
        Trigger::new(
            name,
            watched,
            TriggerCondition::Always,
            TriggerAction::EmitEvent {
                kind: "alert.raised".into(),
                payload: json!({ "from": name }),
            },
            cooldown_s,
        )
    }

    #[test]
    fn matching_event_fires_and_queues_reaction() {
        let (_dir, db) = open_tmp();
        let trigger = db
            .insert_trigger(&emit_event_trigger("on-failure", "step.failed", 300))
            .unwrap();

        db.append_event("step.failed", "w1", json!({ "step_id": "s1" }))
            .unwrap();

        let now = Utc::now();
        let summary = db.evaluate_triggers(now).unwrap();
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.fired, 1);

        let reactions = db.list_reactions(10).unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].trigger_id, trigger.id);
        assert_eq!(reactions[0].status, ReactionStatus::Queued);
        assert_eq!(reactions[0].payload["step_id"], "s1");

        let stored = db.get_trigger(trigger.id).unwrap().unwrap();
        assert_eq!(stored.last_fired, Some(now));
        // The watermark advanced to the log tail as of the scan; the
        // trigger.fired event it appended afterwards is not yet consumed.
        assert_eq!(stored.last_seq, 1);

        let kinds: Vec<String> = db
            .events_since(0)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&event::TRIGGER_FIRED.to_string()));
    }

    #[test]
    fn watermark_prevents_refiring_on_old_events() {
        let (_dir, db) = open_tmp();
        db.insert_trigger(&emit_event_trigger("once", "step.failed", 0))
            .unwrap();
        db.append_event("step.failed", "w1", json!({})).unwrap();

        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 1);
        // Same log, nothing new: no second firing even with zero cooldown.
        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 0);
    }

    #[test]
    fn new_trigger_ignores_history() {
        let (_dir, db) = open_tmp();
        db.append_event("step.failed", "w1", json!({})).unwrap();
        db.insert_trigger(&emit_event_trigger("late", "step.failed", 0))
            .unwrap();

        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 0);

        db.append_event("step.failed", "w1", json!({})).unwrap();
        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 1);
    }

    #[test]
    fn cooldown_window_suppresses_then_allows() {
        let (_dir, db) = open_tmp();
        db.insert_trigger(&emit_event_trigger("cooled", "step.failed", 300))
            .unwrap();

        let t0 = Utc::now();
        db.append_event("step.failed", "w1", json!({})).unwrap();
        assert_eq!(db.evaluate_triggers(t0).unwrap().fired, 1);

        // A qualifying event 100s later falls inside the window.
        db.append_event("step.failed", "w1", json!({})).unwrap();
        assert_eq!(
            db.evaluate_triggers(t0 + Duration::seconds(100)).unwrap().fired,
            0
        );

        // One at 301s fires again.
        db.append_event("step.failed", "w1", json!({})).unwrap();
        assert_eq!(
            db.evaluate_triggers(t0 + Duration::seconds(301)).unwrap().fired,
            1
        );
        assert_eq!(db.list_reactions(10).unwrap().len(), 2);
    }

    #[test]
    fn many_matches_in_one_window_yield_one_reaction() {
        let (_dir, db) = open_tmp();
        db.insert_trigger(&emit_event_trigger("burst", "step.failed", 300))
            .unwrap();

        for _ in 0..5 {
            db.append_event("step.failed", "w1", json!({})).unwrap();
        }
        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 1);
        assert_eq!(db.list_reactions(10).unwrap().len(), 1);
    }

    #[test]
    fn disabled_triggers_do_not_fire() {
        let (_dir, db) = open_tmp();
        let trigger = db
            .insert_trigger(&emit_event_trigger("dormant", "step.failed", 0))
            .unwrap();
        db.set_trigger_enabled(trigger.id, false).unwrap();

        db.append_event("step.failed", "w1", json!({})).unwrap();
        let summary = db.evaluate_triggers(Utc::now()).unwrap();
        assert_eq!(summary.evaluated, 0);
        assert_eq!(summary.fired, 0);
    }

    #[test]
    fn condition_filters_payloads() {
        let (_dir, db) = open_tmp();
        db.insert_trigger(&Trigger::new(
            "deploys-only",
            "proposal.created",
            TriggerCondition::FieldEquals {
                field: "kind".into(),
                value: json!("deploy"),
            },
            TriggerAction::EmitEvent {
                kind: "alert.raised".into(),
                payload: json!({}),
            },
            0,
        ))
        .unwrap();

        db.append_event("proposal.created", "x", json!({ "kind": "content" }))
            .unwrap();
        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 0);

        db.append_event("proposal.created", "x", json!({ "kind": "deploy" }))
            .unwrap();
        assert_eq!(db.evaluate_triggers(Utc::now()).unwrap().fired, 1);
    }

    #[test]
    fn reaction_creates_proposal_through_the_gates() {
        let (_dir, db) = open_tmp();
        db.seed_default_policies().unwrap();
        let templates = TemplateRegistry::builtin();

        db.insert_trigger(&Trigger::new(
            "investigate-failures",
            "step.failed",
            TriggerCondition::Always,
            TriggerAction::CreateProposal {
                agent_id: "watchdog".into(),
                kind: "analysis".into(),
                title: "Investigate step failure".into(),
                body: None,
            },
            0,
        ))
        .unwrap();

        db.append_event("step.failed", "w1", json!({ "step_id": "s1" }))
            .unwrap();
        db.evaluate_triggers(Utc::now()).unwrap();

        let summary = db.process_reaction_queue(&templates).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.completed, 1);

        // The loop closed: the reaction went through the proposal service
        // and the auto-approve gate produced a mission.
        let proposals = db.list_proposals(10).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].agent_id, "watchdog");
        assert_eq!(proposals[0].status, ProposalStatus::Approved);
        assert_eq!(db.list_missions(10).unwrap().len(), 1);

        let reactions = db.list_reactions(10).unwrap();
        assert_eq!(reactions[0].status, ReactionStatus::Completed);
        assert!(reactions[0].processed_at.is_some());
    }

    #[test]
    fn failed_reaction_is_recorded_and_drain_continues() {
        let (_dir, db) = open_tmp();
        let templates = TemplateRegistry::builtin();

        // Invalid kind makes the proposal draft fail validation.
        db.insert_trigger(&Trigger::new(
            "broken",
            "step.failed",
            TriggerCondition::Always,
            TriggerAction::CreateProposal {
                agent_id: "watchdog".into(),
                kind: "NOT A KIND".into(),
                title: "bad".into(),
                body: None,
            },
            0,
        ))
        .unwrap();
        db.insert_trigger(&emit_event_trigger("fine", "step.failed", 0))
            .unwrap();

        db.append_event("step.failed", "w1", json!({})).unwrap();
        db.evaluate_triggers(Utc::now()).unwrap();

        let summary = db.process_reaction_queue(&templates).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);

        let failed = db
            .list_reactions(10)
            .unwrap()
            .into_iter()
            .find(|r| r.status == ReactionStatus::Failed)
            .unwrap();
        assert!(failed.error.unwrap().contains("invalid kind"));
    }

    #[test]
    fn claim_reaction_moves_queued_to_processing_once() {
        let (_dir, db) = open_tmp();
        db.insert_trigger(&emit_event_trigger("t", "step.failed", 0))
            .unwrap();
        db.append_event("step.failed", "w1", json!({})).unwrap();
        db.evaluate_triggers(Utc::now()).unwrap();

        let first = db.claim_reaction().unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, ReactionStatus::Processing);
        assert!(db.claim_reaction().unwrap().is_none());
    }
}
