//! Heartbeat scheduler — fixed-interval driver of maintenance actions.
//!
//! Each tick runs a fixed action list in order. Every action's outcome is
//! recorded as one `ActionRun` whether it succeeded or not, and a failing
//! action never prevents the ones after it from running. Missed ticks are
//! not backfilled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;
use crate::event;
use crate::policy::{StaleTimeoutPolicy, STALE_STEP_TIMEOUT_MIN};
use crate::proposal::TemplateRegistry;
use crate::types::RunStatus;

// ---------------------------------------------------------------------------
// ActionRun
// ---------------------------------------------------------------------------

/// Write-once audit record of one maintenance action in one tick.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActionRun {
    pub id: Uuid,
    pub action: String,
    pub status: RunStatus,
    pub details: Value,
    pub duration_ms: u64,
    pub created_at: chrono::DateTime<Utc>,
}

impl ActionRun {
    pub fn finished(
        action: impl Into<String>,
        status: RunStatus,
        details: Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            status,
            details,
            duration_ms,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// HeartbeatAction
// ---------------------------------------------------------------------------

/// One independently-run, always-logged maintenance action. Extension
/// points (memory promotion, outcome learning, …) slot in as further
/// entries with the same contract.
pub struct HeartbeatAction {
    name: &'static str,
    run: Box<dyn Fn(&Db) -> Result<Value> + Send + Sync>,
}

impl HeartbeatAction {
    pub fn new(
        name: &'static str,
        run: impl Fn(&Db) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The standard tick, in order: recover stale claims, sweep mission
/// completion, evaluate triggers, drain reactions, record the tick.
pub fn default_actions(templates: TemplateRegistry) -> Vec<HeartbeatAction> {
    vec![
        HeartbeatAction::new("recoverStaleSteps", |db| {
            let timeout: StaleTimeoutPolicy =
                db.policy(STALE_STEP_TIMEOUT_MIN)?.unwrap_or_default();
            let cutoff = Utc::now() - chrono::Duration::minutes(i64::from(timeout.value));
            let recovered = db.recover_stale_steps(cutoff)?;
            Ok(json!({ "recovered": recovered, "timeout_min": timeout.value }))
        }),
        HeartbeatAction::new("finalizeMissions", |db| {
            let finalized = db.finalize_missions()?;
            Ok(json!({ "finalized": finalized }))
        }),
        HeartbeatAction::new("evaluateTriggers", |db| {
            let summary = db.evaluate_triggers(Utc::now())?;
            Ok(serde_json::to_value(summary)?)
        }),
        HeartbeatAction::new("processReactionQueue", move |db| {
            let summary = db.process_reaction_queue(&templates)?;
            Ok(serde_json::to_value(summary)?)
        }),
        HeartbeatAction::new("logHeartbeat", |db| {
            db.append_event(event::HEARTBEAT_TICK, "heartbeat", json!({}))?;
            Ok(json!({ "tick": true }))
        }),
    ]
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// Run every action once, recording one `ActionRun` each. An action error
/// becomes an `error` run and the tick continues; only a failure to write
/// the audit record itself is surfaced.
pub fn run_tick(db: &Db, actions: &[HeartbeatAction]) -> Result<Vec<ActionRun>> {
    tracing::info!(actions = actions.len(), "heartbeat tick starting");
    let mut runs = Vec::with_capacity(actions.len());
    for action in actions {
        let started = Instant::now();
        let outcome = (action.run)(db);
        let duration_ms = started.elapsed().as_millis() as u64;

        let run = match outcome {
            Ok(details) => ActionRun::finished(action.name, RunStatus::Ok, details, duration_ms),
            Err(e) => {
                tracing::error!(action = action.name, error = %e, "heartbeat action failed");
                ActionRun::finished(
                    action.name,
                    RunStatus::Error,
                    json!({ "error": e.to_string() }),
                    duration_ms,
                )
            }
        };
        db.record_action_run(&run)?;
        tracing::info!(action = action.name, status = %run.status, duration_ms, "heartbeat action done");
        runs.push(run);
    }
    Ok(runs)
}

/// Tick forever at `interval` until `stop` is set. A failed tick is logged
/// and the loop keeps going; there is no catch-up for missed ticks.
pub fn run_loop(db: &Db, actions: &[HeartbeatAction], interval: Duration, stop: &AtomicBool) {
    tracing::info!(interval_s = interval.as_secs(), "heartbeat loop starting");
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = run_tick(db, actions) {
            tracing::error!(error = %e, "heartbeat tick error");
        }
        let slice = Duration::from_millis(250);
        let mut remaining = interval;
        while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining -= nap;
        }
    }
    tracing::info!("heartbeat loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForemanError;
    use crate::proposal::ProposalDraft;
    use crate::types::StepStatus;
    use tempfile::TempDir;

    fn open_seeded() -> (TempDir, Db) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        db.seed_default_policies().unwrap();
        (dir, db)
    }

    #[test]
    fn tick_runs_every_action_and_records_runs() {
        let (_dir, db) = open_seeded();
        let actions = default_actions(TemplateRegistry::builtin());

        let runs = run_tick(&db, &actions).unwrap();
        assert_eq!(runs.len(), actions.len());
        assert!(runs.iter().all(|r| r.status == RunStatus::Ok));

        let names: Vec<&str> = runs.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "recoverStaleSteps",
                "finalizeMissions",
                "evaluateTriggers",
                "processReactionQueue",
                "logHeartbeat",
            ]
        );

        let recorded = db.recent_action_runs(10).unwrap();
        assert_eq!(recorded.len(), actions.len());

        let kinds: Vec<String> = db
            .events_since(0)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&event::HEARTBEAT_TICK.to_string()));
    }

    #[test]
    fn failing_action_does_not_abort_the_tick() {
        let (_dir, db) = open_seeded();

        // One stale step: claim with a zero stale timeout, so the recovery
        // cutoff is "now" and the fresh claim already qualifies.
        db.set_policy(STALE_STEP_TIMEOUT_MIN, json!({ "value": 0 }))
            .unwrap();
        db.submit_proposal(
            &ProposalDraft::new("pm", "analysis", "goes stale", None).unwrap(),
            &TemplateRegistry::builtin(),
        )
        .unwrap();
        let claimed = db.claim_step("analyze", "w1").unwrap().unwrap();

        let actions = vec![
            default_actions(TemplateRegistry::builtin())
                .into_iter()
                .next()
                .unwrap(), // recoverStaleSteps
            HeartbeatAction::new("evaluateTriggers", |_| {
                Err(ForemanError::Storage("injected fault".into()))
            }),
            HeartbeatAction::new("logHeartbeat", |db| {
                db.append_event(event::HEARTBEAT_TICK, "heartbeat", json!({}))?;
                Ok(json!({ "tick": true }))
            }),
        ];

        let runs = run_tick(&db, &actions).unwrap();
        assert_eq!(runs.len(), 3);

        assert_eq!(runs[0].action, "recoverStaleSteps");
        assert_eq!(runs[0].status, RunStatus::Ok);
        assert_eq!(runs[0].details["recovered"], 1);

        assert_eq!(runs[1].action, "evaluateTriggers");
        assert_eq!(runs[1].status, RunStatus::Error);
        assert!(runs[1].details["error"]
            .as_str()
            .unwrap()
            .contains("injected fault"));

        // The action after the fault still ran.
        assert_eq!(runs[2].action, "logHeartbeat");
        assert_eq!(runs[2].status, RunStatus::Ok);

        // The stale claim was failed and replaced.
        let old = db.get_step(claimed.id).unwrap().unwrap();
        assert_eq!(old.status, StepStatus::Failed);
        let queued = db
            .list_steps(Some("analyze"), Some(StepStatus::Queued), 10)
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].input, claimed.input);
    }

    #[test]
    fn tick_drives_trigger_to_new_proposal() {
        let (_dir, db) = open_seeded();
        db.insert_trigger(&crate::trigger::Trigger::new(
            "failure-analysis",
            crate::event::STEP_FAILED,
            crate::trigger::TriggerCondition::Always,
            crate::trigger::TriggerAction::CreateProposal {
                agent_id: "watchdog".into(),
                kind: "analysis".into(),
                title: "Investigate failure".into(),
                body: None,
            },
            0,
        ))
        .unwrap();

        db.append_event(crate::event::STEP_FAILED, "w1", json!({ "step_id": "s1" }))
            .unwrap();

        let actions = default_actions(TemplateRegistry::builtin());
        run_tick(&db, &actions).unwrap();

        // evaluateTriggers fired and processReactionQueue, later in the same
        // tick, drained the reaction into a gated proposal.
        let proposals = db.list_proposals(10).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].agent_id, "watchdog");
    }
}
