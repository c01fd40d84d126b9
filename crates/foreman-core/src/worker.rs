//! Workers: claim → execute → record, in a poll loop.
//!
//! A worker owns no queue; the store is the queue. Each poll issues the
//! atomic claim and either executes the step or backs off. Workers never
//! retry and never time out their own work; a crashed or wedged worker
//! leaves its step `running` for the centralized stale-recovery sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};

use crate::db::Db;
use crate::error::Result;
use crate::event;
use crate::mission::Step;

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// The domain-logic seam. Implementations receive the claimed step and
/// return the success payload (stored as `output`) or an error (recorded as
/// the failure detail). This layer treats the call as opaque work.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: &Step) -> Result<Value>;
}

impl<F> StepExecutor for F
where
    F: Fn(&Step) -> Result<Value> + Send + Sync,
{
    fn execute(&self, step: &Step) -> Result<Value> {
        self(step)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    db: Arc<Db>,
    kind: String,
    worker_id: String,
    executor: Arc<dyn StepExecutor>,
    poll: Duration,
}

impl Worker {
    pub fn new(
        db: Arc<Db>,
        kind: impl Into<String>,
        worker_id: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
        poll: Duration,
    ) -> Self {
        Self {
            db,
            kind: kind.into(),
            worker_id: worker_id.into(),
            executor,
            poll,
        }
    }

    /// One claim attempt. Returns whether a step was processed; `false`
    /// means nothing was claimable and the caller should back off.
    pub fn poll_once(&self) -> Result<bool> {
        let Some(step) = self.db.claim_step(&self.kind, &self.worker_id)? else {
            return Ok(false);
        };
        tracing::info!(worker = %self.worker_id, step_id = %step.id, title = %step.title, "claimed step");

        self.db.append_event(
            event::STEP_STARTED,
            &self.worker_id,
            json!({ "step_id": step.id, "kind": step.kind }),
        )?;

        match self.executor.execute(&step) {
            Ok(output) => {
                self.db.complete_step(step.id, output)?;
                tracing::info!(worker = %self.worker_id, step_id = %step.id, "step completed");
            }
            Err(e) => {
                self.db.fail_step(step.id, &e.to_string())?;
                tracing::error!(worker = %self.worker_id, step_id = %step.id, error = %e, "step failed");
            }
        }
        Ok(true)
    }

    /// Claim → execute → repeat until `stop` is set. Claim misses and
    /// errors both back off by the poll interval; errors are logged, not
    /// fatal to the loop.
    pub fn run(&self, stop: &AtomicBool) {
        tracing::info!(worker = %self.worker_id, kind = %self.kind, "worker starting");
        while !stop.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(true) => {}
                Ok(false) => sleep_interruptible(self.poll, stop),
                Err(e) => {
                    tracing::error!(worker = %self.worker_id, error = %e, "worker loop error");
                    sleep_interruptible(self.poll, stop);
                }
            }
        }
        tracing::info!(worker = %self.worker_id, "worker stopped");
    }
}

fn sleep_interruptible(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::Relaxed) {
        let nap = remaining.min(slice);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A fixed set of worker threads for one step kind, stopped cooperatively.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        db: Arc<Db>,
        kind: &str,
        count: usize,
        executor: Arc<dyn StepExecutor>,
        poll: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let worker = Worker::new(
                Arc::clone(&db),
                kind,
                format!("{kind}-{i}-{}", std::process::id()),
                Arc::clone(&executor),
                poll,
            );
            let stop = Arc::clone(&stop);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{kind}-{i}"))
                .spawn(move || worker.run(&stop))
                .expect("spawn worker thread");
            handles.push(handle);
        }
        Self { stop, handles }
    }

    /// Signal all workers and wait for them to exit their poll loops.
    /// In-flight steps finish normally; nothing is cancelled.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForemanError;
    use crate::proposal::{ProposalDraft, TemplateRegistry};
    use crate::types::{MissionStatus, StepStatus};
    use tempfile::TempDir;

    fn seeded_db() -> (TempDir, Arc<Db>) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        db.seed_default_policies().unwrap();
        (dir, Arc::new(db))
    }

    fn submit(db: &Db, title: &str) -> uuid::Uuid {
        db.submit_proposal(
            &ProposalDraft::new("pm", "analysis", title, None).unwrap(),
            &TemplateRegistry::builtin(),
        )
        .unwrap()
        .mission
        .unwrap()
        .id
    }

    #[test]
    fn worker_completes_claimed_step() {
        let (_dir, db) = seeded_db();
        let mission_id = submit(&db, "one step");

        let executor: Arc<dyn StepExecutor> =
            Arc::new(|step: &Step| Ok(json!({ "echo": step.input })));
        let worker = Worker::new(
            Arc::clone(&db),
            "analyze",
            "w1",
            executor,
            Duration::from_millis(10),
        );

        assert!(worker.poll_once().unwrap());
        assert!(!worker.poll_once().unwrap(), "queue drained");

        let detail = db.mission_detail(mission_id).unwrap().unwrap();
        assert_eq!(detail.mission.status, MissionStatus::Completed);
        assert_eq!(detail.steps[0].status, StepStatus::Completed);
        assert_eq!(detail.steps[0].worker_id.as_deref(), Some("w1"));

        let kinds: Vec<String> = db
            .events_since(0)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&event::STEP_STARTED.to_string()));
        assert!(kinds.contains(&event::STEP_COMPLETED.to_string()));
    }

    #[test]
    fn executor_failure_fails_step_and_mission() {
        let (_dir, db) = seeded_db();
        let mission_id = submit(&db, "will fail");

        let executor: Arc<dyn StepExecutor> = Arc::new(|_: &Step| {
            Err(ForemanError::StepExecution("backend unreachable".into()))
        });
        let worker = Worker::new(
            Arc::clone(&db),
            "analyze",
            "w1",
            executor,
            Duration::from_millis(10),
        );
        assert!(worker.poll_once().unwrap());

        let detail = db.mission_detail(mission_id).unwrap().unwrap();
        assert_eq!(detail.mission.status, MissionStatus::Failed);
        let step = &detail.steps[0];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.output.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("backend unreachable"));
    }

    #[test]
    fn pool_drains_the_queue_across_threads() {
        let (_dir, db) = seeded_db();
        for i in 0..4 {
            submit(&db, &format!("job {i}"));
        }

        let executor: Arc<dyn StepExecutor> = Arc::new(|_: &Step| Ok(json!({ "ok": true })));
        let pool = WorkerPool::spawn(
            Arc::clone(&db),
            "analyze",
            2,
            executor,
            Duration::from_millis(5),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let open = db
                .list_steps(Some("analyze"), None, usize::MAX)
                .unwrap()
                .into_iter()
                .filter(|s| !s.status.is_terminal())
                .count();
            if open == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "pool did not drain");
            std::thread::sleep(Duration::from_millis(10));
        }
        pool.stop();

        let steps = db.list_steps(Some("analyze"), None, usize::MAX).unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        for mission in db.list_missions(10).unwrap() {
            assert_eq!(mission.status, MissionStatus::Completed);
        }
    }
}
