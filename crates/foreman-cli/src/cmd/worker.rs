use crate::executor::{CommandExecutor, EchoExecutor};
use foreman_core::config::Config;
use foreman_core::db::Db;
use foreman_core::proposal::validate_kind;
use foreman_core::worker::{StepExecutor, Worker, WorkerPool};
use std::path::Path;
use std::sync::Arc;

/// Run a worker pool for one step kind. With `--once`, a single worker
/// drains the queue and exits (no pool, no polling), which suits scripts
/// and tests.
pub fn run(root: &Path, kind: &str, count: usize, once: bool) -> anyhow::Result<()> {
    validate_kind(kind)?;
    let db = Arc::new(Db::open_at_root(root)?);
    let config = Config::load(root)?;

    let executor: Arc<dyn StepExecutor> = match config.worker_command(kind) {
        Some(command) => Arc::new(CommandExecutor::new(command)?),
        None => {
            tracing::warn!(kind, "no worker command configured, using echo executor");
            Arc::new(EchoExecutor)
        }
    };

    if once {
        let worker = Worker::new(
            Arc::clone(&db),
            kind,
            format!("{kind}-once-{}", std::process::id()),
            executor,
            config.worker_poll(),
        );
        let mut processed = 0u32;
        while worker.poll_once()? {
            processed += 1;
        }
        println!("Processed {processed} step(s).");
        return Ok(());
    }

    let _pool = WorkerPool::spawn(db, kind, count, executor, config.worker_poll());
    // Poll until killed; claimed-but-unfinished steps are recovered by the
    // heartbeat's stale sweep.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
