use crate::output::{ellipsize, print_json, print_table};
use foreman_core::config::Config;
use foreman_core::db::Db;
use foreman_core::heartbeat::{self, ActionRun};
use foreman_core::proposal::TemplateRegistry;
use std::path::Path;
use std::sync::atomic::AtomicBool;

/// One manual tick, or the full loop with `--watch`.
pub fn run(root: &Path, watch: bool, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;
    let actions = heartbeat::default_actions(TemplateRegistry::builtin());

    if watch {
        let config = Config::load(root)?;
        // Runs until the process is killed; in-flight work is covered by
        // stale recovery on the next start.
        let stop = AtomicBool::new(false);
        heartbeat::run_loop(&db, &actions, config.heartbeat_interval(), &stop);
        return Ok(());
    }

    let runs = heartbeat::run_tick(&db, &actions)?;
    print_runs(&runs, json)
}

pub fn print_runs(runs: &[ActionRun], json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&runs)?;
    } else {
        let rows = runs
            .iter()
            .map(|r| {
                vec![
                    r.action.clone(),
                    r.status.to_string(),
                    format!("{}ms", r.duration_ms),
                    ellipsize(&r.details.to_string(), 60),
                ]
            })
            .collect();
        print_table(&["ACTION", "STATUS", "DURATION", "DETAILS"], rows);
    }
    Ok(())
}
