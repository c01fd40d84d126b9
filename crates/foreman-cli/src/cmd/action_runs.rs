use crate::output::{ellipsize, print_json, print_table};
use foreman_core::db::Db;
use std::path::Path;

/// List recent heartbeat action runs, newest first.
pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;
    let runs = db.recent_action_runs(limit)?;

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
                    ellipsize(&r.details.to_string(), 50),
                    r.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]
            })
            .collect();
        print_table(&["ACTION", "STATUS", "DURATION", "DETAILS", "CREATED"], rows);
    }
    Ok(())
}
