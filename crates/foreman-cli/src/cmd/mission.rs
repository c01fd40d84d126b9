use crate::output::{ellipsize, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use foreman_core::db::Db;
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum MissionSubcommand {
    /// List recent missions
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show a mission and its steps
    Get { id: Uuid },
}

pub fn run(root: &Path, subcmd: MissionSubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;

    match subcmd {
        MissionSubcommand::List { limit } => {
            let missions = db.list_missions(limit)?;
            if json {
                print_json(&missions)?;
            } else {
                let rows = missions
                    .iter()
                    .map(|m| {
                        vec![
                            m.id.to_string(),
                            m.status.to_string(),
                            ellipsize(&m.title, 50),
                            m.created_at.format("%Y-%m-%d %H:%M").to_string(),
                        ]
                    })
                    .collect();
                print_table(&["ID", "STATUS", "TITLE", "CREATED"], rows);
            }
        }
        MissionSubcommand::Get { id } => {
            let detail = db
                .mission_detail(id)?
                .with_context(|| format!("mission '{id}' not found"))?;
            if json {
                print_json(&detail)?;
            } else {
                println!(
                    "Mission {} — {} ({})",
                    detail.mission.id, detail.mission.title, detail.mission.status
                );
                let rows = detail
                    .steps
                    .iter()
                    .map(|s| {
                        vec![
                            s.id.to_string(),
                            s.kind.clone(),
                            s.status.to_string(),
                            s.worker_id.clone().unwrap_or_default(),
                            ellipsize(&s.title, 40),
                        ]
                    })
                    .collect();
                print_table(&["STEP", "KIND", "STATUS", "WORKER", "TITLE"], rows);
            }
        }
    }
    Ok(())
}
