use crate::output::{ellipsize, print_json, print_table};
use clap::Subcommand;
use foreman_core::db::Db;
use foreman_core::types::StepStatus;
use std::path::Path;
use std::str::FromStr;

#[derive(Subcommand)]
pub enum StepSubcommand {
    /// List steps, optionally filtered
    List {
        /// Filter by step kind
        #[arg(long)]
        kind: Option<String>,
        /// Filter by status (queued, running, completed, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

pub fn run(root: &Path, subcmd: StepSubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;

    match subcmd {
        StepSubcommand::List {
            kind,
            status,
            limit,
        } => {
            let status = status.as_deref().map(StepStatus::from_str).transpose()?;
            let steps = db.list_steps(kind.as_deref(), status, limit)?;
            if json {
                print_json(&steps)?;
            } else {
                let rows = steps
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
                print_table(&["ID", "KIND", "STATUS", "WORKER", "TITLE"], rows);
            }
        }
    }
    Ok(())
}
