use crate::output::{ellipsize, print_json, print_table};
use clap::Subcommand;
use foreman_core::db::Db;
use std::path::Path;

#[derive(Subcommand)]
pub enum EventSubcommand {
    /// List recent events, newest first
    List {
        #[arg(long, default_value = "100")]
        limit: usize,
        /// Only events after this sequence number, oldest first
        #[arg(long)]
        since: Option<u64>,
    },
}

pub fn run(root: &Path, subcmd: EventSubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;

    match subcmd {
        EventSubcommand::List { limit, since } => {
            let events = match since {
                Some(seq) => db.events_since(seq)?,
                None => db.recent_events(limit)?,
            };
            if json {
                print_json(&events)?;
            } else {
                let rows = events
                    .iter()
                    .map(|e| {
                        vec![
                            e.seq.to_string(),
                            e.kind.clone(),
                            e.source.clone(),
                            ellipsize(&e.payload.to_string(), 60),
                            e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        ]
                    })
                    .collect();
                print_table(&["SEQ", "KIND", "SOURCE", "PAYLOAD", "CREATED"], rows);
            }
        }
    }
    Ok(())
}
