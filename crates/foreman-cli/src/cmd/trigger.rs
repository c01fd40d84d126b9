use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use foreman_core::db::Db;
use foreman_core::trigger::{Trigger, TriggerAction, TriggerCondition};
use std::path::Path;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum TriggerSubcommand {
    /// Register a trigger over the event log
    Add {
        /// Trigger name
        #[arg(long)]
        name: String,
        /// Event kind to watch (e.g. step.failed)
        #[arg(long = "on")]
        event_kind: String,
        /// Condition as tagged JSON (default: match every event)
        #[arg(long, default_value = r#"{"type":"always"}"#)]
        condition: String,
        /// Action as tagged JSON, e.g.
        /// '{"type":"create_proposal","agent_id":"watchdog","kind":"analysis","title":"Investigate"}'
        #[arg(long)]
        action: String,
        /// Minimum seconds between firings
        #[arg(long, default_value = "0")]
        cooldown: u64,
    },
    /// List triggers in evaluation order
    List,
    /// Enable a trigger
    Enable { id: Uuid },
    /// Disable a trigger
    Disable { id: Uuid },
}

pub fn run(root: &Path, subcmd: TriggerSubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;

    match subcmd {
        TriggerSubcommand::Add {
            name,
            event_kind,
            condition,
            action,
            cooldown,
        } => {
            let condition: TriggerCondition =
                serde_json::from_str(&condition).context("invalid condition JSON")?;
            let action: TriggerAction =
                serde_json::from_str(&action).context("invalid action JSON")?;
            let trigger =
                db.insert_trigger(&Trigger::new(name, event_kind, condition, action, cooldown))?;
            if json {
                print_json(&trigger)?;
            } else {
                println!("Trigger {} ({}) registered.", trigger.name, trigger.id);
            }
        }
        TriggerSubcommand::List => {
            let triggers = db.list_triggers()?;
            if json {
                print_json(&triggers)?;
            } else {
                let rows = triggers
                    .iter()
                    .map(|t| {
                        vec![
                            t.id.to_string(),
                            t.name.clone(),
                            t.event_kind.clone(),
                            t.enabled.to_string(),
                            format!("{}s", t.cooldown_s),
                            t.last_fired
                                .map(|f| f.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_else(|| "never".to_string()),
                        ]
                    })
                    .collect();
                print_table(
                    &["ID", "NAME", "ON", "ENABLED", "COOLDOWN", "LAST FIRED"],
                    rows,
                );
            }
        }
        TriggerSubcommand::Enable { id } => {
            let trigger = db.set_trigger_enabled(id, true)?;
            println!("Enabled {}.", trigger.name);
        }
        TriggerSubcommand::Disable { id } => {
            let trigger = db.set_trigger_enabled(id, false)?;
            println!("Disabled {}.", trigger.name);
        }
    }
    Ok(())
}
