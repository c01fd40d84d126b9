use crate::output::{ellipsize, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use foreman_core::db::Db;
use std::path::Path;

#[derive(Subcommand)]
pub enum PolicySubcommand {
    /// List all policy entries
    List,
    /// Show one policy value
    Get { key: String },
    /// Set a policy value (JSON)
    Set {
        key: String,
        /// JSON value, e.g. '{"max": 10}'
        value: String,
    },
}

pub fn run(root: &Path, subcmd: PolicySubcommand, json: bool) -> anyhow::Result<()> {
    let db = Db::open_at_root(root)?;

    match subcmd {
        PolicySubcommand::List => {
            let policies = db.list_policies()?;
            if json {
                print_json(&policies)?;
            } else {
                let rows = policies
                    .iter()
                    .map(|p| {
                        vec![
                            p.key.clone(),
                            ellipsize(&p.value.to_string(), 60),
                            p.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        ]
                    })
                    .collect();
                print_table(&["KEY", "VALUE", "UPDATED"], rows);
            }
        }
        PolicySubcommand::Get { key } => {
            let value = db
                .policy_value(&key)?
                .with_context(|| format!("policy '{key}' not set"))?;
            print_json(&value)?;
        }
        PolicySubcommand::Set { key, value } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value must be valid JSON")?;
            let entry = db.set_policy(&key, value)?;
            if json {
                print_json(&entry)?;
            } else {
                println!("Set {} = {}", entry.key, entry.value);
            }
        }
    }
    Ok(())
}
