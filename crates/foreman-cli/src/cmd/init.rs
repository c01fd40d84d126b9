use crate::output::print_json;
use anyhow::Context;
use foreman_core::{config::Config, db::Db, paths};
use std::path::Path;

/// Create `.foreman/`, a default config, the database, and seed policies.
/// Safe to run twice: existing config and policy values are left alone.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(paths::foreman_dir(root)).context("failed to create .foreman/")?;

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write default config")?;
    }

    let db = Db::open(&paths::db_path(root)).context("failed to open database")?;
    let seeded = db
        .seed_default_policies()
        .context("failed to seed policies")?;

    if json {
        print_json(&serde_json::json!({
            "root": root,
            "policies_seeded": seeded,
        }))?;
    } else {
        println!("Initialized foreman instance at {}", root.display());
        if seeded > 0 {
            println!("Seeded {seeded} default policy entries.");
        }
    }
    Ok(())
}
