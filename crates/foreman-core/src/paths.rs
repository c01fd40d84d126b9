use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const FOREMAN_DIR: &str = ".foreman";
pub const CONFIG_FILE: &str = ".foreman/config.yaml";
pub const DB_FILE: &str = ".foreman/foreman.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn foreman_dir(root: &Path) -> PathBuf {
    root.join(FOREMAN_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn is_initialized(root: &Path) -> bool {
    db_path(root).exists()
}
