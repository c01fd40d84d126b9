use foreman_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the instance root: an explicit `--root`/`FOREMAN_ROOT` wins,
/// otherwise walk up from the current directory looking for `.foreman/`,
/// falling back to the current directory (where `init` would create it).
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir = cwd.as_path();
    loop {
        if paths::foreman_dir(dir).is_dir() {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return cwd,
        }
    }
}
