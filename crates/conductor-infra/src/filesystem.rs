//! Data directory layout for Conductor.

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CONDUCTOR_DATA_DIR` environment variable
/// 2. `~/.conductor` in the user's home directory
/// 3. `.conductor` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".conductor");
    }

    PathBuf::from(".conductor")
}

/// Directory holding stored workflow documents: `{data_dir}/workflows`.
pub fn workflows_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("workflows")
}
