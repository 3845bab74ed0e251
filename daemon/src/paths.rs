/// Canonical file paths for PawGate data files.
///
/// Everything lives under `<config dir>/PawGate/` (`%APPDATA%\PawGate\` on Windows):
///   - config.toml   Read by the daemon, edited by the user.
///   - pawgate.lock  Instance marker, held while a daemon runs.
///   - status.toml   Written by the daemon on every transition, read by the tray.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "PawGate";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOCK_FILE_NAME: &str = "pawgate.lock";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the PawGate application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no per-user configuration directory on this system")?;
    Ok(base.join(APP_DIR_NAME))
}

/// All files the daemon touches, rooted in one directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    pub lock: PathBuf,
    pub status: PathBuf,
}

impl AppPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join(CONFIG_FILE_NAME),
            lock: dir.join(LOCK_FILE_NAME),
            status: dir.join(STATUS_FILE_NAME),
        }
    }

    /// Default locations, with the config file optionally overridden by `--config`.
    /// The marker and status file stay in the application data directory.
    pub fn resolve(config_override: Option<PathBuf>) -> Result<Self> {
        let mut paths = Self::in_dir(&app_data_dir()?);
        if let Some(config) = config_override {
            paths.config = config;
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_dir_uses_canonical_file_names() {
        let paths = AppPaths::in_dir(Path::new("/tmp/pg"));
        assert_eq!(paths.config.file_name().unwrap(), CONFIG_FILE_NAME);
        assert_eq!(paths.lock.file_name().unwrap(), LOCK_FILE_NAME);
        assert_eq!(paths.status.file_name().unwrap(), STATUS_FILE_NAME);
    }

    #[test]
    fn all_files_share_same_parent_dir() {
        let paths = AppPaths::in_dir(Path::new("/tmp/pg"));
        assert_eq!(paths.config.parent(), paths.lock.parent());
        assert_eq!(paths.lock.parent(), paths.status.parent());
    }

    #[test]
    fn config_override_leaves_lock_and_status_in_place() {
        let Ok(defaults) = AppPaths::resolve(None) else {
            return; // no config dir in this environment
        };
        let custom = PathBuf::from("/somewhere/else.toml");
        let paths = AppPaths::resolve(Some(custom.clone())).unwrap();
        assert_eq!(paths.config, custom);
        assert_eq!(paths.lock, defaults.lock);
        assert_eq!(paths.status, defaults.status);
    }

    #[test]
    fn app_data_dir_ends_with_pawgate() {
        if let Ok(dir) = app_data_dir() {
            assert_eq!(dir.file_name().unwrap(), "PawGate");
        }
    }
}
