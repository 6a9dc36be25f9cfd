use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Backup policy for one daemon run. Loaded once at startup, never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Run a backup cycle immediately after init.
    pub backup_on_start: bool,
    pub backup_on_player_connected: bool,
    pub backup_on_player_disconnected: bool,
    /// Minutes between unconditional periodic backup attempts. Absent or 0
    /// disables the timer.
    pub interval: Option<u64>,
    /// Minutes that must pass after a completed cycle before another may start.
    pub min_interval_between_backups: Option<u64>,
    /// Only back up when players are connected or activity occurred since the
    /// last completed cycle.
    pub skip_if_no_activity: bool,
    /// Skip all copy-phase filesystem I/O and resume immediately.
    #[serde(skip)]
    pub test_only: bool,
    /// Fixed staging token instead of a wall-clock timestamp.
    #[serde(skip)]
    pub staging_name: Option<String>,
}

/// Load settings from a JSON file. A missing file is not an error; callers
/// fall back to defaults.
pub fn load_settings(path: &Path) -> Result<Option<BackupSettings>> {
    let content = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };

    let settings = serde_json::from_str::<BackupSettings>(&content)
        .with_context(|| format!("Failed to parse backup settings at {}", path.display()))?;
    Ok(Some(settings))
}
