use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Dispatch configuration loaded from `<town root>/.gastown/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TownConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for TownConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl TownConfig {
    /// Load config from the town root, falling back to defaults when the
    /// file does not exist.
    pub fn load(town_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_in(town_root);
        if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let cfg: TownConfig =
                toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(cfg)
        } else {
            Ok(TownConfig::default())
        }
    }

    pub fn path_in(town_root: &Path) -> PathBuf {
        town_root.join(".gastown").join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Polecat concurrency cap. `> 0` routes slings through the deferred
    /// queue; `<= 0` dispatches directly under the caller.
    #[serde(default)]
    pub max_polecats: i32,
    /// Per-rig concurrency cap for the queue dispatcher.
    #[serde(default = "default_max_per_rig")]
    pub max_per_rig: u32,
    /// Wave sizes above this emit a `capacity` warning.
    #[serde(default = "default_wave_capacity")]
    pub wave_capacity_warning: usize,
    /// Delay between Wave 1 spawns, to keep write-lock contention down.
    #[serde(default = "default_inter_spawn_ms")]
    pub inter_spawn_delay_ms: u64,
    /// Delay between batch-sling spawns.
    #[serde(default = "default_batch_spawn_ms")]
    pub batch_spawn_delay_ms: u64,
    /// Sleep when the batch admission throttle is saturated.
    #[serde(default = "default_batch_cooldown_ms")]
    pub batch_cooldown_ms: u64,
    /// Bounded retry attempts for hooking a bead.
    #[serde(default = "default_hook_retries")]
    pub hook_retry_attempts: u32,
    /// A hooked polecat whose session has been gone this long counts as dead.
    #[serde(default = "default_dead_session_secs")]
    pub dead_session_threshold_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_polecats: 0,
            max_per_rig: default_max_per_rig(),
            wave_capacity_warning: default_wave_capacity(),
            inter_spawn_delay_ms: default_inter_spawn_ms(),
            batch_spawn_delay_ms: default_batch_spawn_ms(),
            batch_cooldown_ms: default_batch_cooldown_ms(),
            hook_retry_attempts: default_hook_retries(),
            dead_session_threshold_secs: default_dead_session_secs(),
        }
    }
}

fn default_max_per_rig() -> u32 {
    1
}
fn default_wave_capacity() -> usize {
    5
}
fn default_inter_spawn_ms() -> u64 {
    500
}
fn default_batch_spawn_ms() -> u64 {
    2000
}
fn default_batch_cooldown_ms() -> u64 {
    5000
}
fn default_hook_retries() -> u32 {
    3
}
fn default_dead_session_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for status queries against external processes.
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
    /// Timeout for long operations (writes, clones, cooks).
    #[serde(default = "default_op_secs")]
    pub op_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            status_secs: default_status_secs(),
            op_secs: default_op_secs(),
        }
    }
}

fn default_status_secs() -> u64 {
    10
}
fn default_op_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = TownConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.dispatch.max_polecats, 0);
        assert_eq!(cfg.dispatch.wave_capacity_warning, 5);
        assert_eq!(cfg.timeouts.status_secs, 10);
        assert_eq!(cfg.timeouts.op_secs, 30);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join(".gastown");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("config.toml"), "[dispatch]\nmax_polecats = 4\n")
            .expect("write");

        let cfg = TownConfig::load(tmp.path()).expect("load");
        assert_eq!(cfg.dispatch.max_polecats, 4);
        assert_eq!(cfg.dispatch.inter_spawn_delay_ms, 500);
        assert_eq!(cfg.dispatch.batch_spawn_delay_ms, 2000);
    }
}
