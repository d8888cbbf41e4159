use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock;

const CONFIG_ENV: &str = "AGENT_DECK_CONFIG";
const APP_DIR: &str = "agent-deck";

/// Runtime configuration, read once at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to tmux binary
    pub tmux_path: String,
    /// Identifies this instance in the scan lease; generated when unset
    pub instance_id: Option<String>,
    /// Workspace list written by the persistence layer
    pub registry_path: Option<PathBuf>,
    /// Name prefix of every session this application creates
    pub session_prefix: String,
    pub scan_interval_ms: u64,
    pub orphan_gc_interval_ms: u64,
    pub stale_gc_interval_ms: u64,
    pub registry_refresh_ms: u64,
    pub activity: ActivityConfig,
    pub lease: LeaseConfig,
    pub gc: GcConfig,
}

/// Windows and hysteresis bounds for activity detection (all times in ms)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// A last-output tag younger than this counts as live output
    pub output_window_ms: i64,
    /// Output this soon after input is indistinguishable from keystroke echo
    pub echo_window_ms: i64,
    /// Skip pane capture while the user typed this recently
    pub input_suppress_window_ms: i64,
    /// How long a session stays active after its last qualifying change
    pub hold_duration_ms: i64,
    /// Window activity newer than this makes a pane worth capturing
    pub window_recent_ms: i64,
    pub capture_lines: usize,
    pub threshold: u8,
    pub score_max: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub ttl_ms: i64,
    /// Followers ignore a published snapshot older than this
    pub snapshot_max_age_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub grace_period_ms: i64,
    /// Candidate count above which the orphan pass also sweeps other instances' sessions
    pub global_sweep_threshold: usize,
    /// Only consider sessions tagged with this instance's id
    pub scope_to_instance: bool,
    pub stale_after_ms: i64,
    /// Extra leeway for detached sessions whose pane is still alive
    pub live_pane_grace_ms: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            instance_id: None,
            registry_path: None,
            session_prefix: "agent-deck-".to_string(),
            scan_interval_ms: 2_000,
            orphan_gc_interval_ms: 60_000,
            stale_gc_interval_ms: 300_000,
            registry_refresh_ms: 5_000,
            activity: ActivityConfig::default(),
            lease: LeaseConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            output_window_ms: 3_000,
            echo_window_ms: 400,
            input_suppress_window_ms: 1_500,
            hold_duration_ms: 6_000,
            window_recent_ms: 3_000,
            capture_lines: 40,
            threshold: 3,
            score_max: 6,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 6_000,
            snapshot_max_age_ms: 6_000,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        const HOUR_MS: i64 = 60 * 60 * 1000;
        Self {
            grace_period_ms: 30_000,
            global_sweep_threshold: 32,
            scope_to_instance: false,
            stale_after_ms: 6 * HOUR_MS,
            live_pane_grace_ms: 18 * HOUR_MS,
        }
    }
}

impl Config {
    /// Load from `$AGENT_DECK_CONFIG` or the user config dir; a missing file means defaults
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => match dirs::config_dir() {
                Some(dir) => dir.join(APP_DIR).join("config.json"),
                None => return Ok(Self::default()),
            },
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config {}", path.display()))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let activity = &self.activity;
        if activity.threshold == 0 || activity.threshold > activity.score_max {
            bail!(
                "activity.threshold must be in 1..=score_max (got {} with score_max {})",
                activity.threshold,
                activity.score_max
            );
        }
        if activity.capture_lines == 0 {
            bail!("activity.capture_lines must be positive");
        }
        if self.lease.ttl_ms <= 0 || self.lease.snapshot_max_age_ms <= 0 {
            bail!("lease.ttl_ms and lease.snapshot_max_age_ms must be positive");
        }
        if self.scan_interval_ms == 0
            || self.orphan_gc_interval_ms == 0
            || self.stale_gc_interval_ms == 0
            || self.registry_refresh_ms == 0
        {
            bail!("timer intervals must be positive");
        }
        if self.gc.grace_period_ms < 0 || self.gc.stale_after_ms < 0 {
            bail!("gc windows must not be negative");
        }
        Ok(())
    }

    /// The configured instance id, or one unique to this process
    pub fn resolved_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("pid-{}-{}", std::process::id(), clock::now_ms()))
    }

    pub fn resolved_registry_path(&self) -> Option<PathBuf> {
        self.registry_path
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join(APP_DIR).join("workspaces.json")))
    }

    /// Log file under the data dir, or the temp dir when there is none
    pub fn log_path(&self) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
            .join("agent-deck.log")
    }
}
