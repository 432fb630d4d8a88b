//! Manager configuration

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;

use crate::collaborators::ThreatLevel;

/// Default sampling interval of the telemetry loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default grace window between TERM and KILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Registry-wide settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root for persisted reports and quarantine
    pub storage_dir: PathBuf,
    /// Parent directory of per-sandbox workspaces
    pub workspace_dir: PathBuf,
    /// Telemetry sampling interval
    pub poll_interval: Duration,
    /// Grace window given to the process tree after TERM
    pub grace_period: Duration,
    /// Pre-scan results strictly above this level are rejected
    pub threat_threshold: ThreatLevel,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./sandbox-reports"),
            workspace_dir: env::temp_dir().join("safebox-sandboxes"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            threat_threshold: ThreatLevel::Medium,
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `SAFEBOX_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env::var_os("SAFEBOX_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env::var_os("SAFEBOX_WORKSPACE_DIR") {
            config.workspace_dir = PathBuf::from(dir);
        }
        if let Some(ms) = millis_from_env("SAFEBOX_POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = millis_from_env("SAFEBOX_GRACE_PERIOD_MS") {
            config.grace_period = ms;
        }

        config
    }

    /// Set storage directory
    pub fn storage_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.storage_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set workspace parent directory
    pub fn workspace_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.workspace_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set sampling interval (clamped to at least 10ms)
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Set TERM-to-KILL grace window
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn threat_threshold(mut self, level: ThreatLevel) -> Self {
        self.threat_threshold = level;
        self
    }

    /// Directory holding persisted reports
    pub fn reports_dir(&self) -> PathBuf {
        self.storage_dir.join("reports")
    }

    /// Directory holding quarantined files
    pub fn quarantine_dir(&self) -> PathBuf {
        self.storage_dir.join("quarantine")
    }
}

fn millis_from_env(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}
