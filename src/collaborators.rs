//! Contracts for the engine's external collaborators
//!
//! The content scanner and the virtualization backend are opaque services
//! plugged in by the embedding application. Quarantine ships with a plain
//! filesystem implementation.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, SandboxError};

/// Scanner verdict, ordered from harmless to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatLevel::Safe => "safe",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ThreatLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(ThreatLevel::Safe),
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(SandboxError::InvalidConfig(format!(
                "Unknown threat level: {}",
                other
            ))),
        }
    }
}

/// Result of one content scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub threat_level: ThreatLevel,
    /// Scanner-specific risk score
    pub risk: f64,
    pub detections: Vec<String>,
}

/// Pre-execution scan attached to the report as advisory metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreScan {
    pub filename: String,
    /// Hex SHA-256 of the target file
    pub hash: String,
    pub size_kb: f64,
    pub result: ScanResult,
}

/// Opaque content/heuristic threat scanner
pub trait ContentScanner: Send + Sync {
    fn scan(&self, filename: &str, hash: &str) -> Result<ScanResult>;
}

/// Destination for suspicious files
pub trait QuarantineStore: Send + Sync {
    /// Move `path` out of reach and return where it ended up
    fn quarantine(&self, path: &Path, reason: &str) -> Result<PathBuf>;
}

#[derive(Debug, Serialize)]
struct QuarantineEntry<'a> {
    timestamp: String,
    file: &'a str,
    path: String,
    reason: &'a str,
}

/// Moves files under `<dir>/<uuid>_<name>` and appends to `<dir>/quarantine.log`
#[derive(Debug, Clone)]
pub struct FsQuarantine {
    dir: PathBuf,
}

impl FsQuarantine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("quarantine.log")
    }
}

impl QuarantineStore for FsQuarantine {
    fn quarantine(&self, path: &Path, reason: &str) -> Result<PathBuf> {
        if !path.is_file() {
            return Err(SandboxError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", path.display()),
            )));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(format!("{}_{}", Uuid::new_v4(), filename));

        // rename fails across filesystems
        if fs::rename(path, &target).is_err() {
            fs::copy(path, &target)?;
            fs::remove_file(path)?;
        }

        let entry = QuarantineEntry {
            timestamp: Utc::now().to_rfc3339(),
            file: &filename,
            path: target.display().to_string(),
            reason,
        };
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        writeln!(log, "{}", serde_json::to_string(&entry)?)?;

        info!("Quarantined {} as {} ({})", filename, target.display(), reason);
        Ok(target)
    }
}

/// Output of a command run through the virtualization backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmExecution {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Alternate execution backend for when process-level isolation is not enough
pub trait VirtualizationBackend: Send + Sync {
    fn execute(&self, vm_id: &str, command: &str, timeout: Duration) -> Result<VmExecution>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn threat_levels_are_ordered() {
        assert!(ThreatLevel::Safe < ThreatLevel::Low);
        assert!(ThreatLevel::High > ThreatLevel::Medium);
        assert_eq!(ThreatLevel::Critical.max(ThreatLevel::Low), ThreatLevel::Critical);
    }

    #[test]
    fn threat_level_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<ThreatLevel>().unwrap(), ThreatLevel::High);
        assert_eq!(ThreatLevel::Medium.to_string(), "medium");
        assert!("severe".parse::<ThreatLevel>().is_err());
    }

    #[test]
    fn quarantine_moves_file_and_logs() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("payload.bin");
        fs::write(&src, b"MZ\x90\x00").unwrap();

        let store = FsQuarantine::new(tmp.path().join("quarantine"));
        let moved = store.quarantine(&src, "high risk").unwrap();

        assert!(!src.exists());
        assert!(moved.starts_with(store.dir()));
        assert!(
            moved
                .file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("_payload.bin")
        );
        assert_eq!(fs::read(&moved).unwrap(), b"MZ\x90\x00");

        let log = fs::read_to_string(store.log_path()).unwrap();
        let entry: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(entry["file"], "payload.bin");
        assert_eq!(entry["reason"], "high risk");
    }

    #[test]
    fn quarantine_missing_file_fails() {
        let tmp = tempdir().unwrap();
        let store = FsQuarantine::new(tmp.path());
        assert!(store.quarantine(&tmp.path().join("nope"), "x").is_err());
    }
}
