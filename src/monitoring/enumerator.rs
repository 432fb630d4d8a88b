//! Process table enumeration via /proc
//!
//! The poller never touches `/proc` directly. It asks a [`ProcessEnumerator`]
//! for a [`ProcessTable`] once per tick and diffs it against what it already
//! knows. [`ScriptedEnumerator`] replays fixed tables for deterministic tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::utils;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    /// Process is running
    Running,
    /// Process is sleeping
    Sleeping,
    /// Uninterruptible disk sleep
    DiskSleep,
    /// Stopped or traced
    Stopped,
    /// Process is zombie
    Zombie,
    /// Process state is unknown
    Unknown,
}

impl ProcessState {
    /// Parse state from /proc stat state character
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' | 'I' => ProcessState::Sleeping,
            'D' => ProcessState::DiskSleep,
            'T' | 't' => ProcessState::Stopped,
            'Z' | 'X' => ProcessState::Zombie,
            _ => ProcessState::Unknown,
        }
    }
}

/// One row of the process table
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub name: String,
    pub state: ProcessState,
    /// utime + stime in milliseconds
    pub cpu_time_ms: u64,
    /// Resident set size in bytes
    pub rss_bytes: u64,
}

impl ProcessInfo {
    pub fn memory_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Recoverable per-tick sampling problems; logged, never fatal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringFault {
    /// Process disappeared between listing and reading
    ProcessVanished(i32),
    /// Process belongs to someone we may not inspect
    AccessDenied(i32),
    /// The whole process table could not be read
    EnumerationFailed(String),
    /// Connection tables could not be read
    NetworkUnavailable(String),
}

impl std::fmt::Display for MonitoringFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitoringFault::ProcessVanished(pid) => write!(f, "process {} vanished", pid),
            MonitoringFault::AccessDenied(pid) => write!(f, "access denied to process {}", pid),
            MonitoringFault::EnumerationFailed(msg) => write!(f, "process table: {}", msg),
            MonitoringFault::NetworkUnavailable(msg) => write!(f, "network table: {}", msg),
        }
    }
}

/// Point-in-time view of the system process table
#[derive(Debug, Clone)]
pub struct ProcessTable {
    pub captured_at: Instant,
    pub processes: BTreeMap<i32, ProcessInfo>,
    /// Rows that could not be read while building this table
    pub faults: Vec<MonitoringFault>,
}

impl ProcessTable {
    pub fn new(captured_at: Instant, rows: impl IntoIterator<Item = ProcessInfo>) -> Self {
        Self {
            captured_at,
            processes: rows.into_iter().map(|p| (p.pid, p)).collect(),
            faults: Vec::new(),
        }
    }

    pub fn pids(&self) -> BTreeSet<i32> {
        self.processes.keys().copied().collect()
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    /// Transitive children of `root` following ppid links (root excluded)
    pub fn descendants(&self, root: i32) -> BTreeSet<i32> {
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for info in self.processes.values() {
            children.entry(info.ppid).or_default().push(info.pid);
        }

        let mut found = BTreeSet::new();
        let mut queue: VecDeque<i32> = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).into_iter().flatten() {
                if child != root && found.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Members of process group `pgid`, whoever their parent is now
    pub fn group_members(&self, pgid: i32) -> BTreeSet<i32> {
        self.processes
            .values()
            .filter(|info| info.pgid == pgid)
            .map(|info| info.pid)
            .collect()
    }

    /// Everything spawned under `root`: its ppid descendants plus the rest
    /// of group `pgid`, which catches children reparented by a double fork
    pub fn tracked(&self, root: i32, pgid: i32) -> BTreeSet<i32> {
        let mut found = self.descendants(root);
        found.extend(self.group_members(pgid));
        found.remove(&root);
        found
    }
}

/// Capability to snapshot the OS process table
pub trait ProcessEnumerator: Send + Sync {
    /// Capture the current process table
    fn snapshot(&self) -> Result<ProcessTable>;

    /// Command line of `pid`, if still readable
    fn cmdline(&self, pid: i32) -> Option<String>;
}

/// Parse the contents of `/proc/<pid>/stat`
pub fn parse_stat(content: &str, clk_tck: u64, page_size: u64) -> Result<ProcessInfo> {
    // comm may contain spaces and parentheses, so split on the last ')'
    let open = content
        .find('(')
        .ok_or_else(|| SandboxError::ProcessMonitoring("Invalid /proc stat format".to_string()))?;
    let close = content
        .rfind(')')
        .ok_or_else(|| SandboxError::ProcessMonitoring("Invalid /proc stat format".to_string()))?;
    if close < open {
        return Err(SandboxError::ProcessMonitoring(
            "Invalid /proc stat format".to_string(),
        ));
    }

    let pid: i32 = content[..open]
        .trim()
        .parse()
        .map_err(|_| SandboxError::ProcessMonitoring("Invalid pid".to_string()))?;
    let name = content[open + 1..close].to_string();

    let parts: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if parts.len() < 22 {
        return Err(SandboxError::ProcessMonitoring(
            "Invalid /proc stat format".to_string(),
        ));
    }

    let field = |idx: usize, what: &str| -> Result<u64> {
        parts[idx]
            .parse()
            .map_err(|_| SandboxError::ProcessMonitoring(format!("Invalid {}", what)))
    };

    let state = ProcessState::from_char(parts[0].chars().next().unwrap_or('?'));
    let ppid: i32 = parts[1]
        .parse()
        .map_err(|_| SandboxError::ProcessMonitoring("Invalid ppid".to_string()))?;
    let pgid: i32 = parts[2]
        .parse()
        .map_err(|_| SandboxError::ProcessMonitoring("Invalid pgrp".to_string()))?;
    let utime = field(11, "utime")?;
    let stime = field(12, "stime")?;
    let rss = field(21, "rss")?;

    let cpu_time_ms = if clk_tck > 0 {
        ((utime + stime) * 1000) / clk_tck
    } else {
        0
    };

    Ok(ProcessInfo {
        pid,
        ppid,
        pgid,
        name,
        state,
        cpu_time_ms,
        rss_bytes: rss * page_size,
    })
}

/// Reads the live process table from procfs
#[derive(Debug, Clone)]
pub struct ProcfsEnumerator {
    root: PathBuf,
    clk_tck: u64,
    page_size: u64,
}

impl Default for ProcfsEnumerator {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clk_tck: utils::clock_ticks(),
            page_size: utils::page_size(),
        }
    }

    fn read_row(&self, pid: i32) -> std::result::Result<ProcessInfo, MonitoringFault> {
        let path = self.root.join(pid.to_string()).join("stat");
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => MonitoringFault::AccessDenied(pid),
            _ => MonitoringFault::ProcessVanished(pid),
        })?;
        // a pid recycled mid-read yields garbage; treat it as gone
        parse_stat(&content, self.clk_tck, self.page_size)
            .map_err(|_| MonitoringFault::ProcessVanished(pid))
    }
}

impl ProcessEnumerator for ProcfsEnumerator {
    fn snapshot(&self) -> Result<ProcessTable> {
        let captured_at = Instant::now();
        let entries = fs::read_dir(&self.root).map_err(|e| {
            SandboxError::ProcessMonitoring(format!(
                "Failed to read {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut table = ProcessTable::new(captured_at, Vec::new());
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };

            match self.read_row(pid) {
                Ok(info) => {
                    table.processes.insert(pid, info);
                }
                Err(fault) => table.faults.push(fault),
            }
        }

        debug!(
            "Enumerated {} processes ({} unreadable)",
            table.processes.len(),
            table.faults.len()
        );
        Ok(table)
    }

    fn cmdline(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        let joined = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    }
}

/// Replays a fixed sequence of process tables.
///
/// Each call to `snapshot` consumes one frame; the last frame repeats forever.
/// Capture instants advance by a fixed virtual step so CPU percentages are
/// reproducible.
#[derive(Debug)]
pub struct ScriptedEnumerator {
    frames: Mutex<VecDeque<Vec<ProcessInfo>>>,
    last: Mutex<Vec<ProcessInfo>>,
    cmdlines: HashMap<i32, String>,
    base: Instant,
    step: Duration,
    ticks: Mutex<u32>,
}

impl ScriptedEnumerator {
    pub fn new(frames: Vec<Vec<ProcessInfo>>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            last: Mutex::new(Vec::new()),
            cmdlines: HashMap::new(),
            base: Instant::now(),
            step: Duration::from_millis(500),
            ticks: Mutex::new(0),
        }
    }

    /// Virtual time between consecutive snapshots
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_cmdline(mut self, pid: i32, cmdline: &str) -> Self {
        self.cmdlines.insert(pid, cmdline.to_string());
        self
    }
}

impl ProcessEnumerator for ScriptedEnumerator {
    fn snapshot(&self) -> Result<ProcessTable> {
        let mut ticks = self.ticks.lock().unwrap_or_else(|p| p.into_inner());
        let captured_at = self.base + self.step * *ticks;
        *ticks += 1;

        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(frame) = self
            .frames
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
        {
            *last = frame;
        }
        Ok(ProcessTable::new(captured_at, last.clone()))
    }

    fn cmdline(&self, pid: i32) -> Option<String> {
        self.cmdlines.get(&pid).cloned()
    }
}
