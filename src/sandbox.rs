//! Sandbox aggregate: policy, workspace, lifecycle state and append-only logs

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::PreScan;
use crate::monitoring::anomaly::Anomaly;
use crate::monitoring::enumerator::ProcessState;
use crate::monitoring::network::Connection;
use crate::policy::ExecutionPolicy;
use crate::report::ReportStatus;
use crate::storage::Workspace;

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Workspace allocated, no process yet
    Created,
    /// Target launched and being polled
    Running,
    /// Target exited on its own
    Completed,
    /// Killed by timeout, stop request or strict anomaly
    Terminated,
    /// Target could not be launched
    Error,
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SandboxState::Completed | SandboxState::Terminated | SandboxState::Error
        )
    }
}

/// Exit status of the main process, captured once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Exit code, or the negated signal number when killed by a signal
    pub fn return_code(&self) -> Option<i32> {
        self.code.or(self.signal.map(|s| -s))
    }
}

/// One sampled process row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub timestamp: DateTime<Utc>,
    pub pid: i32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub status: ProcessState,
}

/// System-wide connection table for one tick; empty when sampling failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connections: Vec<Connection>,
}

/// Everything sampled during one poll tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryTick {
    pub timestamp: DateTime<Utc>,
    pub processes: Vec<ProcessSnapshot>,
    /// Live descendants of the main process (main excluded)
    pub tracked_children: usize,
    pub network: NetworkSnapshot,
}

impl TelemetryTick {
    /// Aggregate usage across all sampled rows of this tick
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.processes.iter().map(|p| p.cpu_percent).sum(),
            memory_mb: self.processes.iter().map(|p| p.memory_mb).sum(),
            process_count: self.tracked_children,
        }
    }
}

/// Aggregate usage evaluated by the anomaly detector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// Tracked descendant count (main excluded)
    pub process_count: usize,
}

/// Lifecycle event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    ProcessCreated { pid: i32, cmdline: Option<String> },
    ProcessExited { code: Option<i32>, signal: Option<i32> },
    TimeoutKill { elapsed_ms: u64 },
    StopRequested,
    Anomaly(Anomaly),
}

/// Timestamped lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Aggregate root for one bounded execution
#[derive(Debug)]
pub struct Sandbox {
    id: String,
    policy: ExecutionPolicy,
    workspace: Workspace,
    state: SandboxState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    main_pid: Option<i32>,
    process_group: Option<i32>,
    exit: Option<ExitOutcome>,
    events: Vec<Event>,
    telemetry: Vec<TelemetryTick>,
    pre_scan: Option<PreScan>,
    error: Option<String>,
    report_path: Option<PathBuf>,
    finalized: bool,
    last_stamp: Option<DateTime<Utc>>,
}

impl Sandbox {
    pub fn new(id: String, policy: ExecutionPolicy, workspace: Workspace) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            policy,
            workspace,
            state: SandboxState::Created,
            created_at,
            started_at: None,
            ended_at: None,
            main_pid: None,
            process_group: None,
            exit: None,
            events: Vec::new(),
            telemetry: Vec::new(),
            pre_scan: None,
            error: None,
            report_path: None,
            finalized: false,
            last_stamp: Some(created_at),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn main_pid(&self) -> Option<i32> {
        self.main_pid
    }

    pub fn process_group(&self) -> Option<i32> {
        self.process_group
    }

    pub fn exit(&self) -> Option<ExitOutcome> {
        self.exit
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn telemetry(&self) -> &[TelemetryTick] {
        &self.telemetry
    }

    pub fn pre_scan(&self) -> Option<&PreScan> {
        self.pre_scan.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn report_path(&self) -> Option<&PathBuf> {
        self.report_path.as_ref()
    }

    /// True once the terminal report is written and cleanup attempted
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Status a report built right now would carry
    pub fn report_status(&self) -> ReportStatus {
        match self.state {
            SandboxState::Created | SandboxState::Running => ReportStatus::Running,
            SandboxState::Completed => ReportStatus::Completed,
            SandboxState::Terminated => ReportStatus::Terminated,
            SandboxState::Error => ReportStatus::Error,
        }
    }

    /// Usage of the most recent tick
    pub fn latest_usage(&self) -> Option<ResourceUsage> {
        self.telemetry.last().map(TelemetryTick::usage)
    }

    /// Clamp `at` so log timestamps never go backwards
    pub fn stamp(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_stamp {
            Some(last) if last > at => last,
            _ => at,
        };
        self.last_stamp = Some(ts);
        ts
    }

    pub fn record_event(&mut self, at: DateTime<Utc>, kind: EventKind) {
        let timestamp = self.stamp(at);
        self.events.push(Event { timestamp, kind });
    }

    pub fn record_tick(&mut self, tick: TelemetryTick) {
        self.telemetry.push(tick);
    }

    pub fn attach_pre_scan(&mut self, scan: PreScan) {
        self.pre_scan = Some(scan);
    }

    /// CREATED → RUNNING
    pub fn mark_running(&mut self, pid: i32, pgid: i32, at: DateTime<Utc>) {
        let at = self.stamp(at);
        self.state = SandboxState::Running;
        self.main_pid = Some(pid);
        self.process_group = Some(pgid);
        self.started_at = Some(at);
    }

    /// Enter a terminal state; ignored when already terminal
    pub fn finish(&mut self, state: SandboxState, exit: Option<ExitOutcome>, at: DateTime<Utc>) {
        if self.state.is_terminal() || !state.is_terminal() {
            return;
        }
        let at = self.stamp(at);
        self.state = state;
        if self.exit.is_none() {
            self.exit = exit;
        }
        self.ended_at = Some(at);
    }

    /// CREATED → ERROR after a spawn failure
    pub fn fail_launch(&mut self, reason: String, at: DateTime<Utc>) {
        self.error = Some(reason);
        self.finish(SandboxState::Error, None, at);
    }

    pub fn mark_finalized(&mut self, report_path: Option<PathBuf>) {
        self.report_path = report_path;
        self.finalized = true;
    }
}

/// Registry slot: the sandbox behind a mutex plus the cooperative stop flag
#[derive(Debug)]
pub struct SandboxSlot {
    inner: Mutex<Sandbox>,
    changed: Condvar,
    stop: AtomicBool,
}

impl SandboxSlot {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            inner: Mutex::new(sandbox),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Sandbox> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Ask the poller to stop at its next tick
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wake everyone waiting for a state change
    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block until the sandbox is finalized or `timeout` elapses
    pub fn wait_finalized(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        while !guard.is_finalized() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            guard = match self.changed.wait_timeout(guard, remaining) {
                Ok((g, _)) => g,
                Err(poison) => poison.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn sandbox(tmp: &tempfile::TempDir) -> Sandbox {
        let ws = Workspace::allocate(tmp.path(), "sb1").unwrap();
        Sandbox::new("sb1".to_string(), ExecutionPolicy::default(), ws)
    }

    #[test]
    fn new_sandbox_is_created_and_reports_running() {
        let tmp = tempdir().unwrap();
        let sb = sandbox(&tmp);
        assert_eq!(sb.state(), SandboxState::Created);
        assert_eq!(sb.report_status(), ReportStatus::Running);
        assert!(sb.events().is_empty());
        assert!(sb.latest_usage().is_none());
    }

    #[test]
    fn stamps_never_go_backwards() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        let later = Utc::now() + chrono::Duration::seconds(10);
        let first = sb.stamp(later);
        let second = sb.stamp(later - chrono::Duration::seconds(5));
        assert_eq!(first, later);
        assert_eq!(second, later);
    }

    #[test]
    fn finish_is_applied_once() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(10, 10, Utc::now());
        let exit = ExitOutcome {
            code: Some(0),
            signal: None,
        };
        sb.finish(SandboxState::Completed, Some(exit), Utc::now());
        sb.finish(SandboxState::Terminated, None, Utc::now());

        assert_eq!(sb.state(), SandboxState::Completed);
        assert_eq!(sb.exit(), Some(exit));
        assert!(sb.ended_at().unwrap() >= sb.started_at().unwrap());
    }

    #[test]
    fn fail_launch_records_reason() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.fail_launch("missing binary".to_string(), Utc::now());
        assert_eq!(sb.state(), SandboxState::Error);
        assert_eq!(sb.error(), Some("missing binary"));
        assert!(sb.exit().is_none());
    }

    #[test]
    fn return_code_prefers_exit_code_then_signal() {
        let exited = ExitOutcome {
            code: Some(3),
            signal: None,
        };
        let killed = ExitOutcome {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exited.return_code(), Some(3));
        assert_eq!(killed.return_code(), Some(-9));
    }

    #[test]
    fn tick_usage_sums_rows() {
        let now = Utc::now();
        let row = |pid, cpu, mem| ProcessSnapshot {
            timestamp: now,
            pid,
            name: "x".to_string(),
            cpu_percent: cpu,
            memory_mb: mem,
            status: ProcessState::Running,
        };
        let tick = TelemetryTick {
            timestamp: now,
            processes: vec![row(1, 10.0, 5.0), row(2, 2.5, 1.5)],
            tracked_children: 1,
            network: NetworkSnapshot {
                timestamp: now,
                connections: Vec::new(),
            },
        };
        let usage = tick.usage();
        assert_eq!(usage.cpu_percent, 12.5);
        assert_eq!(usage.memory_mb, 6.5);
        assert_eq!(usage.process_count, 1);
    }

    #[test]
    fn wait_finalized_wakes_on_notify() {
        let tmp = tempdir().unwrap();
        let slot = Arc::new(SandboxSlot::new(sandbox(&tmp)));
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_finalized(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        slot.lock().mark_finalized(None);
        slot.notify();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_finalized_times_out() {
        let tmp = tempdir().unwrap();
        let slot = SandboxSlot::new(sandbox(&tmp));
        assert!(!slot.wait_finalized(Duration::from_millis(20)));
    }

    #[test]
    fn stop_flag_is_sticky() {
        let tmp = tempdir().unwrap();
        let slot = SandboxSlot::new(sandbox(&tmp));
        assert!(!slot.stop_requested());
        slot.request_stop();
        assert!(slot.stop_requested());
    }
}
