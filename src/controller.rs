//! Sandbox registry: owns every sandbox and serializes their lifecycle

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::collaborators::{
    ContentScanner, FsQuarantine, PreScan, QuarantineStore, VirtualizationBackend, VmExecution,
};
use crate::config::ManagerConfig;
use crate::errors::{Result, SandboxError};
use crate::execution::{KILL_SETTLE_TIMEOUT, ProcessConfig, ProcessSupervisor, SignalKind, signal_group};
use crate::monitoring::enumerator::{ProcessEnumerator, ProcfsEnumerator};
use crate::monitoring::network::{NetworkProbe, ProcNetProbe};
use crate::monitoring::poller::TelemetryPoller;
use crate::policy::ExecutionPolicy;
use crate::report::{Report, ReportBuilder};
use crate::sandbox::{EventKind, ResourceUsage, Sandbox, SandboxSlot, SandboxState};
use crate::storage::Workspace;
use crate::utils;

/// Attempts at drawing a fresh generated id before giving up
const ID_ATTEMPTS: usize = 8;

/// Listing row for one tracked sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxSummary {
    pub id: String,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<i32>,
    pub workspace: PathBuf,
    pub policy: ExecutionPolicy,
    /// Usage from the latest sample, `None` before the first one
    pub usage: Option<ResourceUsage>,
}

/// The Manager: single owner of the id → sandbox mapping
pub struct SandboxRegistry {
    config: ManagerConfig,
    slots: RwLock<HashMap<String, Arc<SandboxSlot>>>,
    enumerator: Arc<dyn ProcessEnumerator>,
    network: Arc<dyn NetworkProbe>,
    scanner: Option<Arc<dyn ContentScanner>>,
    quarantine: Arc<dyn QuarantineStore>,
    vm_backend: Option<Arc<dyn VirtualizationBackend>>,
}

impl SandboxRegistry {
    /// Registry sampling the live `/proc`, with filesystem quarantine
    pub fn new(config: ManagerConfig) -> Self {
        let quarantine = Arc::new(FsQuarantine::new(config.quarantine_dir()));
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
            enumerator: Arc::new(ProcfsEnumerator::default()),
            network: Arc::new(ProcNetProbe::default()),
            scanner: None,
            quarantine,
            vm_backend: None,
        }
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_network_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.network = probe;
        self
    }

    /// Consult `scanner` before every execution
    pub fn with_scanner(mut self, scanner: Arc<dyn ContentScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_quarantine(mut self, store: Arc<dyn QuarantineStore>) -> Self {
        self.quarantine = store;
        self
    }

    pub fn with_vm_backend(mut self, backend: Arc<dyn VirtualizationBackend>) -> Self {
        self.vm_backend = Some(backend);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SandboxSlot>>> {
        self.slots.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SandboxSlot>>> {
        self.slots.write().unwrap_or_else(|poison| poison.into_inner())
    }

    fn slot(&self, id: &str) -> Result<Arc<SandboxSlot>> {
        self.read_slots()
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Allocate a sandbox under a fresh generated id
    pub fn create(&self, policy: ExecutionPolicy) -> Result<String> {
        policy.validate()?;
        let mut slots = self.write_slots();

        for _ in 0..ID_ATTEMPTS {
            let id = generate_id();
            if slots.contains_key(&id) {
                debug!("Generated id {} already registered, retrying", id);
                continue;
            }
            match Workspace::allocate(&self.config.workspace_dir, &id) {
                Ok(workspace) => {
                    info!("Created sandbox {} at {}", id, workspace.root().display());
                    let sandbox = Sandbox::new(id.clone(), policy, workspace);
                    slots.insert(id.clone(), Arc::new(SandboxSlot::new(sandbox)));
                    return Ok(id);
                }
                // stale directory from an earlier process
                Err(SandboxError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(SandboxError::IdCollision(format!(
            "no free id after {} attempts",
            ID_ATTEMPTS
        )))
    }

    /// Allocate a sandbox under a caller-chosen id
    pub fn create_with_id(&self, id: &str, policy: ExecutionPolicy) -> Result<String> {
        policy.validate()?;
        let mut slots = self.write_slots();
        if slots.contains_key(id) {
            return Err(SandboxError::IdCollision(id.to_string()));
        }

        let workspace = match Workspace::allocate(&self.config.workspace_dir, id) {
            Ok(workspace) => workspace,
            Err(SandboxError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(SandboxError::IdCollision(id.to_string()));
            }
            Err(e) => return Err(e),
        };

        info!("Created sandbox {} at {}", id, workspace.root().display());
        let sandbox = Sandbox::new(id.to_string(), policy, workspace);
        slots.insert(id.to_string(), Arc::new(SandboxSlot::new(sandbox)));
        Ok(id.to_string())
    }

    /// Run `target` in sandbox `id` to completion and return the final report
    pub fn execute(&self, id: &str, target: &str, args: &[String]) -> Result<Report> {
        self.execute_with_env(id, target, args, &[])
    }

    /// Like [`execute`](Self::execute) with extra environment variables.
    /// The sandbox overlay (`SANDBOX_ID`, `HOME`, ...) always wins.
    pub fn execute_with_env(
        &self,
        id: &str,
        target: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Report> {
        let slot = self.slot(id)?;
        ensure_executable(&slot.lock())?;

        let program = resolve_target(target);
        let pre_scan = match &self.scanner {
            Some(scanner) => self.scan_with(scanner.as_ref(), &program)?,
            None => None,
        };
        if let Some(scan) = &pre_scan {
            if scan.result.threat_level > self.config.threat_threshold {
                warn!(
                    "Rejected {} for sandbox {}: threat level {}",
                    scan.filename, id, scan.result.threat_level
                );
                return Err(SandboxError::PolicyRejected(format!(
                    "{} scored {} (threshold {})",
                    scan.filename, scan.result.threat_level, self.config.threat_threshold
                )));
            }
        }

        let baseline = match self.enumerator.snapshot() {
            Ok(table) => Some(table.pids()),
            Err(e) => {
                warn!("No process baseline for sandbox {}: {}", id, e);
                None
            }
        };

        let supervisor = {
            let mut sandbox = slot.lock();
            ensure_executable(&sandbox)?;
            if let Some(scan) = pre_scan {
                sandbox.attach_pre_scan(scan);
            }

            let config = launch_config(&sandbox, &program, args, env);
            match ProcessSupervisor::launch(&config) {
                Ok(supervisor) => {
                    sandbox.mark_running(supervisor.pid(), supervisor.pgid(), Utc::now());
                    info!(
                        "Sandbox {} running {} as pid {}",
                        id,
                        supervisor.program(),
                        supervisor.pid()
                    );
                    supervisor
                }
                Err(e) => {
                    warn!("Sandbox {}: {}", id, e);
                    sandbox.fail_launch(e.to_string(), Utc::now());
                    drop(sandbox);
                    self.finalize(&slot);
                    return Err(e);
                }
            }
        };
        slot.notify();

        TelemetryPoller::new(
            &slot,
            supervisor,
            self.enumerator.as_ref(),
            self.network.as_ref(),
            baseline,
        )
        .interval(self.config.poll_interval)
        .grace_period(self.config.grace_period)
        .run();

        Ok(self.finalize(&slot))
    }

    /// Terminate sandbox `id`; a no-op success once it is terminal
    pub fn stop(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut sandbox = slot.lock();

        match sandbox.state() {
            SandboxState::Created => {
                info!("Stopping sandbox {} before launch", id);
                sandbox.record_event(Utc::now(), EventKind::StopRequested);
                sandbox.finish(SandboxState::Terminated, None, Utc::now());
                drop(sandbox);
                self.finalize(&slot);
            }
            SandboxState::Running => {
                let pgid = sandbox.process_group();
                drop(sandbox);
                info!("Stopping sandbox {}", id);
                slot.request_stop();

                if !slot.wait_finalized(self.stop_timeout()) {
                    warn!("Sandbox {} did not wind down in time, killing group", id);
                    if let Some(pgid) = pgid {
                        if let Err(e) = signal_group(pgid, SignalKind::Kill) {
                            warn!("Sandbox {}: {}", id, e);
                        }
                    }
                    if !slot.wait_finalized(KILL_SETTLE_TIMEOUT + self.config.poll_interval * 2) {
                        warn!("Sandbox {} still not finalized after SIGKILL", id);
                    }
                }
            }
            _ if !sandbox.is_finalized() => {
                drop(sandbox);
                slot.wait_finalized(self.stop_timeout());
            }
            _ => {
                debug!("Sandbox {} already finished", id);
            }
        }

        if let Err(e) = slot.lock().workspace().remove() {
            warn!("Failed to remove workspace of sandbox {}: {}", id, e);
        }
        Ok(())
    }

    /// Stop sandbox `id` and forget it
    pub fn remove(&self, id: &str) -> Result<()> {
        self.stop(id)?;
        self.write_slots().remove(id);
        info!("Removed sandbox {}", id);
        Ok(())
    }

    /// Current report; provisional while the sandbox is running
    pub fn get_report(&self, id: &str) -> Result<Report> {
        let slot = self.slot(id)?;
        let sandbox = slot.lock();
        Ok(ReportBuilder::build(
            &sandbox,
            sandbox.report_status(),
            Utc::now(),
        ))
    }

    /// Summaries of every tracked sandbox, ordered by id
    pub fn list(&self) -> Vec<SandboxSummary> {
        let slots: Vec<Arc<SandboxSlot>> = self.read_slots().values().cloned().collect();
        let mut summaries: Vec<SandboxSummary> = slots
            .iter()
            .map(|slot| {
                let sandbox = slot.lock();
                SandboxSummary {
                    id: sandbox.id().to_string(),
                    state: sandbox.state(),
                    created_at: sandbox.created_at(),
                    started_at: sandbox.started_at(),
                    pid: sandbox.main_pid(),
                    workspace: sandbox.workspace().root().to_path_buf(),
                    policy: sandbox.policy().clone(),
                    usage: sandbox.latest_usage(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Hash `target` and run it through the configured scanner
    pub fn pre_scan(&self, target: &str) -> Result<PreScan> {
        let scanner = self
            .scanner
            .as_ref()
            .ok_or_else(|| SandboxError::Scanner("No content scanner configured".to_string()))?;
        let program = resolve_target(target);
        self.scan_with(scanner.as_ref(), &program)?.ok_or_else(|| {
            SandboxError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", target),
            ))
        })
    }

    /// Move a suspicious file into quarantine
    pub fn quarantine(&self, path: &Path, reason: &str) -> Result<PathBuf> {
        self.quarantine.quarantine(path, reason)
    }

    /// Delegate a command to the virtualization backend
    pub fn execute_in_vm(&self, vm_id: &str, command: &str, timeout: Duration) -> Result<VmExecution> {
        let backend = self.vm_backend.as_ref().ok_or_else(|| {
            SandboxError::Backend("No virtualization backend configured".to_string())
        })?;
        info!("Executing in VM {}: {}", vm_id, command);
        backend.execute(vm_id, command, timeout)
    }

    /// `None` when the target cannot be found on disk; the launch will
    /// report that properly.
    fn scan_with(&self, scanner: &dyn ContentScanner, program: &str) -> Result<Option<PreScan>> {
        let Some(path) = utils::resolve_program(program) else {
            warn!("Cannot pre-scan {}: not found", program);
            return Ok(None);
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        let hash = utils::sha256_file(&path)?;
        let size_kb = fs::metadata(&path)?.len() as f64 / 1024.0;
        let result = scanner.scan(&filename, &hash)?;
        debug!("Pre-scan of {}: {:?}", filename, result);

        Ok(Some(PreScan {
            filename,
            hash,
            size_kb,
            result,
        }))
    }

    /// Build, persist and clean up exactly once per terminal sandbox
    fn finalize(&self, slot: &SandboxSlot) -> Report {
        let mut sandbox = slot.lock();
        let report = ReportBuilder::build(&sandbox, sandbox.report_status(), Utc::now());
        if sandbox.is_finalized() {
            return report;
        }

        let path = match report.persist(&self.config.reports_dir()) {
            Ok(path) => {
                info!("Report for {} written to {}", sandbox.id(), path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to persist report for {}: {}", sandbox.id(), e);
                None
            }
        };
        if let Err(e) = sandbox.workspace().remove() {
            warn!("Failed to remove workspace of sandbox {}: {}", sandbox.id(), e);
        }

        sandbox.mark_finalized(path);
        drop(sandbox);
        slot.notify();
        report
    }

    /// Upper bound for a running sandbox to notice a stop and tear down
    fn stop_timeout(&self) -> Duration {
        self.config.poll_interval * 2 + self.config.grace_period + KILL_SETTLE_TIMEOUT
    }
}

impl Drop for SandboxRegistry {
    fn drop(&mut self) {
        for slot in self.read_slots().values() {
            let sandbox = slot.lock();
            if sandbox.is_finalized() {
                continue;
            }
            match (sandbox.state(), sandbox.process_group()) {
                (SandboxState::Running, Some(pgid)) => {
                    warn!("Killing sandbox {} on registry shutdown", sandbox.id());
                    let _ = signal_group(pgid, SignalKind::Kill);
                }
                (SandboxState::Created, _) => {
                    let _ = sandbox.workspace().remove();
                }
                _ => {}
            }
        }
    }
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn ensure_executable(sandbox: &Sandbox) -> Result<()> {
    match sandbox.state() {
        SandboxState::Created => Ok(()),
        SandboxState::Running => Err(SandboxError::AlreadyRunning),
        _ => Err(SandboxError::AlreadyFinished(sandbox.id().to_string())),
    }
}

/// Paths with a `/` are made absolute since the target runs from its workspace
fn resolve_target(target: &str) -> String {
    if target.contains('/') {
        if let Ok(path) = fs::canonicalize(target) {
            return path.to_string_lossy().into_owned();
        }
    }
    target.to_string()
}

fn launch_config(
    sandbox: &Sandbox,
    program: &str,
    args: &[String],
    extra_env: &[(String, String)],
) -> ProcessConfig {
    let workspace = sandbox.workspace();
    let root = fs::canonicalize(workspace.root()).unwrap_or_else(|_| workspace.root().to_path_buf());
    let root_str = root.to_string_lossy().into_owned();
    let tmp = fs::canonicalize(workspace.tmp_dir()).unwrap_or_else(|_| workspace.tmp_dir());

    let mut env: Vec<(String, String)> = extra_env.to_vec();
    env.extend([
        ("SANDBOX_ID".to_string(), sandbox.id().to_string()),
        ("SANDBOX_ROOT".to_string(), root_str.clone()),
        ("HOME".to_string(), root_str),
        ("TMPDIR".to_string(), tmp.to_string_lossy().into_owned()),
    ]);

    ProcessConfig {
        program: program.to_string(),
        args: args.to_vec(),
        env,
        cwd: Some(root),
        stdout: Some(workspace.logs_dir().join("stdout.log")),
        stderr: Some(workspace.logs_dir().join("stderr.log")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ScanResult, ThreatLevel};
    use crate::report::ReportStatus;
    use crate::test_support::serial_guard;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    fn registry() -> (TempDir, SandboxRegistry) {
        let tmp = tempdir().unwrap();
        let config = ManagerConfig::default()
            .storage_dir(tmp.path().join("storage"))
            .workspace_dir(tmp.path().join("workspaces"))
            .poll_interval(Duration::from_millis(20))
            .grace_period(Duration::from_millis(500));
        (tmp, SandboxRegistry::new(config))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn reports_in(registry: &SandboxRegistry) -> Vec<PathBuf> {
        fs::read_dir(registry.config().reports_dir())
            .map(|entries| entries.flatten().map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    struct FixedScanner {
        level: ThreatLevel,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl FixedScanner {
        fn new(level: ThreatLevel) -> Self {
            Self {
                level,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ContentScanner for FixedScanner {
        fn scan(&self, filename: &str, hash: &str) -> Result<ScanResult> {
            self.seen
                .lock()
                .unwrap()
                .push((filename.to_string(), hash.to_string()));
            Ok(ScanResult {
                threat_level: self.level,
                risk: 0.5,
                detections: vec!["heuristic".to_string()],
            })
        }
    }

    struct EchoBackend;

    impl VirtualizationBackend for EchoBackend {
        fn execute(&self, vm_id: &str, command: &str, timeout: Duration) -> Result<VmExecution> {
            Ok(VmExecution {
                exit_code: 0,
                stdout: format!("{}:{}", vm_id, command),
                stderr: String::new(),
                duration: timeout / 2,
            })
        }
    }

    #[test]
    fn create_then_report_is_running() {
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        assert_eq!(id.len(), 8);

        let report = registry.get_report(&id).unwrap();
        assert_eq!(report.status, ReportStatus::Running);
        assert_eq!(report.sandbox_id, id);
        assert_eq!(report.return_code, None);
    }

    #[test]
    fn create_rejects_invalid_policy() {
        let (_tmp, registry) = registry();
        let policy = ExecutionPolicy {
            max_duration_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            registry.create(policy),
            Err(SandboxError::InvalidConfig(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn create_with_id_refuses_duplicates() {
        let (_tmp, registry) = registry();
        registry
            .create_with_id("fixed", ExecutionPolicy::default())
            .unwrap();
        assert!(matches!(
            registry.create_with_id("fixed", ExecutionPolicy::default()),
            Err(SandboxError::IdCollision(_))
        ));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_tmp, registry) = registry();
        assert!(matches!(
            registry.execute("nope", "/bin/true", &[]),
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(registry.stop("nope"), Err(SandboxError::NotFound(_))));
        assert!(matches!(
            registry.get_report("nope"),
            Err(SandboxError::NotFound(_))
        ));
    }

    #[test]
    fn execute_runs_in_workspace_with_overlay() {
        let _guard = serial_guard();
        let (tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        let workspace = registry.list()[0].workspace.clone();
        let out = tmp.path().join("env.txt");

        let report = registry
            .execute_with_env(
                &id,
                "/bin/sh",
                &sh("echo \"$SANDBOX_ID|$(pwd)|$HOME|$TMPDIR|$(test -d \"$TMPDIR\" && echo dir)\" > \"$OUT\""),
                &[("OUT".to_string(), out.display().to_string())],
            )
            .unwrap();

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.return_code, Some(0));

        let root = fs::canonicalize(tmp.path().join("workspaces")).unwrap().join(&id);
        let line = fs::read_to_string(&out).unwrap();
        let fields: Vec<&str> = line.trim().split('|').collect();
        assert_eq!(fields[0], id);
        assert_eq!(fields[1], root.display().to_string());
        assert_eq!(fields[2], root.display().to_string());
        assert_eq!(fields[3], root.join("tmp").display().to_string());
        assert_eq!(fields[4], "dir");

        assert!(!workspace.exists());
        assert_eq!(reports_in(&registry).len(), 1);
    }

    #[test]
    fn list_carries_latest_usage() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        assert_eq!(registry.list()[0].usage, None);

        std::thread::scope(|scope| {
            let runner = scope.spawn(|| registry.execute(&id, "/bin/sh", &sh("sleep 1 & wait")));

            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let usage = loop {
                let summary = registry.list().remove(0);
                if let Some(usage) = summary.usage {
                    if usage.process_count == 1 {
                        break usage;
                    }
                }
                assert!(std::time::Instant::now() < deadline, "no sample listed");
                std::thread::sleep(Duration::from_millis(10));
            };
            assert!(usage.memory_mb > 0.0);
            assert!(usage.cpu_percent >= 0.0);

            let report = runner.join().unwrap().unwrap();
            assert_eq!(report.status, ReportStatus::Completed);
        });

        let json = serde_json::to_value(&registry.list()[0]).unwrap();
        assert!(json["usage"]["memory_mb"].is_number());
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        let report = registry.execute(&id, "sh", &sh("exit 3")).unwrap();
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.return_code, Some(3));
    }

    #[test]
    fn launch_failure_is_terminal_error() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();

        let err = registry
            .execute(&id, "/nonexistent/safebox-target", &[])
            .unwrap_err();
        assert!(matches!(err, SandboxError::Launch { .. }));

        let report = registry.get_report(&id).unwrap();
        assert_eq!(report.status, ReportStatus::Error);
        assert!(report.error.is_some());
        assert!(report.events.is_empty());
        assert_eq!(report.total_processes, 0);
        assert_eq!(registry.list()[0].state, SandboxState::Error);
        assert!(!registry.list()[0].workspace.exists());
        assert_eq!(reports_in(&registry).len(), 1);
    }

    #[test]
    fn finished_sandbox_cannot_run_again() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        registry.execute(&id, "/bin/true", &[]).unwrap();

        assert!(matches!(
            registry.execute(&id, "/bin/true", &[]),
            Err(SandboxError::AlreadyFinished(_))
        ));
        assert_eq!(reports_in(&registry).len(), 1);
    }

    #[test]
    fn stop_before_launch_terminates_and_cleans_up() {
        let (_tmp, registry) = registry();
        let id = registry.create(ExecutionPolicy::default()).unwrap();
        let workspace = registry.list()[0].workspace.clone();
        assert!(workspace.is_dir());

        registry.stop(&id).unwrap();
        registry.stop(&id).unwrap();

        let report = registry.get_report(&id).unwrap();
        assert_eq!(report.status, ReportStatus::Terminated);
        assert_eq!(report.events.len(), 1);
        assert!(!workspace.exists());
        assert_eq!(reports_in(&registry).len(), 1);
        assert!(matches!(
            registry.execute(&id, "/bin/true", &[]),
            Err(SandboxError::AlreadyFinished(_))
        ));
    }

    #[test]
    fn remove_forgets_sandbox() {
        let (_tmp, registry) = registry();
        let a = registry.create(ExecutionPolicy::default()).unwrap();
        let b = registry.create(ExecutionPolicy::default()).unwrap();

        registry.remove(&a).unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b]);
        assert!(matches!(registry.remove(&a), Err(SandboxError::NotFound(_))));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let (_tmp, registry) = registry();
        for id in ["ccc", "aaa", "bbb"] {
            registry
                .create_with_id(id, ExecutionPolicy::default())
                .unwrap();
        }
        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn scan_above_threshold_is_rejected_without_state_change() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let registry = registry.with_scanner(Arc::new(FixedScanner::new(ThreatLevel::High)));
        let id = registry.create(ExecutionPolicy::default()).unwrap();

        assert!(matches!(
            registry.execute(&id, "/bin/true", &[]),
            Err(SandboxError::PolicyRejected(_))
        ));
        assert_eq!(registry.list()[0].state, SandboxState::Created);
        assert!(registry.list()[0].workspace.is_dir());
        assert!(registry.get_report(&id).unwrap().pre_scan.is_none());
    }

    #[test]
    fn accepted_scan_is_attached_to_report() {
        let _guard = serial_guard();
        let (_tmp, registry) = registry();
        let scanner = Arc::new(FixedScanner::new(ThreatLevel::Low));
        let registry = registry.with_scanner(scanner.clone());
        let id = registry.create(ExecutionPolicy::default()).unwrap();

        let report = registry.execute(&id, "true", &[]).unwrap();
        let scan = report.pre_scan.expect("pre-scan attached");
        assert_eq!(scan.filename, "true");
        assert_eq!(scan.hash.len(), 64);
        assert_eq!(scan.result.threat_level, ThreatLevel::Low);

        let seen = scanner.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("true".to_string(), scan.hash.clone())]);
    }

    #[test]
    fn pre_scan_requires_scanner() {
        let (_tmp, registry) = registry();
        assert!(matches!(
            registry.pre_scan("/bin/true"),
            Err(SandboxError::Scanner(_))
        ));
    }

    #[test]
    fn quarantine_goes_to_storage() {
        let (tmp, registry) = registry();
        let file = tmp.path().join("dropper.sh");
        fs::write(&file, "#!/bin/sh\n").unwrap();

        let moved = registry.quarantine(&file, "flagged").unwrap();
        assert!(moved.starts_with(registry.config().quarantine_dir()));
        assert!(!file.exists());
    }

    #[test]
    fn vm_execution_needs_backend() {
        let (_tmp, registry) = registry();
        assert!(matches!(
            registry.execute_in_vm("vm1", "uname", Duration::from_secs(1)),
            Err(SandboxError::Backend(_))
        ));

        let registry = registry.with_vm_backend(Arc::new(EchoBackend));
        let out = registry
            .execute_in_vm("vm1", "uname", Duration::from_secs(2))
            .unwrap();
        assert_eq!(out.stdout, "vm1:uname");
        assert_eq!(out.duration, Duration::from_secs(1));
    }

    #[test]
    fn drop_removes_unused_workspaces() {
        let (tmp, registry) = registry();
        registry.create(ExecutionPolicy::default()).unwrap();
        let workspace = registry.list()[0].workspace.clone();
        drop(registry);
        assert!(!workspace.exists());
        drop(tmp);
    }
}
