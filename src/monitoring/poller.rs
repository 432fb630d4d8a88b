//! Fixed-interval telemetry loop driving a RUNNING sandbox
//!
//! Each tick, in order: timeout check, exit check, process sampling,
//! process-creation diff, network sample, anomaly check, stop-request check,
//! then sleep for whatever is left of the interval. Failures of a single
//! telemetry source degrade that tick and are logged; they never end the loop.

use std::collections::{BTreeSet, HashMap};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};

use crate::config::{DEFAULT_GRACE_PERIOD, DEFAULT_POLL_INTERVAL};
use crate::execution::{ProcessSupervisor, SignalKind};
use crate::monitoring::anomaly::{AnomalyDetector, AnomalyKind};
use crate::monitoring::enumerator::{MonitoringFault, ProcessEnumerator, ProcessState, ProcessTable};
use crate::monitoring::network::NetworkProbe;
use crate::policy::ExecutionPolicy;
use crate::sandbox::{
    EventKind, ExitOutcome, NetworkSnapshot, ProcessSnapshot, SandboxSlot, SandboxState,
    TelemetryTick,
};

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCause {
    /// Main process exited on its own
    Exited,
    /// `max_duration_seconds` elapsed
    Timeout,
    /// External stop request
    Stopped,
    /// Strict policy and an anomaly was detected
    AnomalyKill,
}

impl TerminalCause {
    pub fn final_state(&self) -> SandboxState {
        match self {
            TerminalCause::Exited => SandboxState::Completed,
            _ => SandboxState::Terminated,
        }
    }
}

/// Result of a finished poll loop, already applied to the sandbox
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Termination {
    pub cause: TerminalCause,
    pub state: SandboxState,
    pub exit: Option<ExitOutcome>,
    /// Ticks during which at least one telemetry source failed
    pub degraded_ticks: u32,
}

pub struct TelemetryPoller<'a> {
    slot: &'a SandboxSlot,
    supervisor: ProcessSupervisor,
    enumerator: &'a dyn ProcessEnumerator,
    network: &'a dyn NetworkProbe,
    policy: ExecutionPolicy,
    interval: Duration,
    grace: Duration,
    started: Instant,
    baseline: Option<BTreeSet<i32>>,
    cpu_prev: HashMap<i32, (u64, Instant)>,
    reported: BTreeSet<AnomalyKind>,
    degraded_ticks: u32,
}

impl<'a> TelemetryPoller<'a> {
    /// `baseline` is the system pid set captured before launch; `None` when
    /// that capture failed, in which case the first good table becomes it.
    pub fn new(
        slot: &'a SandboxSlot,
        supervisor: ProcessSupervisor,
        enumerator: &'a dyn ProcessEnumerator,
        network: &'a dyn NetworkProbe,
        baseline: Option<BTreeSet<i32>>,
    ) -> Self {
        let policy = slot.lock().policy().clone();
        Self {
            slot,
            supervisor,
            enumerator,
            network,
            policy,
            interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_GRACE_PERIOD,
            started: Instant::now(),
            baseline,
            cpu_prev: HashMap::new(),
            reported: BTreeSet::new(),
            degraded_ticks: 0,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Loop until a terminal condition, tear the process tree down and
    /// move the sandbox into its terminal state.
    pub fn run(mut self) -> Termination {
        let cause = loop {
            let tick_start = Instant::now();
            if let Some(cause) = self.tick() {
                break cause;
            }
            let cost = tick_start.elapsed();
            thread::sleep(self.interval.saturating_sub(cost));
        };

        // the run ends when the loop decides so, not when teardown is done
        let decided_at = Utc::now();
        let exit = self.teardown(cause);
        let state = cause.final_state();
        {
            let mut sandbox = self.slot.lock();
            sandbox.finish(state, exit, decided_at);
            info!(
                "Sandbox {} finished: {:?} ({:?})",
                sandbox.id(),
                state,
                cause
            );
        }

        Termination {
            cause,
            state,
            exit,
            degraded_ticks: self.degraded_ticks,
        }
    }

    /// One sampling pass; returns the terminal cause once the loop must end
    pub fn tick(&mut self) -> Option<TerminalCause> {
        let elapsed = self.started.elapsed();
        if elapsed > Duration::from_secs(self.policy.max_duration_seconds) {
            self.send_terminate();
            self.record(EventKind::TimeoutKill {
                elapsed_ms: elapsed.as_millis() as u64,
            });
            return Some(TerminalCause::Timeout);
        }

        match self.supervisor.poll() {
            Ok(Some(outcome)) => {
                self.record(EventKind::ProcessExited {
                    code: outcome.code,
                    signal: outcome.signal,
                });
                return Some(TerminalCause::Exited);
            }
            Ok(None) => {}
            Err(e) => warn!("Exit check for pid {} failed: {}", self.supervisor.pid(), e),
        }

        let mut faults = Vec::new();
        match self.enumerator.snapshot() {
            Ok(table) => {
                self.sample(&table, &mut faults);
            }
            Err(e) => faults.push(MonitoringFault::EnumerationFailed(e.to_string())),
        }

        if let Some(cause) = self.check_anomalies() {
            self.report_faults(&faults);
            return Some(cause);
        }
        self.report_faults(&faults);

        if self.slot.stop_requested() {
            self.record(EventKind::StopRequested);
            self.send_terminate();
            return Some(TerminalCause::Stopped);
        }

        None
    }

    fn sample(&mut self, table: &ProcessTable, faults: &mut Vec<MonitoringFault>) {
        let main = self.supervisor.pid();
        let children = self.supervisor.children(table);

        let mut tracked: Vec<i32> = Vec::with_capacity(children.len() + 1);
        tracked.push(main);
        tracked.extend(children.iter().copied());

        for pid in &tracked {
            if let Some(fault) = table.faults.iter().find(|f| {
                matches!(f, MonitoringFault::ProcessVanished(p) | MonitoringFault::AccessDenied(p) if p == pid)
            }) {
                faults.push(fault.clone());
            }
        }

        let now = self.slot.lock().stamp(Utc::now());
        let mut rows = Vec::with_capacity(tracked.len());
        let mut cpu_seen = HashMap::with_capacity(tracked.len());
        for pid in &tracked {
            let Some(info) = table.get(*pid) else {
                continue;
            };
            if info.state == ProcessState::Zombie {
                continue;
            }

            let cpu_percent = match self.cpu_prev.get(pid) {
                Some((prev_ms, prev_at)) => {
                    let wall_ms = table.captured_at.saturating_duration_since(*prev_at).as_millis();
                    if wall_ms > 0 {
                        info.cpu_time_ms.saturating_sub(*prev_ms) as f64 * 100.0 / wall_ms as f64
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            cpu_seen.insert(*pid, (info.cpu_time_ms, table.captured_at));

            rows.push(ProcessSnapshot {
                timestamp: now,
                pid: *pid,
                name: info.name.clone(),
                cpu_percent,
                memory_mb: info.memory_mb(),
                status: info.state,
            });
        }
        self.cpu_prev = cpu_seen;

        // zombies have exited already; only live children count
        let live_children = children
            .iter()
            .filter(|pid| {
                table
                    .get(**pid)
                    .map_or(false, |info| info.state != ProcessState::Zombie)
            })
            .count();

        self.diff_processes(table, main, &children);

        let connections = match self.network.connections() {
            Ok(connections) => connections,
            Err(e) => {
                faults.push(MonitoringFault::NetworkUnavailable(e.to_string()));
                Vec::new()
            }
        };

        debug!(
            "Tick for pid {}: {} rows, {} children, {} connections",
            main,
            rows.len(),
            live_children,
            connections.len()
        );

        self.slot.lock().record_tick(TelemetryTick {
            timestamp: now,
            processes: rows,
            tracked_children: live_children,
            network: NetworkSnapshot {
                timestamp: now,
                connections,
            },
        });
    }

    /// Report every pid not yet in the baseline, then fold it in
    fn diff_processes(&mut self, table: &ProcessTable, main: i32, children: &BTreeSet<i32>) {
        let baseline = self.baseline.get_or_insert_with(|| {
            let mut initial = table.pids();
            initial.remove(&main);
            for pid in children {
                initial.remove(pid);
            }
            initial
        });

        let fresh: Vec<i32> = table
            .pids()
            .into_iter()
            .filter(|pid| !baseline.contains(pid))
            .collect();
        if fresh.is_empty() {
            return;
        }
        baseline.extend(fresh.iter().copied());

        let created: Vec<(i32, Option<String>)> = fresh
            .into_iter()
            .map(|pid| (pid, self.enumerator.cmdline(pid)))
            .collect();
        let mut sandbox = self.slot.lock();
        for (pid, cmdline) in created {
            sandbox.record_event(Utc::now(), EventKind::ProcessCreated { pid, cmdline });
        }
    }

    fn check_anomalies(&mut self) -> Option<TerminalCause> {
        let mut sandbox = self.slot.lock();
        let usage = sandbox.latest_usage()?;
        let anomalies = AnomalyDetector::evaluate(&usage, &self.policy);

        for anomaly in &anomalies {
            if self.reported.insert(anomaly.kind) {
                warn!("Sandbox {}: {}", sandbox.id(), anomaly.message);
                sandbox.record_event(Utc::now(), EventKind::Anomaly(anomaly.clone()));
            }
        }
        drop(sandbox);

        if self.policy.strict && !anomalies.is_empty() {
            self.send_terminate();
            return Some(TerminalCause::AnomalyKill);
        }
        None
    }

    fn report_faults(&mut self, faults: &[MonitoringFault]) {
        if faults.is_empty() {
            return;
        }
        self.degraded_ticks += 1;
        for fault in faults {
            match fault {
                MonitoringFault::EnumerationFailed(_) | MonitoringFault::NetworkUnavailable(_) => {
                    warn!("Monitoring degraded for pid {}: {}", self.supervisor.pid(), fault)
                }
                _ => debug!("Monitoring degraded for pid {}: {}", self.supervisor.pid(), fault),
            }
        }
    }

    fn record(&self, kind: EventKind) {
        self.slot.lock().record_event(Utc::now(), kind);
    }

    fn send_terminate(&self) {
        if let Err(e) = self.supervisor.signal(SignalKind::Terminate) {
            warn!("Failed to terminate group {}: {}", self.supervisor.pgid(), e);
        }
    }

    /// Make sure nothing of the tree survives, whatever the cause
    fn teardown(&mut self, cause: TerminalCause) -> Option<ExitOutcome> {
        let pgid = self.supervisor.pgid();
        if cause != TerminalCause::Exited && !self.supervisor.wait_group(self.grace) {
            debug!("Group {} ignored TERM for {:?}", pgid, self.grace);
        }

        // natural exit may leave orphans behind in the group
        match self.supervisor.kill_remaining() {
            Ok(exit) => exit.or(self.supervisor.exit_outcome()),
            Err(e) => {
                warn!("Failed to kill remaining members of group {}: {}", pgid, e);
                self.supervisor.exit_outcome()
            }
        }
    }
}
