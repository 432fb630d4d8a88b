//! Process supervision: launch the target in its own process group

use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::errors::{Result, SandboxError};
use crate::monitoring::enumerator::ProcessTable;
use crate::sandbox::ExitOutcome;

/// How long to wait for the group to disappear after SIGKILL
pub const KILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

const WAIT_STEP: Duration = Duration::from_millis(10);

/// Process execution configuration
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Program to execute
    pub program: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Environment overlay on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// File receiving stdout (discarded when unset)
    pub stdout: Option<PathBuf>,
    /// File receiving stderr (discarded when unset)
    pub stderr: Option<PathBuf>,
}

/// Signals broadcast to the whole process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl SignalKind {
    fn as_signal(self) -> Signal {
        match self {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        }
    }
}

/// Send `kind` to every member of process group `pgid`.
///
/// A group that no longer exists is not an error.
pub fn signal_group(pgid: i32, kind: SignalKind) -> Result<()> {
    match killpg(Pid::from_raw(pgid), kind.as_signal()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SandboxError::Syscall(format!(
            "Failed to send {:?} to group {}: {}",
            kind, pgid, e
        ))),
    }
}

/// Whether any process (zombies included) still belongs to `pgid`
pub fn group_alive(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None::<Signal>), Err(Errno::ESRCH))
}

fn outcome_from_status(status: ExitStatus) -> ExitOutcome {
    ExitOutcome {
        code: status.code(),
        signal: status.signal(),
    }
}

/// Owns the launched target and its process group
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Child,
    pid: i32,
    program: String,
    exit: Option<ExitOutcome>,
}

impl ProcessSupervisor {
    /// Spawn the target as leader of a fresh process group
    pub fn launch(config: &ProcessConfig) -> Result<Self> {
        let launch_err = |reason: String| SandboxError::Launch {
            program: config.program.clone(),
            reason,
        };

        let stdout = match &config.stdout {
            Some(path) => Stdio::from(File::create(path).map_err(|e| launch_err(e.to_string()))?),
            None => Stdio::null(),
        };
        let stderr = match &config.stderr {
            Some(path) => Stdio::from(File::create(path).map_err(|e| launch_err(e.to_string()))?),
            None => Stdio::null(),
        };

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| launch_err(e.to_string()))?;
        let pid = child.id() as i32;
        debug!("Launched {} as pid {}", config.program, pid);

        Ok(Self {
            child,
            pid,
            program: config.program.clone(),
            exit: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Process group id (the target leads its own group)
    pub fn pgid(&self) -> i32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status, if already captured
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Non-blocking exit check; the status is captured exactly once
    pub fn poll(&mut self) -> Result<Option<ExitOutcome>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        match self.child.try_wait()? {
            Some(status) => {
                let outcome = outcome_from_status(status);
                debug!("pid {} exited: {:?}", self.pid, outcome);
                self.exit = Some(outcome);
                Ok(self.exit)
            }
            None => Ok(None),
        }
    }

    /// Current descendants of the main process in `table`, including
    /// group members that were reparented away from it
    pub fn children(&self, table: &ProcessTable) -> BTreeSet<i32> {
        if self.exit.is_some() {
            return BTreeSet::new();
        }
        table.tracked(self.pid, self.pgid())
    }

    /// Broadcast a signal to the whole group
    pub fn signal(&self, kind: SignalKind) -> Result<()> {
        signal_group(self.pgid(), kind)
    }

    pub fn group_alive(&self) -> bool {
        group_alive(self.pgid())
    }

    /// Bounded join of the main process; never blocks past `timeout`
    pub fn wait(&mut self, timeout: Duration) -> Result<Option<ExitOutcome>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.poll()? {
                return Ok(Some(outcome));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            thread::sleep(remaining.min(WAIT_STEP));
        }
    }

    /// Wait until every group member is gone, reaping the main process
    /// along the way. Returns false if members remain at the deadline.
    pub fn wait_group(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Err(e) = self.poll() {
                warn!("Failed to poll pid {}: {}", self.pid, e);
            }
            if !self.group_alive() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(WAIT_STEP));
        }
    }

    /// SIGKILL whatever is left of the group and reap the main process
    pub fn kill_remaining(&mut self) -> Result<Option<ExitOutcome>> {
        if self.group_alive() {
            self.signal(SignalKind::Kill)?;
            if !self.wait_group(KILL_SETTLE_TIMEOUT) {
                warn!("Process group {} survived SIGKILL", self.pgid());
            }
        }
        self.poll()
    }

    /// Graceful shutdown: TERM → bounded grace → KILL
    pub fn terminate_tree(&mut self, grace: Duration) -> Result<Option<ExitOutcome>> {
        self.signal(SignalKind::Terminate)?;
        if self.wait_group(grace) {
            return self.poll();
        }
        debug!("Group {} still alive after {:?}, killing", self.pgid(), grace);
        self.kill_remaining()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // never leave an unsupervised tree behind
        if self.group_alive() {
            let _ = self.signal(SignalKind::Kill);
            let _ = self.wait(KILL_SETTLE_TIMEOUT);
        }
    }
}
