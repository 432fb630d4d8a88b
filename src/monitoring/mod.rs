//! Monitoring layer: process/network sampling and anomaly detection
//!
//! - [`enumerator`]: process table snapshots (procfs or scripted)
//! - [`network`]: connection table snapshots (procfs or scripted)
//! - [`anomaly`]: stateless policy and heuristic evaluation
//! - [`poller`]: the per-sandbox telemetry loop tying them together

pub mod anomaly;
pub mod enumerator;
pub mod network;
pub mod poller;

pub use anomaly::{Anomaly, AnomalyDetector, AnomalyKind, FORK_BOMB_THRESHOLD};
pub use enumerator::{
    MonitoringFault, ProcessEnumerator, ProcessInfo, ProcessState, ProcessTable, ProcfsEnumerator,
    ScriptedEnumerator,
};
pub use network::{Connection, NetworkProbe, ProcNetProbe, Protocol, ScriptedNetworkProbe};
pub use poller::{TelemetryPoller, TerminalCause, Termination};
