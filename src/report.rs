//! Immutable execution reports and their canonical JSON form

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::PreScan;
use crate::errors::Result;
use crate::monitoring::anomaly::{Anomaly, AnomalyDetector};
use crate::sandbox::{Event, EventKind, Sandbox};

/// Version of the persisted record shape
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Outcome carried by a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Not yet terminal; `end_time` is provisional
    Running,
    Completed,
    Terminated,
    Error,
}

impl ReportStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReportStatus::Running)
    }
}

/// Projection of a sandbox at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: u32,
    pub sandbox_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReportStatus,
    pub return_code: Option<i32>,
    /// Tracked descendants plus the main process, from the latest sample
    pub total_processes: usize,
    /// Instantaneous CPU percent of the latest sample
    pub total_cpu_used: f64,
    /// Instantaneous resident memory (MB) of the latest sample
    pub total_memory_used: f64,
    /// Distinct peer endpoints seen across all samples
    pub network_activity: Vec<String>,
    pub file_access_attempts: Vec<String>,
    pub anomalies_detected: Vec<Anomaly>,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_scan: Option<PreScan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Report {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// File name under the reports directory: `<id>_<YYYYmmdd_HHMMSS>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            self.sandbox_id,
            self.end_time.format("%Y%m%d_%H%M%S")
        )
    }

    /// Write the report under `reports_dir` and return its path
    pub fn persist(&self, reports_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(reports_dir)?;
        let path = reports_dir.join(self.file_name());
        fs::write(&path, self.to_json()?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Derives reports from logged sandbox state only
pub struct ReportBuilder;

impl ReportBuilder {
    /// Build the report a sandbox would carry with `status` at `now`.
    ///
    /// `now` only stands in for `end_time` while the sandbox has not ended.
    pub fn build(sandbox: &Sandbox, status: ReportStatus, now: DateTime<Utc>) -> Report {
        let start_time = sandbox.started_at().unwrap_or(sandbox.created_at());
        let end_time = sandbox.ended_at().unwrap_or(now).max(start_time);

        let latest = sandbox.telemetry().last();
        let (total_processes, total_cpu_used, total_memory_used) = match latest {
            Some(tick) => {
                let usage = tick.usage();
                (tick.tracked_children + 1, usage.cpu_percent, usage.memory_mb)
            }
            None if sandbox.main_pid().is_some() => (1, 0.0, 0.0),
            None => (0, 0.0, 0.0),
        };

        let network_activity: BTreeSet<String> = sandbox
            .telemetry()
            .iter()
            .flat_map(|tick| tick.network.connections.iter())
            .filter(|conn| conn.has_peer())
            .map(|conn| conn.endpoint())
            .collect();

        Report {
            schema_version: REPORT_SCHEMA_VERSION,
            sandbox_id: sandbox.id().to_string(),
            start_time,
            end_time,
            status,
            return_code: sandbox.exit().and_then(|exit| exit.return_code()),
            total_processes,
            total_cpu_used,
            total_memory_used,
            network_activity: network_activity.into_iter().collect(),
            file_access_attempts: Vec::new(),
            anomalies_detected: Self::anomalies(sandbox),
            events: sandbox.events().to_vec(),
            pre_scan: sandbox.pre_scan().cloned(),
            error: sandbox.error().map(str::to_string),
        }
    }

    /// Logged anomalies plus those of the latest sample, one per kind
    fn anomalies(sandbox: &Sandbox) -> Vec<Anomaly> {
        let mut found: Vec<Anomaly> = sandbox
            .events()
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::Anomaly(anomaly) => Some(anomaly.clone()),
                _ => None,
            })
            .collect();
        if let Some(usage) = sandbox.latest_usage() {
            found.extend(AnomalyDetector::evaluate(&usage, sandbox.policy()));
        }

        // stable sort keeps the first (logged) message of each kind
        found.sort_by_key(|anomaly| anomaly.kind);
        found.dedup_by_key(|anomaly| anomaly.kind);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::anomaly::AnomalyKind;
    use crate::monitoring::enumerator::ProcessState;
    use crate::monitoring::network::{Connection, Protocol};
    use crate::policy::ExecutionPolicy;
    use crate::sandbox::{
        ExitOutcome, NetworkSnapshot, ProcessSnapshot, SandboxState, TelemetryTick,
    };
    use crate::storage::Workspace;
    use tempfile::{TempDir, tempdir};

    fn sandbox(tmp: &TempDir) -> Sandbox {
        let ws = Workspace::allocate(tmp.path(), "rep1").unwrap();
        Sandbox::new("rep1".to_string(), ExecutionPolicy::default(), ws)
    }

    fn conn(remote: &str) -> Connection {
        Connection {
            protocol: Protocol::Tcp,
            local: "10.0.0.2:40000".parse().unwrap(),
            remote: remote.parse().unwrap(),
            state: "ESTABLISHED".to_string(),
        }
    }

    fn tick(cpu: f64, mem: f64, children: usize, connections: Vec<Connection>) -> TelemetryTick {
        let now = Utc::now();
        TelemetryTick {
            timestamp: now,
            processes: vec![ProcessSnapshot {
                timestamp: now,
                pid: 100,
                name: "target".to_string(),
                cpu_percent: cpu,
                memory_mb: mem,
                status: ProcessState::Running,
            }],
            tracked_children: children,
            network: NetworkSnapshot {
                timestamp: now,
                connections,
            },
        }
    }

    #[test]
    fn created_sandbox_report_is_running_and_empty() {
        let tmp = tempdir().unwrap();
        let sb = sandbox(&tmp);
        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());

        assert_eq!(report.status, ReportStatus::Running);
        assert_eq!(report.total_processes, 0);
        assert_eq!(report.return_code, None);
        assert!(report.events.is_empty());
        assert!(report.end_time >= report.start_time);
    }

    #[test]
    fn usage_comes_from_latest_sample() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(100, 100, Utc::now());
        sb.record_tick(tick(90.0, 500.0, 3, Vec::new()));
        sb.record_tick(tick(5.0, 12.5, 2, Vec::new()));

        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());
        assert_eq!(report.total_processes, 3);
        assert_eq!(report.total_cpu_used, 5.0);
        assert_eq!(report.total_memory_used, 12.5);
        // logged nothing, latest sample quiet
        assert!(report.anomalies_detected.is_empty());
    }

    #[test]
    fn network_activity_is_distinct_and_skips_listeners() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(100, 100, Utc::now());
        sb.record_tick(tick(0.0, 1.0, 0, vec![conn("1.1.1.1:53"), conn("0.0.0.0:0")]));
        sb.record_tick(tick(0.0, 1.0, 0, vec![conn("1.1.1.1:53"), conn("8.8.8.8:443")]));

        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());
        assert_eq!(
            report.network_activity,
            vec!["tcp://1.1.1.1:53", "tcp://8.8.8.8:443"]
        );
    }

    #[test]
    fn anomalies_merge_logged_and_latest_in_canonical_order() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(100, 100, Utc::now());
        sb.record_event(
            Utc::now(),
            EventKind::Anomaly(Anomaly {
                kind: AnomalyKind::MemoryExceeded,
                message: "logged".to_string(),
            }),
        );
        sb.record_tick(tick(99.0, 300.0, 0, Vec::new()));

        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());
        let kinds: Vec<_> = report.anomalies_detected.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::CpuExceeded, AnomalyKind::MemoryExceeded]);
        assert_eq!(report.anomalies_detected[1].message, "logged");
    }

    #[test]
    fn terminal_report_uses_recorded_end_time() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(100, 100, Utc::now());
        sb.finish(
            SandboxState::Terminated,
            Some(ExitOutcome {
                code: None,
                signal: Some(15),
            }),
            Utc::now(),
        );
        let ended = sb.ended_at().unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        let report = ReportBuilder::build(&sb, sb.report_status(), later);
        assert_eq!(report.status, ReportStatus::Terminated);
        assert_eq!(report.end_time, ended);
        assert_eq!(report.return_code, Some(-15));
        assert_eq!(report.total_processes, 1);
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let tmp = tempdir().unwrap();
        let mut sb = sandbox(&tmp);
        sb.mark_running(100, 100, Utc::now());
        sb.record_event(
            Utc::now(),
            EventKind::ProcessCreated {
                pid: 101,
                cmdline: Some("sh -c x".to_string()),
            },
        );
        sb.record_tick(tick(33.3, 17.123456789, 4, vec![conn("[2001:db8::1]:443")]));
        sb.record_event(Utc::now(), EventKind::StopRequested);

        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"running\""));
        assert!(json.contains("\"type\": \"process-created\""));
        assert_eq!(Report::from_json(&json).unwrap(), report);
    }

    #[test]
    fn persist_uses_id_and_timestamp_file_name() {
        let tmp = tempdir().unwrap();
        let sb = sandbox(&tmp);
        let report = ReportBuilder::build(&sb, sb.report_status(), Utc::now());

        let reports = tmp.path().join("reports");
        let path = report.persist(&reports).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rep1_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "rep1_".len() + 15 + ".json".len());
        assert_eq!(Report::load(&path).unwrap(), report);
    }
}
