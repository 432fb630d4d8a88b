//! Policy threshold and heuristic anomaly detection

use serde::{Deserialize, Serialize};

use crate::policy::ExecutionPolicy;
use crate::sandbox::ResourceUsage;

/// Descendant count above which a fork bomb is suspected, whatever the policy says
pub const FORK_BOMB_THRESHOLD: usize = 50;

/// Anomaly classes, declared in reporting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    CpuExceeded,
    MemoryExceeded,
    ProcessCountExceeded,
    ForkBombSuspected,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::CpuExceeded => write!(f, "cpu-exceeded"),
            AnomalyKind::MemoryExceeded => write!(f, "memory-exceeded"),
            AnomalyKind::ProcessCountExceeded => write!(f, "process-count-exceeded"),
            AnomalyKind::ForkBombSuspected => write!(f, "fork-bomb-suspected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub message: String,
}

/// Stateless evaluation of usage against a policy
pub struct AnomalyDetector;

impl AnomalyDetector {
    /// Ordered: cpu, memory, process-count, fork-bomb
    pub fn evaluate(usage: &ResourceUsage, policy: &ExecutionPolicy) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        if usage.cpu_percent > policy.max_cpu_percent {
            anomalies.push(Anomaly {
                kind: AnomalyKind::CpuExceeded,
                message: format!(
                    "CPU usage exceeds limit: {:.1}% > {}%",
                    usage.cpu_percent, policy.max_cpu_percent
                ),
            });
        }

        if usage.memory_mb > policy.max_memory_mb as f64 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::MemoryExceeded,
                message: format!(
                    "Memory usage exceeds limit: {:.1}MB > {}MB",
                    usage.memory_mb, policy.max_memory_mb
                ),
            });
        }

        if usage.process_count > policy.max_processes as usize {
            anomalies.push(Anomaly {
                kind: AnomalyKind::ProcessCountExceeded,
                message: format!(
                    "Too many processes: {} > {}",
                    usage.process_count, policy.max_processes
                ),
            });
        }

        if usage.process_count > FORK_BOMB_THRESHOLD {
            anomalies.push(Anomaly {
                kind: AnomalyKind::ForkBombSuspected,
                message: format!(
                    "Possible fork bomb detected: {} processes",
                    usage.process_count
                ),
            });
        }

        anomalies
    }
}
