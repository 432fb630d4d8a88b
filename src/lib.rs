//! safebox: sandboxed-execution monitoring engine
//!
//! Launches a candidate program inside a per-sandbox workspace under an
//! [`ExecutionPolicy`], samples its process tree and the host connection
//! tables at a fixed interval, flags policy violations and fork bombs,
//! enforces a hard timeout and emits an immutable [`Report`].
//!
//! # Modules
//!
//! - **policy**: Resource and behaviour limits
//! - **storage**: Per-sandbox workspace directories
//! - **execution**: Process-group supervision
//! - **monitoring**: Process/network sampling, anomaly detection, telemetry loop
//! - **sandbox**: Sandbox aggregate and lifecycle records
//! - **report**: Report derivation and persistence
//! - **collaborators**: Scanner, quarantine and VM backend contracts
//! - **controller**: The registry managing all sandboxes
//!
//! # Example
//!
//! ```ignore
//! use safebox::{ExecutionPolicy, ManagerConfig, SandboxRegistry};
//!
//! let registry = SandboxRegistry::new(ManagerConfig::from_env());
//! let policy = ExecutionPolicy::builder()
//!     .max_memory_str("128M")?
//!     .max_duration_seconds(30)
//!     .build()?;
//!
//! let id = registry.create(policy)?;
//! let report = registry.execute(&id, "/bin/echo", &["hello".to_string()])?;
//! println!("{:?} -> {:?}", report.status, report.return_code);
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod policy;
pub mod utils;

// Layered modules
pub mod collaborators;
pub mod execution;
pub mod monitoring;
pub mod report;
pub mod sandbox;
pub mod storage;

// Main controller
pub mod controller;

// Public API
pub use collaborators::{
    ContentScanner, FsQuarantine, PreScan, QuarantineStore, ScanResult, ThreatLevel,
    VirtualizationBackend, VmExecution,
};
pub use config::ManagerConfig;
pub use controller::{SandboxRegistry, SandboxSummary};
pub use errors::{Result, SandboxError};
pub use monitoring::{
    Anomaly, AnomalyDetector, AnomalyKind, ProcessEnumerator, ProcessState, ProcfsEnumerator,
};
pub use policy::{ExecutionPolicy, PolicyBuilder};
pub use report::{Report, ReportBuilder, ReportStatus};
pub use sandbox::{Event, EventKind, SandboxState};


#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
