//! Execution policy: resource and behaviour limits for one run

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::utils;

/// Immutable resource/behaviour limits attached to a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Aggregate CPU usage ceiling in percent
    pub max_cpu_percent: f64,
    /// Aggregate resident memory ceiling in MB
    pub max_memory_mb: u64,
    /// Hard wall-clock limit
    pub max_duration_seconds: u64,
    /// Maximum number of descendant processes
    pub max_processes: u32,
    /// Whether the target is expected to use the network
    pub network_enabled: bool,
    /// Whether the target is expected to touch files outside its workspace
    pub file_access_allowed: bool,
    /// Terminate on first anomaly instead of only annotating the report
    pub strict: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_cpu_percent: 20.0,
            max_memory_mb: 256,
            max_duration_seconds: 300,
            max_processes: 10,
            network_enabled: false,
            file_access_allowed: false,
            strict: false,
        }
    }
}

impl ExecutionPolicy {
    /// Start a builder from the default policy
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Validate limits
    pub fn validate(&self) -> Result<()> {
        if !self.max_cpu_percent.is_finite() || self.max_cpu_percent <= 0.0 {
            return Err(SandboxError::InvalidConfig(format!(
                "max_cpu_percent must be positive, got {}",
                self.max_cpu_percent
            )));
        }

        if self.max_memory_mb == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_memory_mb must be positive".to_string(),
            ));
        }

        if self.max_duration_seconds == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_duration_seconds must be positive".to_string(),
            ));
        }

        if self.max_processes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_processes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder pattern for execution policies
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    policy: ExecutionPolicy,
}

impl PolicyBuilder {
    /// Set CPU ceiling in percent
    pub fn max_cpu_percent(mut self, percent: f64) -> Self {
        self.policy.max_cpu_percent = percent;
        self
    }

    /// Set memory ceiling in MB
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.policy.max_memory_mb = mb;
        self
    }

    /// Set memory ceiling from string (e.g., "256M"), rounded down to whole MB
    pub fn max_memory_str(self, s: &str) -> Result<Self> {
        let bytes = utils::parse_memory_size(s)?;
        Ok(self.max_memory_mb(bytes / (1024 * 1024)))
    }

    /// Set execution timeout in seconds
    pub fn max_duration_seconds(mut self, seconds: u64) -> Self {
        self.policy.max_duration_seconds = seconds;
        self
    }

    /// Set descendant process ceiling
    pub fn max_processes(mut self, max: u32) -> Self {
        self.policy.max_processes = max;
        self
    }

    pub fn network_enabled(mut self, enabled: bool) -> Self {
        self.policy.network_enabled = enabled;
        self
    }

    pub fn file_access_allowed(mut self, allowed: bool) -> Self {
        self.policy.file_access_allowed = allowed;
        self
    }

    /// Kill the target on first anomaly
    pub fn strict(mut self, strict: bool) -> Self {
        self.policy.strict = strict;
        self
    }

    /// Validate and produce the policy
    pub fn build(self) -> Result<ExecutionPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
