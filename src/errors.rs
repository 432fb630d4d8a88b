//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur during sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox already running")]
    AlreadyRunning,

    #[error("Sandbox {0} has already finished")]
    AlreadyFinished(String),

    #[error("Policy rejected execution: {0}")]
    PolicyRejected(String),

    #[error("Sandbox ID already in use: {0}")]
    IdCollision(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Process monitoring error: {0}")]
    ProcessMonitoring(String),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scanner error: {0}")]
    Scanner(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// True for caller-facing refusals that leave registry state untouched
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            SandboxError::NotFound(_)
                | SandboxError::AlreadyRunning
                | SandboxError::AlreadyFinished(_)
                | SandboxError::PolicyRejected(_)
                | SandboxError::IdCollision(_)
        )
    }
}
