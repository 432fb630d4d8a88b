//! Execution layer: launching and supervising the target
//!
//! The target runs as the leader of a fresh process group so that the whole
//! descendant tree can be signaled with one `killpg`. Exit status is captured
//! exactly once, and every wait is bounded.
//!
//! # Examples
//!
//! ```ignore
//! use safebox::execution::{ProcessConfig, ProcessSupervisor};
//! use std::time::Duration;
//!
//! let config = ProcessConfig {
//!     program: "/bin/sleep".to_string(),
//!     args: vec!["10".to_string()],
//!     ..Default::default()
//! };
//! let mut supervisor = ProcessSupervisor::launch(&config)?;
//! supervisor.terminate_tree(Duration::from_secs(5))?;
//! ```

pub mod process;
pub use process::{
    KILL_SETTLE_TIMEOUT, ProcessConfig, ProcessSupervisor, SignalKind, group_alive, signal_group,
};
