//! Storage layer: per-sandbox workspaces
//!
//! Every sandbox owns exactly one workspace directory, allocated when the
//! sandbox is created and removed once it reaches a terminal state.
//!
//! # Layout
//!
//! - `bin/`: binaries staged for the target
//! - `lib/`: libraries staged for the target
//! - `tmp/`: scratch space (`TMPDIR`)
//! - `logs/`: captured stdout/stderr

pub mod workspace;

pub use workspace::Workspace;
