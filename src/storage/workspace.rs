//! Isolated filesystem subtree for one sandbox

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{Result, SandboxError};

/// Fixed subdirectory names created inside every workspace
pub const SUBDIRS: [&str; 4] = ["bin", "lib", "tmp", "logs"];

/// Workspace owned by a single sandbox
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Allocate `<base>/<sandbox_id>` and its fixed subdirectories.
    ///
    /// Fails if the directory already exists so two sandboxes can never
    /// share a tree.
    pub fn allocate(base: &Path, sandbox_id: &str) -> Result<Self> {
        if sandbox_id.is_empty() || sandbox_id.contains('/') || sandbox_id.starts_with('.') {
            return Err(SandboxError::InvalidConfig(format!(
                "Invalid sandbox ID for workspace: {:?}",
                sandbox_id
            )));
        }

        fs::create_dir_all(base).map_err(|e| {
            SandboxError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create workspace base {}: {}", base.display(), e),
            ))
        })?;

        let root = base.join(sandbox_id);
        fs::create_dir(&root).map_err(|e| {
            SandboxError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create workspace {}: {}", root.display(), e),
            ))
        })?;

        let workspace = Self { root };
        for sub in SUBDIRS {
            fs::create_dir(workspace.root.join(sub))?;
        }

        debug!("Allocated workspace {}", workspace.root.display());
        Ok(workspace)
    }

    /// Workspace root (working directory of the target)
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    /// Scratch directory exported as `TMPDIR`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Check whether the tree is still on disk
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Remove the whole tree (idempotent)
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!("Removed workspace {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Io(io::Error::new(
                e.kind(),
                format!("Failed to remove workspace {}: {}", self.root.display(), e),
            ))),
        }
    }
}
