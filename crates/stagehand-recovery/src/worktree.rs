//! Working-tree reset seam
//!
//! Rollback is the only place the recovery manager touches the code it
//! protects. The trait keeps version control out of the manager's tests.

use crate::error::RecoveryError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Something that can be reset to a checkpoint reference
pub trait WorkingTree: Send + Sync + fmt::Debug {
    /// Discard local changes and move to `reference`
    ///
    /// # Errors
    /// `RecoveryError::Rollback` when the reset did not happen.
    fn reset_hard(&self, reference: &str) -> Result<(), RecoveryError>;
}

/// A git checkout, reset with `git reset --hard`
#[derive(Debug, Clone)]
pub struct GitWorkingTree {
    dir: PathBuf,
}

impl GitWorkingTree {
    /// Checkout rooted at `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Checkout directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl WorkingTree for GitWorkingTree {
    fn reset_hard(&self, reference: &str) -> Result<(), RecoveryError> {
        let fail = |reason: String| RecoveryError::Rollback {
            reference: Some(reference.to_string()),
            reason,
        };

        if reference.is_empty() || reference.starts_with('-') {
            return Err(fail(format!("invalid checkpoint reference {reference:?}")));
        }

        let output = Command::new("git")
            .args(["reset", "--hard", reference])
            .current_dir(&self.dir)
            .output()
            .map_err(|e| fail(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "git reset --hard exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::debug!(dir = %self.dir.display(), reference, "Working tree reset");
        Ok(())
    }
}
