//! Persisted file layout under a project root

use std::path::{Path, PathBuf};

/// Directory holding all kernel state, relative to the project root
pub const STATE_DIR: &str = ".stagehand";

/// Name of the pause marker at the project root
pub const PAUSE_FILE: &str = "PAUSE";

/// Paths of every persisted document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Layout rooted at `root`
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.stagehand/`
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Project-wide state document
    #[must_use]
    pub fn project_state(&self) -> PathBuf {
        self.state_dir().join("project-state.json")
    }

    /// Agent registry document
    #[must_use]
    pub fn agent_state(&self) -> PathBuf {
        self.state_dir().join("agents").join("agent-state.json")
    }

    /// Recovery attempt history
    #[must_use]
    pub fn attempt_history(&self) -> PathBuf {
        self.recovery_dir().join("attempt-history.json")
    }

    /// Recovery checkpoint store
    #[must_use]
    pub fn checkpoints(&self) -> PathBuf {
        self.recovery_dir().join("checkpoints.json")
    }

    /// Directory holding lease files
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    /// Long-term memory document synchronized with the project state
    #[must_use]
    pub fn memory(&self) -> PathBuf {
        self.state_dir().join("memory").join("memory.json")
    }

    /// Project-local configuration override
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.state_dir().join("config.yaml")
    }

    /// Human-intervention marker
    #[must_use]
    pub fn pause_marker(&self) -> PathBuf {
        self.root.join(PAUSE_FILE)
    }

    /// Resolve a project-relative path such as an execution artifact
    #[must_use]
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    fn recovery_dir(&self) -> PathBuf {
        self.state_dir().join("recovery")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_root() {
        let layout = StoreLayout::new("/p");
        assert_eq!(
            layout.project_state(),
            PathBuf::from("/p/.stagehand/project-state.json")
        );
        assert_eq!(
            layout.agent_state(),
            PathBuf::from("/p/.stagehand/agents/agent-state.json")
        );
        assert_eq!(
            layout.attempt_history(),
            PathBuf::from("/p/.stagehand/recovery/attempt-history.json")
        );
        assert_eq!(layout.pause_marker(), PathBuf::from("/p/PAUSE"));
        assert_eq!(layout.resolve("out/a.md"), PathBuf::from("/p/out/a.md"));
    }
}
