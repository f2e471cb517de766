//! Testing utilities for the Stagehand workspace
//!
//! Temp project roots on a hand-driven clock, plus small builders for the
//! project-state document.

#![allow(missing_docs)]

use serde_json::{json, Value};
use stagehand_core::{Backlog, ManualClock, ProjectState, StageId};
use stagehand_store::Store;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub use stagehand_core::ManualClock as TestClock;

/// A throwaway project root with a manual clock and a store handle on it
#[derive(Debug)]
pub struct TestProject {
    dir: TempDir,
    clock: ManualClock,
    store: Store,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let store = Store::open(dir.path(), clock.shared()).with_holder("test");
        Self { dir, clock, store }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// A second handle on the same root, as another process would open it
    pub fn other_handle(&self, holder: &str) -> Store {
        Store::open(self.dir.path(), self.clock.shared()).with_holder(holder)
    }

    /// Write a project-relative file, creating parents
    pub fn write_file(&self, relative: impl AsRef<Path>, contents: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn write_state(&self, state: &ProjectState) {
        self.store.project_state().save(state).unwrap();
    }

    pub fn state(&self) -> ProjectState {
        self.store.project_state().load_existing().unwrap()
    }

    pub fn advance_ms(&self, ms: i64) {
        self.clock.advance_ms(ms);
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Project state at `stage` with the given artifacts registered
pub fn state_with_artifacts(stage: &str, artifacts: &[&str]) -> ProjectState {
    let mut state = ProjectState::at_stage(stage);
    for id in artifacts {
        state.artifacts.insert((*id).to_string(), artifact_entry("test"));
    }
    state
}

/// Project state at `stage` with a backlog
pub fn state_with_backlog(stage: &str, completed: u64, total: u64) -> ProjectState {
    let mut state = ProjectState::at_stage(stage);
    state.backlog = Some(Backlog { total, completed });
    state
}

/// Minimal artifact registry entry
pub fn artifact_entry(kind: &str) -> Value {
    json!({ "kind": kind, "registered_at": "2026-01-01T00:00:00Z" })
}

pub fn stage(id: &str) -> StageId {
    StageId::new(id)
}
