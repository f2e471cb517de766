//! Shared handle over one project's persisted state

use crate::document::JsonDocument;
use crate::layout::StoreLayout;
use crate::lease::{LeaseError, LeaseLock};
use crate::DEFAULT_LEASE_TTL_MS;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stagehand_core::{ProjectState, SharedClock};
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// Lease keys guarding the shared documents
pub mod keys {
    /// Guards the project-state document
    pub const PROJECT_STATE: &str = "project-state";
    /// Guards the agent-state document
    pub const AGENT_STATE: &str = "agent-state";
    /// Guards the recovery documents and the pause marker
    pub const RECOVERY: &str = "recovery";
    /// Guards a memory/project synchronization pass
    pub const STATE_SYNC: &str = "state-sync";
}

/// Layout, leases, clock and caller identity for one project root
///
/// Cheap to clone; every component holds its own copy.
#[derive(Debug, Clone)]
pub struct Store {
    layout: StoreLayout,
    leases: LeaseLock,
    clock: SharedClock,
    holder: String,
    lease_ttl_ms: u64,
}

impl Store {
    /// Open the store rooted at `root`
    ///
    /// The lease holder identity defaults to `<pid>-<ulid>`, unique per
    /// handle.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let layout = StoreLayout::new(root);
        let leases = LeaseLock::new(layout.locks_dir(), clock.clone());
        Self {
            layout,
            leases,
            clock,
            holder: format!("{}-{}", std::process::id(), Ulid::new()),
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
        }
    }

    /// Use a fixed lease holder identity
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Use a different lease time-to-live
    #[must_use]
    pub fn with_lease_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lease_ttl_ms = ttl_ms;
        self
    }

    /// Path layout
    #[inline]
    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Project root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Lease manager
    #[inline]
    #[must_use]
    pub fn leases(&self) -> &LeaseLock {
        &self.leases
    }

    /// Time source
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Lease holder identity of this handle
    #[inline]
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Lease time-to-live used by [`Self::locked`]
    #[inline]
    #[must_use]
    pub fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl_ms
    }

    /// Typed document at `path`
    #[must_use]
    pub fn document<T>(&self, path: impl Into<PathBuf>) -> JsonDocument<T>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        JsonDocument::new(path)
    }

    /// The project-state document
    #[must_use]
    pub fn project_state(&self) -> JsonDocument<ProjectState> {
        JsonDocument::new(self.layout.project_state())
    }

    /// Run `f` under the lease `key` held by this handle
    ///
    /// # Errors
    /// A lease conflict converted into `E`, or the error of `f`.
    pub fn locked<T, E, F>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LeaseError>,
    {
        self.leases
            .with_lease(key, &self.holder, self.lease_ttl_ms, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseStatus;
    use stagehand_core::ManualClock;

    #[test]
    fn locked_holds_the_lease_only_inside_the_closure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), ManualClock::default().shared()).with_holder("cli");

        let seen = store
            .locked(keys::PROJECT_STATE, || {
                store.leases().status(keys::PROJECT_STATE)
            })
            .unwrap();

        assert!(matches!(seen, LeaseStatus::Held { ref holder, .. } if holder == "cli"));
        assert_eq!(
            store.leases().status(keys::PROJECT_STATE).unwrap(),
            LeaseStatus::Free
        );
    }

    #[test]
    fn second_handle_conflicts_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let a = Store::open(dir.path(), clock.shared()).with_holder("a");
        let b = Store::open(dir.path(), clock.shared()).with_holder("b");

        let inner: Result<(), LeaseError> = a.locked(keys::AGENT_STATE, || {
            b.locked(keys::AGENT_STATE, || Ok(()))
        });

        assert!(matches!(inner, Err(LeaseError::Conflict { ref holder, .. }) if holder == "a"));
    }
}
