//! In-process deadline timers
//!
//! One tokio task per unit sleeps until the deadline and then runs a
//! callback. Arming a unit again aborts its previous timer. Each timer
//! carries a generation so a timer that already woke up never removes its
//! replacement.

use dashmap::DashMap;
use stagehand_core::UnitId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Deadline timers keyed by unit id
#[derive(Debug, Default)]
pub struct DeadlineTimers {
    armed: DashMap<UnitId, Armed>,
    generation: AtomicU64,
}

impl DeadlineTimers {
    /// No timers armed
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` for `id` after `delay`, replacing any armed timer
    ///
    /// Returns false without arming when no tokio runtime is available; the
    /// persisted deadline still covers the unit.
    pub fn arm<F>(self: &Arc<Self>, id: UnitId, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce(&UnitId) + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(unit = %id, "No runtime, deadline timer skipped");
            return false;
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::downgrade(self);
        let unit = id.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(timers) = timers.upgrade() {
                timers.armed.remove_if(&unit, |_, armed| armed.generation == generation);
            }
            on_fire(&unit);
        });

        if let Some(previous) = self.armed.insert(id, Armed { generation, handle }) {
            previous.handle.abort();
        }
        true
    }

    /// Abort the timer for `id`; returns whether one was armed
    pub fn cancel(&self, id: &UnitId) -> bool {
        match self.armed.remove(id) {
            Some((_, armed)) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Check if a timer is armed for `id`
    #[must_use]
    pub fn is_armed(&self, id: &UnitId) -> bool {
        self.armed.contains_key(id)
    }

    /// Number of armed timers
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Check if no timer is armed
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl Drop for DeadlineTimers {
    fn drop(&mut self) {
        for entry in self.armed.iter() {
            entry.value().handle.abort();
        }
    }
}
