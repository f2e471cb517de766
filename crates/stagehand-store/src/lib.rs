//! Stagehand Store - file-backed persistence
//!
//! Provides:
//! - [`JsonDocument`]: typed JSON documents with atomic replace-on-write and
//!   recovery from corrupted files
//! - [`StoreLayout`]: every persisted path, derived from one project root
//! - [`LeaseLock`]: advisory, identity-checked, time-bounded locks over
//!   named resources, the only concurrency primitive of the kernel
//! - [`Store`]: the handle components share (layout, leases, clock and the
//!   caller's lease identity)
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand_store::{keys, Store};
//!
//! let store = Store::open("/srv/project", SystemClock::shared());
//! store.locked(keys::PROJECT_STATE, || {
//!     store.project_state().update(|state| state.unblock())?;
//!     Ok::<_, GateError>(())
//! })?;
//! ```

pub mod document;
pub mod error;
pub mod handle;
pub mod layout;
pub mod lease;

pub use document::JsonDocument;
pub use error::StoreError;
pub use handle::{keys, Store};
pub use layout::StoreLayout;
pub use lease::{Lease, LeaseError, LeaseGuard, LeaseListing, LeaseLock, LeaseStatus};

/// Default lease time-to-live
pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
