//! Lease locks over named resources
//!
//! A lease is a small JSON file `<key>.lock` in the locks directory naming
//! its holder and expiry. Properties:
//! - Publication is atomic: the lease is written to a temp file and
//!   hard-linked into place, which fails if any lease file already exists.
//! - Expired or unreadable lease files are evicted by renaming them to a
//!   unique tombstone first, so two processes can never both delete and
//!   replace the same stale lease.
//! - Release verifies the holder; a lease is never removed by someone else
//!   unless forced.
//!
//! Leases are advisory. Every read-modify-write of a shared document in the
//! kernel runs under one.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_core::{after_ms, SharedClock};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use ulid::Ulid;

const LOCK_EXTENSION: &str = "lock";

/// Publication attempts before giving up on a contended key
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Lease errors
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Another holder owns an unexpired lease
    #[error("lease {key} is held by {holder} until {expires_at}")]
    Conflict {
        /// Lease key
        key: String,
        /// Current holder
        holder: String,
        /// When the current lease lapses
        expires_at: DateTime<Utc>,
    },

    /// No lease exists for the key
    #[error("lease {key} is not held")]
    NotHeld {
        /// Lease key
        key: String,
    },

    /// The lease belongs to someone else
    #[error("lease {key} is held by {holder}, not {requester}")]
    WrongHolder {
        /// Lease key
        key: String,
        /// Actual holder
        holder: String,
        /// Who asked
        requester: String,
    },

    /// Filesystem failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// Check if waiting and retrying may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A published lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Resource key
    pub key: String,
    /// Holder identity
    pub holder: String,
    /// Acquisition time
    pub acquired_at: DateTime<Utc>,
    /// Time to live in milliseconds
    pub ttl_ms: u64,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Milliseconds until expiry, negative once lapsed
    #[inline]
    #[must_use]
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_milliseconds()
    }

    fn conflict(&self) -> LeaseError {
        LeaseError::Conflict {
            key: self.key.clone(),
            holder: self.holder.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Current state of a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Nobody holds an unexpired lease
    Free,
    /// Held by `holder`
    Held {
        /// Holder identity
        holder: String,
        /// Expiry time
        expires_at: DateTime<Utc>,
        /// Milliseconds until expiry
        remaining_ms: i64,
    },
}

/// One entry of [`LeaseLock::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseListing {
    /// Parsable lease file
    Valid {
        /// The lease
        #[serde(flatten)]
        lease: Lease,
        /// Lapsed at listing time
        expired: bool,
        /// Milliseconds until expiry
        remaining_ms: i64,
    },
    /// Lease file that does not parse
    Invalid {
        /// File name
        file: String,
        /// Parse error
        error: String,
    },
}

enum Contents {
    Missing,
    Corrupt(String),
    Valid(Lease),
}

/// Lease lock manager over one locks directory
#[derive(Debug, Clone)]
pub struct LeaseLock {
    dir: PathBuf,
    clock: SharedClock,
}

impl LeaseLock {
    /// Manage leases stored in `dir`
    #[inline]
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    /// Locks directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Acquire `key` for `holder` for `ttl_ms` milliseconds
    ///
    /// Succeeds when no lease exists or the existing one has expired (or is
    /// unreadable). A live lease held by anyone, including `holder` itself,
    /// is a conflict.
    ///
    /// # Errors
    /// `LeaseError::Conflict` when a live lease exists, `LeaseError::Store`
    /// on filesystem failure.
    pub fn acquire(&self, key: &str, holder: &str, ttl_ms: u64) -> Result<Lease, LeaseError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let now = self.clock.now();
        let lease = Lease {
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            ttl_ms,
            expires_at: after_ms(now, ttl_ms),
        };
        let staged = self.stage(&lease)?;
        let path = self.path_for(key);

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match fs::hard_link(staged.path(), &path) {
                Ok(()) => {
                    tracing::debug!(key, holder, ttl_ms, "Lease acquired");
                    return Ok(lease);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StoreError::io(&path, e).into()),
            }

            match read_contents(&path)? {
                Contents::Missing => {}
                Contents::Valid(existing) if !existing.is_expired(now) => {
                    return Err(existing.conflict());
                }
                Contents::Valid(existing) => {
                    tracing::info!(
                        key,
                        previous_holder = %existing.holder,
                        "Evicting expired lease"
                    );
                    self.evict(&path, now)?;
                }
                Contents::Corrupt(reason) => {
                    tracing::warn!(key, %reason, "Evicting unreadable lease file");
                    self.evict(&path, now)?;
                }
            }
        }

        match read_contents(&path)? {
            Contents::Valid(existing) => Err(existing.conflict()),
            _ => Err(LeaseError::Conflict {
                key: key.to_string(),
                holder: "unknown".to_string(),
                expires_at: now,
            }),
        }
    }

    /// Release `key` held by `holder`
    ///
    /// An unreadable lease file is removed and reported as not held.
    ///
    /// # Errors
    /// `LeaseError::NotHeld` if no lease exists, `LeaseError::WrongHolder`
    /// if it belongs to someone else.
    pub fn release(&self, key: &str, holder: &str) -> Result<(), LeaseError> {
        let path = self.path_for(key);

        // Check without mutating first so a wrong holder leaves no trace.
        match read_contents(&path)? {
            Contents::Missing => return Err(not_held(key)),
            Contents::Corrupt(reason) => {
                tracing::warn!(key, %reason, "Removing unreadable lease file");
                remove_if_present(&path)?;
                return Err(not_held(key));
            }
            Contents::Valid(lease) if lease.holder != holder => {
                return Err(wrong_holder(key, &lease.holder, holder));
            }
            Contents::Valid(_) => {}
        }

        let Some((tombstone, contents)) = detach(&path)? else {
            return Err(not_held(key));
        };
        match contents {
            Contents::Valid(lease) if lease.holder != holder => {
                restore(&tombstone, &path);
                Err(wrong_holder(key, &lease.holder, holder))
            }
            _ => {
                remove_if_present(&tombstone)?;
                tracing::debug!(key, holder, "Lease released");
                Ok(())
            }
        }
    }

    /// Remove the lease on `key` regardless of holder, returning it
    ///
    /// # Errors
    /// `LeaseError::NotHeld` if no lease file exists.
    pub fn force_release(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
        let path = self.path_for(key);
        let Some((tombstone, contents)) = detach(&path)? else {
            return Err(not_held(key));
        };
        remove_if_present(&tombstone)?;
        let lease = match contents {
            Contents::Valid(lease) => Some(lease),
            _ => None,
        };
        tracing::warn!(
            key,
            holder = lease.as_ref().map_or("unknown", |l| l.holder.as_str()),
            "Lease force-released"
        );
        Ok(lease)
    }

    /// State of `key`; unreadable lease files are removed and reported free
    ///
    /// # Errors
    /// `LeaseError::Store` on filesystem failure.
    pub fn status(&self, key: &str) -> Result<LeaseStatus, LeaseError> {
        let path = self.path_for(key);
        let now = self.clock.now();
        match read_contents(&path)? {
            Contents::Missing => Ok(LeaseStatus::Free),
            Contents::Corrupt(reason) => {
                tracing::warn!(key, %reason, "Removing unreadable lease file");
                remove_if_present(&path)?;
                Ok(LeaseStatus::Free)
            }
            Contents::Valid(lease) if lease.is_expired(now) => Ok(LeaseStatus::Free),
            Contents::Valid(lease) => Ok(LeaseStatus::Held {
                remaining_ms: lease.remaining_ms(now),
                holder: lease.holder,
                expires_at: lease.expires_at,
            }),
        }
    }

    /// Every lease file in the directory, sorted by file name
    ///
    /// # Errors
    /// `LeaseError::Store` if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<LeaseListing>, LeaseError> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for path in self.lock_files()? {
            match read_contents(&path)? {
                Contents::Missing => {}
                Contents::Corrupt(error) => out.push(LeaseListing::Invalid {
                    file: file_name(&path),
                    error,
                }),
                Contents::Valid(lease) => out.push(LeaseListing::Valid {
                    expired: lease.is_expired(now),
                    remaining_ms: lease.remaining_ms(now),
                    lease,
                }),
            }
        }
        Ok(out)
    }

    /// Remove every expired or unreadable lease file, returning what was
    /// removed (keys for leases, file names for unreadable files)
    ///
    /// # Errors
    /// `LeaseError::Store` on filesystem failure.
    pub fn sweep_expired(&self) -> Result<Vec<String>, LeaseError> {
        let now = self.clock.now();
        let mut removed = Vec::new();
        for path in self.lock_files()? {
            let label = match read_contents(&path)? {
                Contents::Valid(lease) if lease.is_expired(now) => lease.key,
                Contents::Corrupt(_) => file_name(&path),
                _ => continue,
            };
            match self.evict(&path, now) {
                Ok(()) => removed.push(label),
                // Re-acquired between the read and the eviction.
                Err(LeaseError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Swept expired leases");
        }
        Ok(removed)
    }

    /// Acquire `key` and release it when the guard drops
    ///
    /// # Errors
    /// As [`Self::acquire`].
    pub fn guard(&self, key: &str, holder: &str, ttl_ms: u64) -> Result<LeaseGuard<'_>, LeaseError> {
        let lease = self.acquire(key, holder, ttl_ms)?;
        Ok(LeaseGuard {
            lock: self,
            lease,
            released: false,
        })
    }

    /// Run `f` while holding `key`; the lease is released on every exit path
    ///
    /// # Errors
    /// Acquisition failures converted into `E`, or the error of `f`.
    pub fn with_lease<T, E, F>(&self, key: &str, holder: &str, ttl_ms: u64, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<LeaseError>,
    {
        let _guard = self.guard(key, holder, ttl_ms)?;
        f()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{LOCK_EXTENSION}", encode_key(key)))
    }

    fn stage(&self, lease: &Lease) -> Result<NamedTempFile, StoreError> {
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let body = serde_json::to_vec_pretty(lease).map_err(|source| StoreError::Encode {
            path: self.path_for(&lease.key),
            source,
        })?;
        tmp.write_all(&body)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        Ok(tmp)
    }

    /// Remove a stale lease file through a tombstone
    ///
    /// If a live lease was published between the caller's read and the
    /// rename, it is linked back and reported as a conflict.
    fn evict(&self, path: &Path, now: DateTime<Utc>) -> Result<(), LeaseError> {
        let Some((tombstone, contents)) = detach(path)? else {
            return Ok(());
        };
        if let Contents::Valid(lease) = contents {
            if !lease.is_expired(now) {
                restore(&tombstone, path);
                return Err(lease.conflict());
            }
        }
        remove_if_present(&tombstone)?;
        Ok(())
    }

    fn lock_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == LOCK_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Holds a lease until dropped or explicitly released
#[must_use = "dropping the guard releases the lease"]
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    lock: &'a LeaseLock,
    lease: Lease,
    released: bool,
}

impl LeaseGuard<'_> {
    /// The held lease
    #[inline]
    #[must_use]
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Release now and report the outcome
    ///
    /// # Errors
    /// As [`LeaseLock::release`].
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.lock.release(&self.lease.key, &self.lease.holder)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release(&self.lease.key, &self.lease.holder) {
            tracing::warn!(key = %self.lease.key, error = %e, "Failed to release lease");
        }
    }
}

/// Map a key onto a safe file stem
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes
/// `%XX`, so distinct keys never share a lock file. The empty key maps to
/// `%`, which no other key produces.
fn encode_key(key: &str) -> String {
    if key.is_empty() {
        return "%".to_string();
    }
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

fn read_contents(path: &Path) -> Result<Contents, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(match serde_json::from_slice(&bytes) {
            Ok(lease) => Contents::Valid(lease),
            Err(e) => Contents::Corrupt(e.to_string()),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Contents::Missing),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Rename `path` to a unique tombstone and read what was moved
fn detach(path: &Path) -> Result<Option<(PathBuf, Contents)>, StoreError> {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.stale", Ulid::new()));
    let tombstone = PathBuf::from(name);
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    }
    let contents = read_contents(&tombstone)?;
    Ok(Some((tombstone, contents)))
}

/// Put a detached lease back; if the slot was taken meanwhile the newer
/// lease wins and the tombstone is dropped
fn restore(tombstone: &Path, path: &Path) {
    if let Err(e) = fs::hard_link(tombstone, path) {
        tracing::warn!(path = %path.display(), error = %e, "Could not restore detached lease");
    }
    if let Err(e) = fs::remove_file(tombstone) {
        tracing::warn!(path = %tombstone.display(), error = %e, "Could not remove lease tombstone");
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn not_held(key: &str) -> LeaseError {
    LeaseError::NotHeld {
        key: key.to_string(),
    }
}

fn wrong_holder(key: &str, holder: &str, requester: &str) -> LeaseError {
    LeaseError::WrongHolder {
        key: key.to_string(),
        holder: holder.to_string(),
        requester: requester.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use stagehand_core::ManualClock;

    fn fixture() -> (tempfile::TempDir, ManualClock, LeaseLock) {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let lock = LeaseLock::new(dir.path().join("locks"), clock.shared());
        (dir, clock, lock)
    }

    #[test]
    fn acquire_then_conflict_then_release() {
        let (_dir, _clock, lock) = fixture();

        let lease = lock.acquire("project-state", "a", 30_000).unwrap();
        assert_eq!(lease.holder, "a");

        let err = lock.acquire("project-state", "b", 30_000).unwrap_err();
        assert!(matches!(err, LeaseError::Conflict { ref holder, .. } if holder == "a"));
        assert!(err.is_retryable());

        lock.release("project-state", "a").unwrap();
        lock.acquire("project-state", "b", 30_000).unwrap();
    }

    #[test]
    fn holder_cannot_reacquire_its_own_live_lease() {
        let (_dir, _clock, lock) = fixture();
        lock.acquire("k", "a", 30_000).unwrap();
        assert!(matches!(
            lock.acquire("k", "a", 30_000),
            Err(LeaseError::Conflict { .. })
        ));
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let (_dir, clock, lock) = fixture();
        lock.acquire("k", "a", 1_000).unwrap();

        clock.advance_ms(1_000);

        let lease = lock.acquire("k", "b", 1_000).unwrap();
        assert_eq!(lease.holder, "b");
        assert!(matches!(
            lock.release("k", "a"),
            Err(LeaseError::WrongHolder { ref holder, .. }) if holder == "b"
        ));
    }

    #[test]
    fn release_by_wrong_holder_keeps_lease() {
        let (_dir, _clock, lock) = fixture();
        lock.acquire("k", "a", 30_000).unwrap();

        assert!(matches!(
            lock.release("k", "b"),
            Err(LeaseError::WrongHolder { .. })
        ));
        assert!(matches!(lock.status("k").unwrap(), LeaseStatus::Held { ref holder, .. } if holder == "a"));
    }

    #[test]
    fn release_without_lease_is_not_held() {
        let (_dir, _clock, lock) = fixture();
        assert!(matches!(
            lock.release("k", "a"),
            Err(LeaseError::NotHeld { .. })
        ));
    }

    #[test]
    fn corrupted_lease_file_is_replaced() {
        let (_dir, _clock, lock) = fixture();
        fs::create_dir_all(lock.dir()).unwrap();
        fs::write(lock.dir().join("k.lock"), b"garbage").unwrap();

        let lease = lock.acquire("k", "a", 30_000).unwrap();
        assert_eq!(lease.holder, "a");
    }

    #[test]
    fn status_reports_free_after_expiry() {
        let (_dir, clock, lock) = fixture();
        assert_eq!(lock.status("k").unwrap(), LeaseStatus::Free);

        lock.acquire("k", "a", 500).unwrap();
        assert!(matches!(lock.status("k").unwrap(), LeaseStatus::Held { remaining_ms: 500, .. }));

        clock.advance_ms(600);
        assert_eq!(lock.status("k").unwrap(), LeaseStatus::Free);
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_dir, _clock, lock) = fixture();
        {
            let guard = lock.guard("k", "a", 30_000).unwrap();
            assert_eq!(guard.lease().key, "k");
        }
        assert_eq!(lock.status("k").unwrap(), LeaseStatus::Free);
    }

    #[test]
    fn with_lease_releases_on_error() {
        let (_dir, _clock, lock) = fixture();
        let result: Result<(), LeaseError> = lock.with_lease("k", "a", 30_000, || {
            Err(LeaseError::NotHeld { key: "inner".into() })
        });
        assert!(result.is_err());
        assert_eq!(lock.status("k").unwrap(), LeaseStatus::Free);
    }

    #[test]
    fn list_and_sweep() {
        let (_dir, clock, lock) = fixture();
        lock.acquire("short", "a", 100).unwrap();
        lock.acquire("long", "b", 60_000).unwrap();
        fs::write(lock.dir().join("broken.lock"), b"{").unwrap();

        clock.advance_ms(200);

        let listing = lock.list().unwrap();
        assert_eq!(listing.len(), 3);
        assert!(listing.iter().any(|l| matches!(l, LeaseListing::Invalid { file, .. } if file == "broken.lock")));

        let mut swept = lock.sweep_expired().unwrap();
        swept.sort();
        assert_eq!(swept, vec!["broken.lock".to_string(), "short".to_string()]);
        assert_eq!(lock.list().unwrap().len(), 1);
    }

    #[test]
    fn force_release_ignores_holder() {
        let (_dir, _clock, lock) = fixture();
        lock.acquire("k", "a", 30_000).unwrap();
        let removed = lock.force_release("k").unwrap().unwrap();
        assert_eq!(removed.holder, "a");
        assert_eq!(lock.status("k").unwrap(), LeaseStatus::Free);
    }

    #[test]
    fn keys_are_encoded() {
        assert_eq!(encode_key("agent-state"), "agent-state");
        assert_eq!(encode_key("../etc/passwd"), "%2E%2E%2Fetc%2Fpasswd");
        assert_eq!(encode_key(""), "%");
    }

    #[test]
    fn similar_keys_do_not_share_a_lease() {
        let (_dir, _clock, lock) = fixture();
        lock.acquire("a/b", "a", 30_000).unwrap();
        assert_eq!(lock.status("a_b").unwrap(), LeaseStatus::Free);

        lock.acquire("a_b", "a", 30_000).unwrap();
        lock.release("a/b", "a").unwrap();
        assert_eq!(lock.status("a/b").unwrap(), LeaseStatus::Free);
        assert!(matches!(lock.status("a_b").unwrap(), LeaseStatus::Held { .. }));
    }

    proptest! {
        #[test]
        fn encoded_keys_stay_inside_the_dir(key in ".{0,40}") {
            let stem = encode_key(&key);
            prop_assert!(!stem.is_empty());
            prop_assert!(!stem.starts_with('.'));
            prop_assert!(!stem.contains('/'));
            prop_assert!(!stem.contains('\\'));
        }

        #[test]
        fn distinct_keys_get_distinct_files(a in ".{0,12}", b in ".{0,12}") {
            prop_assume!(a != b);
            prop_assert_ne!(encode_key(&a), encode_key(&b));
        }
    }
}
