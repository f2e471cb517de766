//! Typed JSON documents
//!
//! Every write goes to a temp file in the target's directory and is then
//! renamed over the target, so readers see either the old or the new
//! document, never a torn one.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A JSON document of type `T` at a fixed path
#[derive(Debug)]
pub struct JsonDocument<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonDocument<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<T> JsonDocument<T> {
    /// Document at `path`
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Location on disk
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file exists
    #[inline]
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Load the document
    ///
    /// A missing file yields `T::default()`. A file that does not parse is
    /// moved aside to `<name>.corrupt`, replaced by a fresh default document,
    /// and reported with a warning; its history is lost.
    ///
    /// # Errors
    /// `StoreError::Io` if the file cannot be read or the fresh document
    /// cannot be written.
    pub fn load(&self) -> Result<T, StoreError> {
        let Some(bytes) = self.read_bytes()? else {
            return Ok(T::default());
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Corrupted document, reinitializing to an empty schema"
                );
                let backup = self.corrupt_backup_path();
                if let Err(e) = fs::rename(&self.path, &backup) {
                    tracing::warn!(path = %backup.display(), error = %e, "Could not keep corrupted copy");
                }
                let fresh = T::default();
                self.save(&fresh)?;
                Ok(fresh)
            }
        }
    }

    /// Load a document that must already exist
    ///
    /// # Errors
    /// `StoreError::Missing` if the file is absent, otherwise as [`Self::load`].
    pub fn load_existing(&self) -> Result<T, StoreError> {
        if !self.exists() {
            return Err(StoreError::Missing {
                path: self.path.clone(),
            });
        }
        self.load()
    }

    /// Atomically replace the document
    ///
    /// # Errors
    /// `StoreError::Io` on filesystem failure, `StoreError::Encode` if `doc`
    /// cannot be serialized.
    pub fn save(&self, doc: &T) -> Result<(), StoreError> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, doc).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        tmp.write_all(b"\n")
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;

        tracing::debug!(path = %self.path.display(), "Document saved");
        Ok(())
    }

    /// Read, mutate, write
    ///
    /// # Errors
    /// Propagates load and save failures.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let mut doc = self.load()?;
        let out = f(&mut doc);
        self.save(&doc)?;
        Ok(out)
    }

    /// Read, mutate, write; nothing is written when `f` fails
    ///
    /// # Errors
    /// The error of `f`, or a load/save failure converted into `E`.
    pub fn try_update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.save(&doc)?;
        Ok(out)
    }

    /// [`Self::try_update`] on a document that must already exist
    ///
    /// # Errors
    /// `StoreError::Missing` (converted into `E`) if the file is absent.
    pub fn try_update_existing<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        if !self.exists() {
            return Err(StoreError::Missing {
                path: self.path.clone(),
            }
            .into());
        }
        self.try_update(f)
    }

    fn read_bytes(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn corrupt_backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        entries: BTreeMap<String, u32>,
    }

    fn doc_in(dir: &tempfile::TempDir) -> JsonDocument<Ledger> {
        JsonDocument::new(dir.path().join("nested").join("ledger.json"))
    }

    #[test]
    fn missing_document_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_in(&dir);
        assert_eq!(doc.load().unwrap(), Ledger::default());
        assert!(!doc.exists());
    }

    #[test]
    fn load_existing_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let err = doc_in(&dir).load_existing().unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn update_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_in(&dir);

        doc.update(|l| l.entries.insert("a".into(), 1)).unwrap();
        doc.update(|l| *l.entries.entry("a".into()).or_default() += 1)
            .unwrap();

        assert_eq!(doc.load().unwrap().entries["a"], 2);
    }

    #[test]
    fn failed_try_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_in(&dir);
        doc.update(|l| l.entries.insert("kept".into(), 7)).unwrap();

        let result: Result<(), StoreError> = doc.try_update(|l| {
            l.entries.clear();
            Err(StoreError::Missing {
                path: PathBuf::from("x"),
            })
        });

        assert!(result.is_err());
        assert_eq!(doc.load().unwrap().entries["kept"], 7);
    }

    #[test]
    fn try_update_existing_refuses_to_create() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_in(&dir);

        let err = doc
            .try_update_existing(|l| Ok::<_, StoreError>(l.entries.len()))
            .unwrap_err();

        assert!(err.is_missing());
        assert!(!doc.exists());
    }

    #[test]
    fn corrupted_document_is_reinitialized_and_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let doc = doc_in(&dir);
        fs::create_dir_all(doc.path().parent().unwrap()).unwrap();
        fs::write(doc.path(), b"{ not json").unwrap();

        assert_eq!(doc.load().unwrap(), Ledger::default());

        let reread: Ledger = serde_json::from_slice(&fs::read(doc.path()).unwrap()).unwrap();
        assert_eq!(reread, Ledger::default());
        assert!(doc.path().with_file_name("ledger.json.corrupt").exists());
    }
}
