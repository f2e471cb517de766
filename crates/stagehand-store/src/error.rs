//! Storage errors

use std::path::{Path, PathBuf};

/// Failure reading or writing a persisted document
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document could not be encoded
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        /// Target file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A document that must already exist is absent
    #[error("document not found: {}", path.display())]
    Missing {
        /// Expected location
        path: PathBuf,
    },
}

impl StoreError {
    /// Wrap an IO error with the path it happened on
    #[inline]
    #[must_use]
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Check if the error means the document is absent
    #[inline]
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}
