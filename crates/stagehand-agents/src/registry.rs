//! Unit type registry

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A kind of unit that can be spawned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitType {
    /// Display name
    pub name: String,
    /// What the unit does
    #[serde(default)]
    pub description: String,
    /// File the executor loads, relative to the project root
    pub execution_artifact: PathBuf,
    /// Default deadline
    pub timeout_ms: u64,
    /// Retries allowed after the first failure
    pub max_retries: u32,
}

/// Unit types keyed by type name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitTypeRegistry {
    types: IndexMap<String, UnitType>,
}

impl UnitTypeRegistry {
    /// Registry from `(name, type)` pairs
    #[must_use]
    pub fn new(types: impl IntoIterator<Item = (String, UnitType)>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }

    /// Type by name
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UnitType> {
        self.types.get(name)
    }

    /// Registered type names in declaration order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// All types in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &UnitType)> {
        self.types.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of types
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if no type is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) const CODER_PROMPT: &str = "prompts/CODING.md";

    /// `coder` (900000 ms, 3 retries) and `planner` (60000 ms, 0 retries)
    pub(crate) fn registry() -> UnitTypeRegistry {
        UnitTypeRegistry::new([
            (
                "coder".to_string(),
                UnitType {
                    name: "Coding Agent".to_string(),
                    description: "Makes incremental progress".to_string(),
                    execution_artifact: CODER_PROMPT.into(),
                    timeout_ms: 900_000,
                    max_retries: 3,
                },
            ),
            (
                "planner".to_string(),
                UnitType {
                    name: "Planning Agent".to_string(),
                    description: String::new(),
                    execution_artifact: "prompts/PLANNING.md".into(),
                    timeout_ms: 60_000,
                    max_retries: 0,
                },
            ),
        ])
    }
}
