//! Artifact validators
//!
//! Validators are external collaborators: given an artifact payload and the
//! current project state they return a pass/fail [`Verdict`] plus issues.
//! The gate interprets only the verdict.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::{Issue, ProjectState};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of validating one artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// No blocking issue
    pub passed: bool,
    /// Findings, blocking or not
    pub issues: Vec<Issue>,
}

impl Verdict {
    /// Verdict derived from issues: passes when none is an error
    #[must_use]
    pub fn from_issues(issues: Vec<Issue>) -> Self {
        Self {
            passed: !issues.iter().any(Issue::is_error),
            issues,
        }
    }

    /// Blocking issues
    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    /// Informational issues
    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| !i.is_error())
    }
}

/// Validates artifacts of one kind
pub trait ArtifactValidator: Send + Sync {
    /// Check `payload` in the context of `state`
    fn validate(&self, payload: &Value, state: &ProjectState) -> Verdict;
}

impl<F> ArtifactValidator for F
where
    F: Fn(&Value, &ProjectState) -> Verdict + Send + Sync,
{
    fn validate(&self, payload: &Value, state: &ProjectState) -> Verdict {
        self(payload, state)
    }
}

/// Requires a fixed set of top-level sections
///
/// A section may sit at the top level or under `content`. Empty strings,
/// arrays and objects count as missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredSections {
    sections: Vec<String>,
}

impl RequiredSections {
    /// Validator for `sections`
    #[must_use]
    pub fn new(sections: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
        }
    }
}

impl ArtifactValidator for RequiredSections {
    fn validate(&self, payload: &Value, _state: &ProjectState) -> Verdict {
        let issues = self
            .sections
            .iter()
            .filter(|s| {
                let direct = payload.get(s.as_str());
                let nested = payload.get("content").and_then(|c| c.get(s.as_str()));
                !direct.or(nested).is_some_and(is_present)
            })
            .map(|s| {
                Issue::error(
                    s.as_str(),
                    format!("Missing required section: {}", s.replace('_', " ")),
                )
            })
            .collect();
        Verdict::from_issues(issues)
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Validators keyed by artifact kind
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn ArtifactValidator>>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.validators.keys().collect();
        kinds.sort();
        f.debug_struct("ValidatorRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl ValidatorRegistry {
    /// Empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validator` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: impl Into<String>, validator: impl ArtifactValidator + 'static) {
        self.validators.insert(kind.into(), Arc::new(validator));
    }

    /// Builder form of [`Self::register`]
    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, validator: impl ArtifactValidator + 'static) -> Self {
        self.register(kind, validator);
        self
    }

    /// Validator for `kind`
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ArtifactValidator>> {
        self.validators.get(kind)
    }

    /// Registered kinds, sorted
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.validators.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
