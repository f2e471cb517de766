//! Kernel configuration loading
//!
//! The built-in document carries every stock table. A project file at
//! `.stagehand/config.yaml` (or an explicit `--config` path) replaces whole
//! sections; sections it leaves out keep their built-in value.

use crate::error::KernelError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use stagehand_agents::UnitTypeRegistry;
use stagehand_escalation::PolicyTable;
use stagehand_gate::{GateTable, RequiredSections, ValidatorRegistry};
use stagehand_recovery::RecoveryConfig;
use std::path::{Path, PathBuf};

const BUILTIN: &str = include_str!("default.yaml");

/// Artifact kind checked on registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKind {
    /// Sections the payload must carry
    #[serde(default)]
    pub required_sections: Vec<String>,
}

/// Where a configuration came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "path", rename_all = "snake_case")]
pub enum ConfigSource {
    /// Only the built-in document
    Builtin,
    /// A project or explicit file over the built-in document
    File(PathBuf),
}

/// Complete kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Unit types the lifecycle manager can spawn
    pub unit_types: UnitTypeRegistry,

    /// Ordered stage gates
    pub gates: GateTable,

    /// Escalation policy per stage
    pub escalation: PolicyTable,

    /// Failure rules, action steps and thresholds
    pub recovery: RecoveryConfig,

    /// Artifact kinds with a section validator
    #[serde(default)]
    pub artifacts: IndexMap<String, ArtifactKind>,

    /// Lease time-to-live for kernel writes
    pub lease_ttl_ms: u64,

    /// Factor over the timeout after which a live unit is reported stale
    pub stale_multiplier: f64,

    /// Interval of the deadline sweep in `agents watch`
    pub sweep_interval_ms: u64,
}

/// Project file: every section optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Overlay {
    unit_types: Option<UnitTypeRegistry>,
    gates: Option<GateTable>,
    escalation: Option<PolicyTable>,
    recovery: Option<RecoveryConfig>,
    artifacts: Option<IndexMap<String, ArtifactKind>>,
    lease_ttl_ms: Option<u64>,
    stale_multiplier: Option<f64>,
    sweep_interval_ms: Option<u64>,
}

impl Overlay {
    fn apply(self, base: KernelConfig) -> KernelConfig {
        KernelConfig {
            unit_types: self.unit_types.unwrap_or(base.unit_types),
            gates: self.gates.unwrap_or(base.gates),
            escalation: self.escalation.unwrap_or(base.escalation),
            recovery: self.recovery.unwrap_or(base.recovery),
            artifacts: self.artifacts.unwrap_or(base.artifacts),
            lease_ttl_ms: self.lease_ttl_ms.unwrap_or(base.lease_ttl_ms),
            stale_multiplier: self.stale_multiplier.unwrap_or(base.stale_multiplier),
            sweep_interval_ms: self.sweep_interval_ms.unwrap_or(base.sweep_interval_ms),
        }
    }
}

impl KernelConfig {
    /// The built-in configuration
    ///
    /// # Errors
    /// `KernelError::Config` if the embedded document does not parse.
    pub fn builtin() -> Result<Self, KernelError> {
        serde_yaml::from_str(BUILTIN).map_err(|e| KernelError::Config {
            path: None,
            reason: e.to_string(),
        })
    }

    /// Built-in configuration overlaid with the file at `path`
    ///
    /// # Errors
    /// Unreadable file, YAML that does not parse, or an invalid result.
    pub fn load(path: &Path) -> Result<Self, KernelError> {
        let content = std::fs::read_to_string(path).map_err(|source| KernelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            KernelError::Config { path: None, reason } => KernelError::Config {
                path: Some(path.to_path_buf()),
                reason,
            },
            other => other,
        })
    }

    /// Built-in configuration overlaid with a YAML document
    ///
    /// # Errors
    /// YAML that does not parse, or an invalid result.
    pub fn from_yaml(content: &str) -> Result<Self, KernelError> {
        let overlay: Overlay = serde_yaml::from_str(content).map_err(|e| KernelError::Config {
            path: None,
            reason: e.to_string(),
        })?;
        let config = overlay.apply(Self::builtin()?);
        config.validate()?;
        Ok(config)
    }

    /// Configuration for the project at `root`
    ///
    /// `explicit` wins over `<root>/.stagehand/config.yaml`, which wins over
    /// the built-in document.
    ///
    /// # Errors
    /// See [`Self::load`].
    pub fn resolve(root: &Path, explicit: Option<&Path>) -> Result<(Self, ConfigSource), KernelError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let project = stagehand_store::StoreLayout::new(root).config_file();
                project.exists().then_some(project)
            }
        };

        match path {
            Some(path) => {
                let config = Self::load(&path)?;
                tracing::debug!(path = %path.display(), "Configuration loaded");
                Ok((config, ConfigSource::File(path)))
            }
            None => Ok((Self::builtin()?, ConfigSource::Builtin)),
        }
    }

    /// Check cross-table consistency
    ///
    /// # Errors
    /// `KernelError::Config` for a dangling stage link, an escalation policy
    /// for an unknown stage or a non-positive stale multiplier.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.gates.check_links().map_err(|e| invalid(e.to_string()))?;

        if let Some((stage, _)) = self.escalation.iter().find(|(s, _)| !self.gates.contains(s)) {
            return Err(invalid(format!("escalation policy for unknown stage {stage}")));
        }
        if !(self.stale_multiplier.is_finite() && self.stale_multiplier > 0.0) {
            return Err(invalid(format!(
                "stale_multiplier must be positive, got {}",
                self.stale_multiplier
            )));
        }
        if self.recovery.failure_types.get(stagehand_recovery::rules::UNKNOWN).is_none() {
            return Err(invalid("failure_types must define UNKNOWN".to_string()));
        }
        Ok(())
    }

    /// Section validators for the configured artifact kinds
    #[must_use]
    pub fn validators(&self) -> ValidatorRegistry {
        self.artifacts
            .iter()
            .fold(ValidatorRegistry::new(), |registry, (kind, artifact)| {
                registry.with(kind.clone(), RequiredSections::new(artifact.required_sections.clone()))
            })
    }
}

fn invalid(reason: String) -> KernelError {
    KernelError::Config { path: None, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stagehand_core::StageId;
    use stagehand_recovery::RecoveryAction;

    #[test]
    fn builtin_carries_the_stock_tables() {
        let config = KernelConfig::builtin().unwrap();

        assert_eq!(config.unit_types.len(), 11);
        assert_eq!(config.gates.len(), 9);
        assert_eq!(config.escalation.len(), 8);
        assert_eq!(config.recovery.failure_types.iter().count(), 5);
        assert_eq!(config.lease_ttl_ms, 30_000);
        assert!((config.stale_multiplier - 2.0).abs() < f64::EPSILON);
        config.validate().unwrap();

        let coder = config.unit_types.get("coder").unwrap();
        assert_eq!((coder.timeout_ms, coder.max_retries), (900_000, 3));

        let closure = config.gates.stage(&StageId::from("project_closure")).unwrap();
        assert!(closure.is_terminal());
        let dev = config
            .gates
            .stage(&StageId::from("phase_05_development_execution"))
            .unwrap();
        assert_eq!(dev.completion.as_ref().map(|c| c.max_iterations), Some(20));
    }

    #[test]
    fn failure_types_keep_declaration_order() {
        let config = KernelConfig::builtin().unwrap();
        let names: Vec<_> = config.recovery.failure_types.iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["BROKEN_BUILD", "VERIFICATION_FAILED", "CONTEXT_EXHAUSTED", "CIRCULAR_FIX", "UNKNOWN"]
        );
        assert_eq!(
            config.recovery.actions.get(&RecoveryAction::Rollback).map(Vec::len),
            Some(3)
        );
    }

    #[test]
    fn overlay_replaces_only_named_sections() {
        let config = KernelConfig::from_yaml(
            "stale_multiplier: 3.5\nunit_types:\n  solo:\n    name: Solo\n    execution_artifact: SOLO.md\n    timeout_ms: 1000\n    max_retries: 0\n",
        )
        .unwrap();

        assert!((config.stale_multiplier - 3.5).abs() < f64::EPSILON);
        assert_eq!(config.unit_types.names(), ["solo"]);
        assert_eq!(config.gates.len(), 9);
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let err = KernelConfig::from_yaml("gatez: {}\n").unwrap_err();
        assert!(matches!(err, KernelError::Config { .. }));
    }

    #[test]
    fn dangling_links_are_rejected() {
        let err = KernelConfig::from_yaml(
            "escalation: {}\ngates:\n  a:\n    approver: Lead\n    next: b\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown next stage b"));
    }

    #[test]
    fn resolve_prefers_the_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join(".stagehand");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("config.yaml"), "lease_ttl_ms: 5000\n").unwrap();
        let explicit = dir.path().join("other.yaml");
        std::fs::write(&explicit, "lease_ttl_ms: 7000\n").unwrap();

        let (config, source) = KernelConfig::resolve(dir.path(), None).unwrap();
        assert_eq!(config.lease_ttl_ms, 5000);
        assert_eq!(source, ConfigSource::File(project.join("config.yaml")));

        let (config, _) = KernelConfig::resolve(dir.path(), Some(&explicit)).unwrap();
        assert_eq!(config.lease_ttl_ms, 7000);

        let empty = tempfile::tempdir().unwrap();
        let (_, source) = KernelConfig::resolve(empty.path(), None).unwrap();
        assert_eq!(source, ConfigSource::Builtin);
    }

    #[test]
    fn validators_follow_the_artifact_section() {
        let config = KernelConfig::builtin().unwrap();
        let registry = config.validators();
        assert!(registry.kinds().contains(&"business_case"));
        assert_eq!(registry.kinds().len(), 5);
    }
}
