//! Engine configuration.
//!
//! # Responsibility
//! - Carry tunables shared by sessions, serializers and migration.
//! - Parse from JSON with defaults for every omitted key.
//!
//! # Invariants
//! - A config returned by `from_json_str` has passed `validate`.

use crate::backend::LoadDomain;
use crate::serial::sort::ExternalSorter;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const DEFAULT_SORT_MEMORY_BUDGET_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_UNDO_DEPTH: usize = 100;
pub const DEFAULT_REPOSITORY_VERSION: &str = "7000072";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// In-memory bytes the external sort buffers before spilling a run.
    pub sort_memory_budget_bytes: usize,
    /// Directory for spill runs; system temp directory when unset.
    pub spill_dir: Option<PathBuf>,
    /// Completed tasks kept on the undo stack; oldest are dropped.
    pub undo_depth: usize,
    /// Domain materialized eagerly when a session opens.
    pub startup_domain: LoadDomain,
    /// Value written to the document root's `version` attribute.
    pub repository_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sort_memory_budget_bytes: DEFAULT_SORT_MEMORY_BUDGET_BYTES,
            spill_dir: None,
            undo_depth: DEFAULT_UNDO_DEPTH,
            startup_domain: LoadDomain::Everything,
            repository_version: DEFAULT_REPOSITORY_VERSION.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.undo_depth == 0 {
            return Err(ConfigError::Invalid(
                "undo_depth must be at least 1".to_string(),
            ));
        }
        let version = self.repository_version.trim();
        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "repository_version must be numeric, got `{}`",
                self.repository_version
            )));
        }
        if let Some(dir) = &self.spill_dir {
            if !dir.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "spill_dir `{}` is not a directory",
                    dir.display()
                )));
            }
        }
        if let LoadDomain::Classes(classes) = &self.startup_domain {
            if classes.iter().any(|class| class.trim().is_empty()) {
                return Err(ConfigError::Invalid(
                    "startup_domain class names cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fresh external sorter honouring the budget and spill directory.
    pub fn sorter(&self) -> ExternalSorter {
        ExternalSorter::new(self.sort_memory_budget_bytes).with_spill_dir(self.spill_dir.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "invalid engine config json: {message}"),
            Self::Invalid(message) => write!(f, "invalid engine config: {message}"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig, DEFAULT_UNDO_DEPTH};
    use crate::backend::LoadDomain;

    #[test]
    fn omitted_keys_take_defaults() {
        let config = EngineConfig::from_json_str(r#"{"undo_depth": 5}"#).unwrap();
        assert_eq!(config.undo_depth, 5);
        assert_eq!(config.startup_domain, LoadDomain::Everything);
        assert_eq!(
            EngineConfig::from_json_str("{}").unwrap().undo_depth,
            DEFAULT_UNDO_DEPTH
        );
    }

    #[test]
    fn class_domain_parses_from_json() {
        let config =
            EngineConfig::from_json_str(r#"{"startup_domain": {"classes": ["LexEntry"]}}"#)
                .unwrap();
        assert_eq!(
            config.startup_domain,
            LoadDomain::Classes(vec!["LexEntry".to_string()])
        );
    }

    #[test]
    fn rejects_zero_undo_depth_and_unknown_keys() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"undo_depth": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"bogus": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
