use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use relation_order_core::{IndexAttribute, CANONICAL_START_INDEX};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REORDER_QUIET_PERIOD_MS: u64 = 300;

/// Ordering settings shared by the CLI and the service.
///
/// ```yaml
/// index_attribute:
///   id: index-attribute
///   name: Index
/// initial_index: a
/// reorder_quiet_period_ms: 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OrderingConfig {
    pub index_attribute: IndexAttribute,
    /// Index value seeded on every newly added relation.
    pub initial_index: String,
    pub reorder_quiet_period_ms: u64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            index_attribute: IndexAttribute::default(),
            initial_index: CANONICAL_START_INDEX.to_string(),
            reorder_quiet_period_ms: DEFAULT_REORDER_QUIET_PERIOD_MS,
        }
    }
}

impl OrderingConfig {
    /// Parse and validate a YAML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or a value is invalid.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse ordering config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read ordering config {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid ordering config {}", path.display()))
    }

    /// Load `path` when given, defaults otherwise.
    ///
    /// # Errors
    /// See [`OrderingConfig::load`].
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    #[must_use]
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.reorder_quiet_period_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.index_attribute.id.trim().is_empty() {
            return Err(anyhow!("index_attribute.id must not be empty"));
        }
        if self.initial_index.is_empty() {
            return Err(anyhow!("initial_index must not be empty"));
        }
        Ok(())
    }
}
