//! Rule-set providers.
//!
//! A provider hands the engine the complete, ordered collection of enabled,
//! non-deleted rules. Anything invalid is rejected here, before it can become
//! the active rule set.

use crate::config::{is_json_document, LoadError, Rule, RuleSetConfig};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of the active rule collection.
#[async_trait]
pub trait RuleSetProvider: Send + Sync {
    /// Load the current rules in declaration order.
    async fn load(&self) -> Result<Vec<Rule>, LoadError>;
}

/// Rules read from a YAML or JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileRuleSetProvider {
    path: PathBuf,
}

impl FileRuleSetProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the whole document.
    pub async fn load_config(&self) -> Result<RuleSetConfig, LoadError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let config = if is_json_document(&self.path) {
            RuleSetConfig::from_json_str(&content)?
        } else {
            RuleSetConfig::from_yaml_str(&content)?
        };
        debug!(path = %self.path.display(), rules = config.rules.len(), "Rule document loaded");
        Ok(config)
    }
}

#[async_trait]
impl RuleSetProvider for FileRuleSetProvider {
    async fn load(&self) -> Result<Vec<Rule>, LoadError> {
        Ok(self.load_config().await?.active_rules())
    }
}

/// A fixed in-memory rule collection.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSetProvider {
    rules: Vec<Rule>,
}

impl StaticRuleSetProvider {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleSetProvider for StaticRuleSetProvider {
    async fn load(&self) -> Result<Vec<Rule>, LoadError> {
        Ok(self.rules.iter().filter(|r| r.is_active()).cloned().collect())
    }
}
