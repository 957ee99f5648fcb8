//! Repository configuration
//!
//! Stored as JSON at `<repo>/config.json`. A missing file means defaults;
//! missing fields inside an existing file fall back to their defaults too.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::storage::{RepoError, Result};

pub const CONFIG_FILE: &str = "config.json";

/// Repository-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Longest accepted resource path, in characters
    pub max_path_length: usize,
    /// Project marker written into content entries
    pub project: String,
    /// Entries held by the live read cache
    pub cache_capacity: usize,
    pub history: HistoryConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_path_length: 1024,
            project: "offline".to_string(),
            cache_capacity: 1024,
            history: HistoryConfig::default(),
        }
    }
}

/// Publish history retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Snapshots kept per structure id
    pub max_versions: usize,
    /// Snapshots kept once the item has been deleted
    pub keep_deleted: usize,
    /// Write compressed copies of published content
    pub archive_content: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_versions: 10,
            keep_deleted: 1,
            archive_content: true,
        }
    }
}

impl RepositoryConfig {
    /// Load the config from a repository path
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_path = repo_path.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: RepositoryConfig = serde_json::from_str(&data).map_err(|e| {
            RepoError::Serialization(format!("Failed to parse {:?}: {}", config_path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config to a repository path
    pub fn save(&self, repo_path: &Path) -> Result<()> {
        let config_path = repo_path.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_path_length == 0 {
            return Err(RepoError::InvalidInput("max_path_length must be positive".into()));
        }
        if self.cache_capacity == 0 {
            return Err(RepoError::InvalidInput("cache_capacity must be positive".into()));
        }
        Ok(())
    }
}
