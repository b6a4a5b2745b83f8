//! Conflict-resolution configuration stored at `<dir>/treecr.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the configuration inside its directory
pub const CONFIG_FILE_NAME: &str = "treecr.json";

/// How cycle-breaking symlinks spell their target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkStyle {
    /// `../../a`, relative to the directory holding the link
    #[default]
    Relative,
    /// `/a`, from the tree root
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrConfig {
    /// Publish attempts before a race is reported as fatal.
    #[serde(default = "default_max_publish_retries")]
    pub max_publish_retries: u32,
    /// Word placed in conflict-copy names.
    #[serde(default = "default_conflict_tag")]
    pub conflict_tag: String,
    #[serde(default)]
    pub symlink_style: SymlinkStyle,
    /// Check the merged tree for cycles and dangling entries before publishing.
    #[serde(default = "default_true")]
    pub validate_merged_tree: bool,
}

fn default_max_publish_retries() -> u32 {
    3
}

fn default_conflict_tag() -> String {
    "conflict".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CrConfig {
    fn default() -> Self {
        Self {
            max_publish_retries: default_max_publish_retries(),
            conflict_tag: default_conflict_tag(),
            symlink_style: SymlinkStyle::default(),
            validate_merged_tree: true,
        }
    }
}

impl CrConfig {
    /// Load config from a directory; a missing file yields defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = Self::file_path(dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        let config: CrConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        if config.max_publish_retries == 0 {
            anyhow::bail!("max_publish_retries must be at least 1");
        }
        Ok(config)
    }

    /// Save config to a directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let config_path = Self::file_path(dir);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CrConfig::load(dir.path()).unwrap();
        assert_eq!(config, CrConfig::default());
        assert_eq!(config.max_publish_retries, 3);
        assert_eq!(config.symlink_style, SymlinkStyle::Relative);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config = CrConfig {
            max_publish_retries: 7,
            conflict_tag: "clash".into(),
            symlink_style: SymlinkStyle::Absolute,
            validate_merged_tree: false,
        };
        config.save(dir.path()).unwrap();
        assert_eq!(CrConfig::load(dir.path()).unwrap(), config);
        assert!(!dir.path().join("treecr.tmp").exists());
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(CrConfig::file_path(dir.path()), r#"{"conflict_tag": "dup"}"#).unwrap();
        let config = CrConfig::load(dir.path()).unwrap();
        assert_eq!(config.conflict_tag, "dup");
        assert_eq!(config.max_publish_retries, 3);
        assert!(config.validate_merged_tree);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(CrConfig::file_path(dir.path()), r#"{"max_publish_retries": 0}"#).unwrap();
        assert!(CrConfig::load(dir.path()).is_err());
    }
}
