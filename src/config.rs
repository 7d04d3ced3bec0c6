use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub target: TargetConfig,
    pub legacy: LegacyConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Path to the SQLite target store.
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LegacyConfig {
    /// Directory holding the legacy store export
    /// (`content.jsonl`, `catalog.jsonl`, `importers.jsonl`).
    pub export_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MigrationConfig {
    /// Extraction batch size. Bounds how many legacy records are held in
    /// memory at once during pre-migration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Capacity of the bounded queues between pipeline stages.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Content types to migrate. Empty means every registered type.
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_depth: default_queue_depth(),
            content_types: Vec::new(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

fn default_queue_depth() -> usize {
    64
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let raw = r#"
            [target]
            db_path = "/tmp/ferry.sqlite"

            [legacy]
            export_dir = "/tmp/export"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.queue_depth, 64);
        assert!(config.migration.content_types.is_empty());
    }

    #[test]
    fn migration_section_overrides() {
        let raw = r#"
            [target]
            db_path = "/tmp/ferry.sqlite"

            [legacy]
            export_dir = "/tmp/export"

            [migration]
            batch_size = 100
            queue_depth = 8
            content_types = ["package"]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.migration.batch_size, 100);
        assert_eq!(config.migration.queue_depth, 8);
        assert_eq!(config.migration.content_types, vec!["package".to_string()]);
    }
}
