//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{BackupError, Result};
use std::path::Path;

impl Config {
    /// Load configuration from a file.
    ///
    /// Automatically detects the format based on file extension:
    /// - `.json` files are parsed as JSON
    /// - `.yaml` or `.yml` files are parsed as YAML
    /// - Other extensions default to YAML
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| BackupError::Config(format!("Failed to parse JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.pipeline = self.pipeline.with_auto_tuning(&resources);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID_YAML: &str = r#"
destinations:
  - file:///mnt/backups/primary
  - file:///mnt/backups/replica
working_dir: /var/lib/zfsbackup
pipeline:
  volume_size_mib: 64
  max_file_buffer: 2
  max_parallel_uploads: 3
  compressor: zstd
zfs:
  path: /sbin/zfs
"#;

    const VALID_JSON: &str = r#"{
  "destinations": ["file:///mnt/backups/primary"],
  "working_dir": "/var/lib/zfsbackup",
  "pipeline": {
    "volume_size_mib": 128,
    "max_parallel_uploads": 2
  }
}"#;

    #[test]
    fn test_from_yaml_valid() {
        let config = Config::from_yaml(VALID_YAML).unwrap();
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.pipeline.volume_size_mib, Some(64));
        assert_eq!(config.pipeline.compressor, "zstd");
        assert_eq!(config.zfs.path, "/sbin/zfs");
        assert_eq!(
            config.cache_root(),
            std::path::PathBuf::from("/var/lib/zfsbackup/cache")
        );
    }

    #[test]
    fn test_from_json_valid() {
        let config = Config::from_json(VALID_JSON).unwrap();
        assert_eq!(config.destinations.len(), 1);
        assert_eq!(config.pipeline.volume_size_mib, Some(128));
        assert_eq!(config.zfs.path, "zfs");
    }

    #[test]
    fn test_from_json_invalid_syntax() {
        let result = Config::from_json(r#"{ "destinations": [ invalid"#);
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_from_yaml_missing_destinations() {
        let result = Config::from_yaml("working_dir: /tmp/x");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_detects_json_extension() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(VALID_JSON.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.destinations.len(), 1);
    }

    #[test]
    fn test_load_defaults_to_yaml() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(VALID_YAML.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.destinations.len(), 2);
    }

    #[test]
    fn test_auto_tuning_fills_unset_knobs() {
        let config = Config::from_yaml("destinations: [\"file:///mnt/b\"]")
            .unwrap()
            .with_auto_tuning();
        assert_eq!(config.pipeline.volume_size_mib, Some(200));
        assert!(config.pipeline.max_file_buffer.unwrap() >= 1);
        assert!(config.pipeline.max_parallel_uploads.unwrap() >= 2);
    }

    #[test]
    fn test_auto_tuning_preserves_pipe_mode() {
        let config = Config::from_yaml(
            "destinations: [\"file:///mnt/b\"]\npipeline:\n  max_file_buffer: 0\n",
        )
        .unwrap()
        .with_auto_tuning();
        assert_eq!(config.pipeline.max_file_buffer, Some(0));
    }
}
