//! Configuration loader with environment variable expansion

use super::{expand_env_vars, Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Config, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_minimal() {
        let yaml = r#"
server:
  address: "127.0.0.1:8080"
storage:
  upload_dir: "/var/lib/uploads"
"#;
        let config = ConfigLoader::from_yaml(yaml).unwrap();
        assert_eq!(config.server.upload_path, "/upload");
        assert!(config.storage.sync_on_finalize);
        assert_eq!(config.upload.session_idle_timeout_secs, 3600);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_from_yaml_invalid() {
        let yaml = "server: [unclosed";
        assert!(matches!(
            ConfigLoader::from_yaml(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            ConfigLoader::load("/nonexistent/chunk-uploadr.yaml"),
            Err(ConfigError::IoError(_))
        ));
    }
}
