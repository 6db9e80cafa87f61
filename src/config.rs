// ABOUTME: Application configuration loaded from TOML
// Sections: [pool] shared worker pool settings, [tagreader] tag reader workers

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::tagreader::TagReaderConfig;
use crate::worker_pool::PoolConfig;

/// Directory name under the platform config dir
const CONFIG_DIR_NAME: &str = "mediaworkers";

/// Top-level `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Pool settings shared by every worker kind
    pub pool: PoolConfig,

    /// Tag reader workers
    pub tagreader: TagReaderConfig,
}

impl AppConfig {
    /// Load from `path`, or from the user config file when `path` is `None`.
    ///
    /// A missing user config file yields defaults; a missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => match Self::user_config_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// `~/.config/mediaworkers/config.toml` (platform equivalent elsewhere)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join("config.toml"))
    }

    /// Tag reader pool settings with command-line overrides applied
    pub fn tagreader_pool(&self, workers: Option<usize>) -> PoolConfig {
        let mut tagreader = self.tagreader.clone();
        if workers.is_some() {
            tagreader.worker_count = workers;
        }
        tagreader.pool_config(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
            [pool]
            dispatch_timeout = 5000
            search_dirs = ["/opt/mediaworkers/libexec"]

            [tagreader]
            executable = "custom-tagreader"
            worker_count = 1
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pool.dispatch_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.search_dirs, vec![PathBuf::from("/opt/mediaworkers/libexec")]);
        assert_eq!(config.tagreader.executable, "custom-tagreader");
        assert_eq!(config.tagreader.worker_count, Some(1));
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();

        assert_eq!(AppConfig::load(Some(&path)).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/mediaworkers.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_toml_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[pool\n").unwrap();

        let error = AppConfig::load(Some(&path)).unwrap_err();
        assert!(format!("{error:#}").contains("broken.toml"));
    }

    #[test]
    fn test_worker_override() {
        let config = AppConfig::default();
        let pool = config.tagreader_pool(Some(1));
        assert_eq!(pool.worker_count, 1);
        assert_eq!(pool.executable, crate::tagreader::client::DEFAULT_EXECUTABLE);
    }
}
