//! Configuration Manager
//!
//! Loads the external configuration source: a TOML file layered over
//! environment variables.

use super::defaults;
use super::types::{DispatchMode, SourceConfig};
use anyhow::{anyhow, Context};
use std::path::Path;

/// Loads external configuration values
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration values from a TOML file.
    ///
    /// A missing file yields `Ok(None)`; unreadable or malformed files are errors.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Option<SourceConfig>> {
        if !path.exists() {
            tracing::warn!("Configuration file not found at {}, skipping", path.display());
            return Ok(None);
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let source: SourceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(Some(source))
    }

    /// Load configuration values from the process environment
    pub fn load_from_env() -> anyhow::Result<SourceConfig> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration values through an arbitrary variable lookup
    pub fn load_from_vars<F>(lookup: F) -> anyhow::Result<SourceConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut source = SourceConfig::default();

        if let Some(port) = lookup(defaults::ENV_PORT) {
            source.port = Some(
                port.trim()
                    .parse::<u16>()
                    .with_context(|| format!("Invalid {}: {}", defaults::ENV_PORT, port))?,
            );
        }

        if let Some(bound) = lookup(defaults::ENV_WORKER_BOUND) {
            source.worker_bound = Some(
                bound
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid {}: {}", defaults::ENV_WORKER_BOUND, bound))?,
            );
        }

        if let Some(mode) = lookup(defaults::ENV_DISPATCH_MODE) {
            source.dispatch_mode = Some(
                mode.parse::<DispatchMode>()
                    .map_err(|e| anyhow!("Invalid {}: {}", defaults::ENV_DISPATCH_MODE, e))?,
            );
        }

        if let Some(timeout) = lookup(defaults::ENV_SHUTDOWN_TIMEOUT) {
            source.shutdown_timeout = Some(
                humantime::parse_duration(timeout.trim()).with_context(|| {
                    format!("Invalid {}: {}", defaults::ENV_SHUTDOWN_TIMEOUT, timeout)
                })?,
            );
        }

        Ok(source)
    }

    /// Load the full external source: file values override environment values
    pub fn load_external(path: Option<&Path>, use_environment: bool) -> anyhow::Result<SourceConfig> {
        let env = if use_environment {
            Self::load_from_env().context("Failed to read configuration from environment")?
        } else {
            SourceConfig::default()
        };

        let file = match path {
            Some(path) => Self::load_from_file(path)?.unwrap_or_default(),
            None => SourceConfig::default(),
        };

        Ok(file.layered_over(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(ConfigManager::load_from_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9193\nworker_bound = 2\ndispatch_mode = \"queue\"\nshutdown_timeout = \"2s\""
        )
        .unwrap();

        let source = ConfigManager::load_from_file(file.path()).unwrap().unwrap();
        assert_eq!(source.port, Some(9193));
        assert_eq!(source.worker_bound, Some(2));
        assert_eq!(source.dispatch_mode, Some(DispatchMode::Queue));
        assert_eq!(source.shutdown_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();

        let err = ConfigManager::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_from_vars() {
        let source = ConfigManager::load_from_vars(vars(&[
            ("TCPGATE_PORT", "9400"),
            ("TCPGATE_WORKER_BOUND", "8"),
            ("TCPGATE_DISPATCH_MODE", "Handler"),
            ("TCPGATE_SHUTDOWN_TIMEOUT", "1m 30s"),
        ]))
        .unwrap();

        assert_eq!(source.port, Some(9400));
        assert_eq!(source.worker_bound, Some(8));
        assert_eq!(source.dispatch_mode, Some(DispatchMode::Handler));
        assert_eq!(source.shutdown_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let err = ConfigManager::load_from_vars(vars(&[("TCPGATE_PORT", "70000")])).unwrap_err();
        assert!(err.to_string().contains("TCPGATE_PORT"));

        let err = ConfigManager::load_from_vars(vars(&[("TCPGATE_DISPATCH_MODE", "pool")])).unwrap_err();
        assert!(err.to_string().contains("TCPGATE_DISPATCH_MODE"));
    }
}
