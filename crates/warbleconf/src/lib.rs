//! Configuration loading for warble.
//!
//! # Usage
//!
//! ```rust,no_run
//! use warbleconf::WarbleConfig;
//!
//! let config = WarbleConfig::load().expect("Failed to load config");
//! println!("engine: {}", config.engine.program.display());
//! println!("grace: {:?}", config.engine.shutdown_grace());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/warble/config.toml` (system)
//! 2. `~/.config/warble/config.toml` (user)
//! 3. `./warble.toml` (local override), or the explicit path, which must exist
//! 4. Environment variables (`WARBLE_*`)
//!
//! Keys missing from a file leave the earlier value alone.
//!
//! # Example Config
//!
//! ```toml
//! [engine]
//! program = "/opt/tts/venv/bin/python"
//! args = ["/opt/tts/engine.py", "--log-path", "/var/log/tts-engine.log"]
//! shutdown_grace_ms = 2000
//! max_payload_bytes = 67108864
//!
//! [engine.env]
//! PYTHONIOENCODING = "utf-8"
//! CUDA_VISIBLE_DEVICES = "0"
//!
//! [telemetry]
//! log_level = "info,warble=debug"
//!
//! [output]
//! artifact_dir = "~/.local/share/warble/artifacts"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{config_search_path, resolve_path, ConfigSources};
pub use sections::{EngineConfig, OutputConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete warble configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WarbleConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl WarbleConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./warble.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = WarbleConfig::default();

        for path in loader::config_search_path(config_path) {
            loader::load_file_into(&mut config, &path)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# warble configuration\n\n");

        output.push_str("[engine]\n");
        output.push_str(&format!(
            "program = {}\n",
            quoted(&self.engine.program.to_string_lossy())
        ));
        let args: Vec<String> = self.engine.args.iter().map(|a| quoted(a)).collect();
        output.push_str(&format!("args = [{}]\n", args.join(", ")));
        output.push_str(&format!(
            "shutdown_grace_ms = {}\n",
            self.engine.shutdown_grace_ms
        ));
        output.push_str(&format!(
            "max_header_bytes = {}\n",
            self.engine.max_header_bytes
        ));
        output.push_str(&format!(
            "max_payload_bytes = {}\n",
            self.engine.max_payload_bytes
        ));
        output.push_str(&format!(
            "max_audio_backlog_bytes = {}\n",
            self.engine.max_audio_backlog_bytes
        ));

        output.push_str("\n[engine.env]\n");
        for (name, value) in &self.engine.env {
            output.push_str(&format!("{} = {}\n", name, quoted(value)));
        }

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = {}\n",
            quoted(&self.telemetry.log_level)
        ));

        output.push_str("\n[output]\n");
        output.push_str(&format!(
            "artifact_dir = {}\n",
            quoted(&self.output.artifact_dir.to_string_lossy())
        ));

        output
    }
}

fn quoted(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WarbleConfig::default();
        assert_eq!(config.engine.shutdown_grace_ms, 2000);
        assert_eq!(
            config.engine.env.get("PYTHONIOENCODING"),
            Some(&"utf-8".to_string())
        );
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = WarbleConfig::default();
        config.engine.args = vec!["engine.py".to_string(), "--voice \"a\"".to_string()];

        let rendered = config.to_toml();
        assert!(rendered.contains("[engine]"));
        assert!(rendered.contains("[engine.env]"));

        let parsed: WarbleConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warble.toml");
        std::fs::write(&path, "[engine]\nshutdown_grace_ms = 750\n").unwrap();

        let (config, sources) = WarbleConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        assert_eq!(config.engine.shutdown_grace_ms, 750);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.toml");

        let err = WarbleConfig::load_from(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { path: ref p, .. } if p == &path));
    }
}
