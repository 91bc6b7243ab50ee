//! Configuration sections.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How to launch and manage the synthesis engine process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable to spawn. Usually a Python interpreter or a wrapper script.
    /// Default: warble-engine (resolved through PATH)
    #[serde(default = "EngineConfig::default_program")]
    pub program: PathBuf,

    /// Arguments passed to the engine, e.g. the script path and `--log-path`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child, on top of the inherited environment.
    /// Default: PYTHONIOENCODING=utf-8
    #[serde(default = "EngineConfig::default_env")]
    pub env: BTreeMap<String, String>,

    /// How long shutdown waits for a clean exit after closing stdin.
    /// Default: 2000
    #[serde(default = "EngineConfig::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Frame header length above which a length prefix is treated as corrupt.
    /// Default: 32 MiB
    #[serde(default = "EngineConfig::default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Declared audio payload length above which a frame header is treated as corrupt.
    /// Default: 64 MiB
    #[serde(default = "EngineConfig::default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Unread audio a session may buffer before it is failed.
    /// Default: 128 MiB
    #[serde(default = "EngineConfig::default_max_audio_backlog_bytes")]
    pub max_audio_backlog_bytes: usize,
}

impl EngineConfig {
    fn default_program() -> PathBuf {
        PathBuf::from("warble-engine")
    }

    fn default_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env
    }

    fn default_shutdown_grace_ms() -> u64 {
        2000
    }

    fn default_max_header_bytes() -> usize {
        32 * 1024 * 1024
    }

    fn default_max_payload_bytes() -> usize {
        64 * 1024 * 1024
    }

    fn default_max_audio_backlog_bytes() -> usize {
        128 * 1024 * 1024
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Vec::new(),
            env: Self::default_env(),
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
            max_header_bytes: Self::default_max_header_bytes(),
            max_payload_bytes: Self::default_max_payload_bytes(),
            max_audio_backlog_bytes: Self::default_max_audio_backlog_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive (trace, debug, info, warn, error, or per-target).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Where synthesized audio lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for WAV artifacts.
    /// Default: ~/.local/share/warble/artifacts
    #[serde(default = "OutputConfig::default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

impl OutputConfig {
    fn default_artifact_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/warble/artifacts"))
            .unwrap_or_else(|| PathBuf::from(".local/share/warble/artifacts"))
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            artifact_dir: Self::default_artifact_dir(),
        }
    }
}
