//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, WarbleConfig};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Machine-wide config, loaded first.
const SYSTEM_CONFIG: &str = "/etc/warble/config.toml";

/// Per-directory override, skipped when an explicit path is given.
const LOCAL_CONFIG: &str = "warble.toml";

/// Config files to load, in order (system, user, then local or explicit).
///
/// Standard locations are optional and skipped when absent. An explicit
/// `cli_path` is always returned so that a typo surfaces as a read error.
pub fn config_search_path(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let user = directories::ProjectDirs::from("", "", "warble")
        .map(|dirs| dirs.config_dir().join("config.toml"));

    let mut files: Vec<PathBuf> = [Some(PathBuf::from(SYSTEM_CONFIG)), user]
        .into_iter()
        .flatten()
        .filter(|path| path.is_file())
        .collect();

    match cli_path {
        Some(path) => files.push(path.to_path_buf()),
        None => {
            let local = PathBuf::from(LOCAL_CONFIG);
            if local.is_file() {
                files.push(local);
            }
        }
    }

    files
}

/// Read a TOML file and overlay the keys it sets onto `config`.
pub fn load_file_into(config: &mut WarbleConfig, path: &Path) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    apply_toml(config, &contents, path)
}

/// Overlay the keys present in `contents` onto `config`.
pub fn apply_toml(config: &mut WarbleConfig, contents: &str, path: &Path) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    if let Some(engine) = section(&table, "engine").map_err(parse_err)? {
        if let Some(v) = engine.get("program") {
            config.engine.program =
                resolve_path(string(v, "engine.program").map_err(parse_err)?);
        }
        if let Some(v) = engine.get("args") {
            let args = v
                .as_array()
                .ok_or_else(|| parse_err("engine.args must be an array of strings".to_string()))?;
            config.engine.args = args
                .iter()
                .map(|a| {
                    a.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| parse_err(format!("engine.args entry {} is not a string", a)))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = engine.get("shutdown_grace_ms") {
            config.engine.shutdown_grace_ms = non_negative(v, "engine.shutdown_grace_ms")
                .map_err(parse_err)?;
        }
        if let Some(v) = engine.get("max_header_bytes") {
            config.engine.max_header_bytes = non_negative(v, "engine.max_header_bytes")
                .map_err(parse_err)? as usize;
        }
        if let Some(v) = engine.get("max_payload_bytes") {
            config.engine.max_payload_bytes = non_negative(v, "engine.max_payload_bytes")
                .map_err(parse_err)? as usize;
        }
        if let Some(v) = engine.get("max_audio_backlog_bytes") {
            config.engine.max_audio_backlog_bytes =
                non_negative(v, "engine.max_audio_backlog_bytes").map_err(parse_err)? as usize;
        }
        if let Some(env_table) = section(engine, "env").map_err(|_| {
            parse_err("engine.env must be a table of strings".to_string())
        })? {
            for (name, value) in env_table {
                match value.as_str() {
                    Some(s) => {
                        config.engine.env.insert(name.clone(), s.to_string());
                    }
                    None => {
                        return Err(parse_err(format!("engine.env.{} must be a string", name)));
                    }
                }
            }
        }
    }

    if let Some(telemetry) = section(&table, "telemetry").map_err(parse_err)? {
        if let Some(v) = telemetry.get("log_level") {
            config.telemetry.log_level = string(v, "telemetry.log_level")
                .map_err(parse_err)?
                .to_string();
        }
    }

    if let Some(output) = section(&table, "output").map_err(parse_err)? {
        if let Some(v) = output.get("artifact_dir") {
            config.output.artifact_dir =
                resolve_path(string(v, "output.artifact_dir").map_err(parse_err)?);
        }
    }

    Ok(())
}

fn section<'a>(table: &'a toml::Table, key: &str) -> Result<Option<&'a toml::Table>, String> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_table()
            .map(Some)
            .ok_or_else(|| format!("[{}] must be a table", key)),
    }
}

fn string<'a>(value: &'a toml::Value, key: &str) -> Result<&'a str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{} must be a string", key))
}

fn non_negative(value: &toml::Value, key: &str) -> Result<u64, String> {
    value
        .as_integer()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| format!("{} must be a non-negative integer", key))
}

/// Apply environment variable overrides from the process environment.
pub fn apply_env_overrides(config: &mut WarbleConfig, sources: &mut ConfigSources) {
    apply_env_overrides_from(config, sources, env::vars());
}

/// Apply environment variable overrides from an explicit set of variables.
pub fn apply_env_overrides_from(
    config: &mut WarbleConfig,
    sources: &mut ConfigSources,
    vars: impl IntoIterator<Item = (String, String)>,
) {
    let vars: HashMap<String, String> = vars.into_iter().collect();

    // Legacy name from the Python launcher; WARBLE_ENGINE_PROGRAM wins if both are set
    if let Some(v) = vars.get("TTSENGINE_PYTHON_PATH") {
        config.engine.program = resolve_path(v);
        sources.env_overrides.push("TTSENGINE_PYTHON_PATH".to_string());
    }
    if let Some(v) = vars.get("WARBLE_ENGINE_PROGRAM") {
        config.engine.program = resolve_path(v);
        sources.env_overrides.push("WARBLE_ENGINE_PROGRAM".to_string());
    }
    if let Some(v) = vars.get("WARBLE_ENGINE_ARGS") {
        config.engine.args = v.split_whitespace().map(str::to_string).collect();
        sources.env_overrides.push("WARBLE_ENGINE_ARGS".to_string());
    }
    if let Some(v) = vars.get("WARBLE_SHUTDOWN_GRACE_MS") {
        if let Ok(ms) = v.parse() {
            config.engine.shutdown_grace_ms = ms;
            sources.env_overrides.push("WARBLE_SHUTDOWN_GRACE_MS".to_string());
        }
    }
    if let Some(v) = vars.get("WARBLE_MAX_HEADER_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.engine.max_header_bytes = bytes;
            sources.env_overrides.push("WARBLE_MAX_HEADER_BYTES".to_string());
        }
    }
    if let Some(v) = vars.get("WARBLE_MAX_PAYLOAD_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.engine.max_payload_bytes = bytes;
            sources.env_overrides.push("WARBLE_MAX_PAYLOAD_BYTES".to_string());
        }
    }
    if let Some(v) = vars.get("WARBLE_MAX_AUDIO_BACKLOG_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.engine.max_audio_backlog_bytes = bytes;
            sources.env_overrides.push("WARBLE_MAX_AUDIO_BACKLOG_BYTES".to_string());
        }
    }

    if let Some(v) = vars.get("WARBLE_LOG_LEVEL") {
        config.telemetry.log_level = v.clone();
        sources.env_overrides.push("WARBLE_LOG_LEVEL".to_string());
    }
    if let Some(v) = vars.get("RUST_LOG") {
        config.telemetry.log_level = v.clone();
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Some(v) = vars.get("WARBLE_ARTIFACT_DIR") {
        config.output.artifact_dir = resolve_path(v);
        sources.env_overrides.push("WARBLE_ARTIFACT_DIR".to_string());
    }

    // Child environment (WARBLE_ENGINE_ENV_<NAME>)
    let mut engine_env: Vec<_> = vars
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix("WARBLE_ENGINE_ENV_")
                .filter(|name| !name.is_empty())
                .map(|name| (key, name, value))
        })
        .collect();
    engine_env.sort();
    for (key, name, value) in engine_env {
        config.engine.env.insert(name.to_string(), value.clone());
        sources.env_overrides.push(key.clone());
    }
}

/// Resolve a leading `~`, `$NAME` or `${NAME}` component of a configured path.
///
/// Paths whose first component names an unset variable are returned as written.
pub fn resolve_path(raw: &str) -> PathBuf {
    resolve_path_with(raw, |name| env::var(name).ok())
}

fn resolve_path_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    let (head, rest) = match raw.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (raw, None),
    };

    let base = if head == "~" {
        directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
    } else {
        variable_name(head).and_then(&lookup).map(PathBuf::from)
    };

    match (base, rest) {
        (Some(base), Some(rest)) => base.join(rest),
        (Some(base), None) => base,
        (None, _) => PathBuf::from(raw),
    }
}

fn variable_name(component: &str) -> Option<&str> {
    let name = component.strip_prefix('$')?;
    let name = match name.strip_prefix('{') {
        Some(braced) => braced.strip_suffix('}')?,
        None => name,
    };
    (!name.is_empty()).then_some(name)
}
