//! Client settings.
//!
//! Defaults are persisted to a per-user config file. Environment variables
//! override any stored values so managed deployments can pin them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Upper bound for establishing a native connection
    pub connect_timeout_ms: u64,
    /// Upper bound for one `execute_query` call, unbounded when absent
    pub query_timeout_ms: Option<u64>,
    /// Concurrent truncate statements, clamped by each engine's own limit
    pub truncate_concurrency: usize,
}

fn env_u64_opt(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

/// Per-user directory holding the settings file and logs
pub(crate) fn data_directory() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA")
            .unwrap_or_else(|| std::env::var_os("USERPROFILE").unwrap_or_default());
        PathBuf::from(appdata).join("dbbridge")
    } else {
        let home = std::env::var_os("HOME").unwrap_or_default();
        PathBuf::from(home).join(".dbbridge")
    }
}

fn config_path() -> PathBuf {
    data_directory().join("settings.json")
}

fn load_from_file(path: &PathBuf) -> Option<ClientSettings> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(settings) => Some(settings),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring malformed settings file");
            None
        }
    }
}

impl ClientSettings {
    pub fn defaults() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            query_timeout_ms: None,
            truncate_concurrency: 4,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_u64_opt("DBBRIDGE_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = env_u64_opt("DBBRIDGE_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = (value > 0).then_some(value);
        }
        if let Some(value) = env_u64_opt("DBBRIDGE_TRUNCATE_CONCURRENCY") {
            self.truncate_concurrency = value.max(1) as usize;
        }
    }

    pub fn load() -> Self {
        let path = config_path();
        let mut settings = load_from_file(&path).unwrap_or_else(Self::defaults);
        settings.apply_env_overrides();
        settings
    }

    pub fn save_to_file(&self) -> Result<(), String> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let payload =
            serde_json::to_string_pretty(self).map_err(|e| format!("Save failed: {}", e))?;
        fs::write(&path, payload).map_err(|e| format!("Save failed: {}", e))?;
        Ok(())
    }

    /// Effective truncate concurrency for an engine allowing at most `engine_limit`
    pub fn truncate_concurrency_for(&self, engine_limit: usize) -> usize {
        self.truncate_concurrency.clamp(1, engine_limit.max(1))
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::defaults()
    }
}
