// src/config.rs
//
// =============================================================================
// RUNSCRIBE: SETTINGS
// =============================================================================
//
// Resolution order (later wins):
// 1. Built-in defaults.
// 2. Optional YAML file: $XDG_CONFIG_HOME/runscribe/config.yaml.
// 3. Environment variables (RUNSCRIBE_*, then MLFLOW_* / DATABRICKS_*).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PRINT_STACKTRACE: &str = "RUNSCRIBE_PRINT_STACKTRACE";
pub const ENV_TRACKING_URI: &str = "RUNSCRIBE_TRACKING_URI";
pub const ENV_MLFLOW_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";
pub const ENV_CACHE_DIR: &str = "RUNSCRIBE_CACHE_DIR";
pub const ENV_FALLBACK_DIR: &str = "RUNSCRIBE_FALLBACK_DIR";
pub const ENV_MLFLOW_TOKEN: &str = "MLFLOW_TRACKING_TOKEN";
pub const ENV_DATABRICKS_HOST: &str = "DATABRICKS_HOST";
pub const ENV_DATABRICKS_TOKEN: &str = "DATABRICKS_TOKEN";

/// The remote used when nothing else is configured.
pub const DEFAULT_TRACKING_URI: &str = "databricks";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Attach the full error chain to backend-degradation warnings.
    pub print_stacktrace: bool,
    pub tracking_uri: String,
    /// Scratch space for run log files and one-shot artifacts.
    pub cache_dir: PathBuf,
    /// Local MLflow file store used when the backend cannot be reached.
    pub fallback_dir: PathBuf,
    #[serde(skip_serializing)]
    pub tracking_token: Option<String>,
    pub databricks_host: Option<String>,
    #[serde(skip_serializing)]
    pub databricks_token: Option<String>,
    /// Request timeout for the REST backend, in seconds.
    pub http_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            print_stacktrace: false,
            tracking_uri: DEFAULT_TRACKING_URI.into(),
            cache_dir: default_cache_dir(),
            fallback_dir: PathBuf::from("mlruns"),
            tracking_token: None,
            databricks_host: None,
            databricks_token: None,
            http_timeout_secs: 10,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("runscribe")
}

/// `$XDG_CONFIG_HOME/runscribe/config.yaml` (platform equivalent elsewhere).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("runscribe").join("config.yaml"))
}

/// Parses the boolean spellings accepted for toggles.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl Settings {
    /// Full resolution: defaults, config file, process environment.
    pub fn load() -> Result<Self> {
        let mut settings = match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Overlays environment values read through `lookup`.
    ///
    /// Taking a lookup function keeps this testable without touching the
    /// real process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_PRINT_STACKTRACE) {
            match parse_flag(&raw) {
                Some(flag) => self.print_stacktrace = flag,
                None => log::warn!(
                    "Ignoring {}={:?}: expected true/false",
                    ENV_PRINT_STACKTRACE,
                    raw
                ),
            }
        }
        if let Some(uri) = lookup(ENV_TRACKING_URI).or_else(|| lookup(ENV_MLFLOW_TRACKING_URI)) {
            self.tracking_uri = uri;
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_FALLBACK_DIR) {
            self.fallback_dir = PathBuf::from(dir);
        }
        if let Some(token) = lookup(ENV_MLFLOW_TOKEN) {
            self.tracking_token = Some(token);
        }
        if let Some(host) = lookup(ENV_DATABRICKS_HOST) {
            self.databricks_host = Some(host);
        }
        if let Some(token) = lookup(ENV_DATABRICKS_TOKEN) {
            self.databricks_token = Some(token);
        }
    }

    /// Creates the cache directory if missing and returns it.
    pub fn ensure_cache_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Failed to create cache dir: {:?}", self.cache_dir))?;
        Ok(&self.cache_dir)
    }

    /// Settings that route every run to a local file store under `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            tracking_uri: root.display().to_string(),
            cache_dir: root.join(".cache"),
            fallback_dir: root,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn flag_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" on "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn runscribe_uri_beats_mlflow_uri() {
        let mut s = Settings::default();
        s.apply_env(env(&[
            (ENV_TRACKING_URI, "http://a:5000"),
            (ENV_MLFLOW_TRACKING_URI, "http://b:5000"),
        ]));
        assert_eq!(s.tracking_uri, "http://a:5000");

        let mut s = Settings::default();
        s.apply_env(env(&[(ENV_MLFLOW_TRACKING_URI, "http://b:5000")]));
        assert_eq!(s.tracking_uri, "http://b:5000");
    }

    #[test]
    fn stacktrace_toggle_defaults_off() {
        let mut s = Settings::default();
        s.apply_env(env(&[]));
        assert!(!s.print_stacktrace);
        s.apply_env(env(&[(ENV_PRINT_STACKTRACE, "true")]));
        assert!(s.print_stacktrace);
        s.apply_env(env(&[(ENV_PRINT_STACKTRACE, "garbage")]));
        assert!(s.print_stacktrace);
    }

    #[test]
    fn yaml_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "tracking_uri: http://tracker:5000\nprint_stacktrace: true\n").unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.tracking_uri, "http://tracker:5000");
        assert!(s.print_stacktrace);
        assert_eq!(s.fallback_dir, PathBuf::from("mlruns"));
        assert_eq!(s.http_timeout_secs, 10);
    }
}
