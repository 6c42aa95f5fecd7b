// src/tracking/mod.rs
//
// =============================================================================
// RUNSCRIBE: TRACKING BACKEND PORT
// =============================================================================
//
// The Contract between runs and wherever they are recorded.
//
// Responsibilities:
// 1. Define the `TrackingBackend` trait (MLflow's run-tracking verbs).
// 2. Parse tracking URIs and dispatch to a concrete backend:
//    - local path / file: URI  -> `LocalStore` (MLflow file-store layout)
//    - http(s):// / databricks -> `RestBackend` (MLflow REST API 2.0)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::TrackingError;

pub mod local;
pub mod rest;

pub use local::LocalStore;
pub use rest::RestBackend;

/// Reserved tag carrying the human-readable run name.
pub const TAG_RUN_NAME: &str = "mlflow.runName";
/// Reserved tag linking a nested run to its parent.
pub const TAG_PARENT_RUN_ID: &str = "mlflow.parentRunId";

// ============================================================================
// 1. SHARED TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: Option<String>,
    pub artifact_uri: String,
    pub start_time_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    pub step: i64,
}

impl Metric {
    pub fn now(key: impl Into<String>, value: f64, step: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            step,
        }
    }
}

// ============================================================================
// 2. THE BACKEND TRAIT (The Contract)
// ============================================================================

pub trait TrackingBackend: Send {
    /// Where this backend records runs (for messages).
    fn uri(&self) -> String;

    /// Returns the id of the experiment called `name`, creating it if needed.
    fn ensure_experiment(&mut self, name: &str) -> Result<String, TrackingError>;

    /// Starts a run. `tags` are recorded atomically with the run.
    fn create_run(
        &mut self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time_ms: i64,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, TrackingError>;

    fn set_tags(
        &mut self,
        run_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError>;

    fn log_params(
        &mut self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError>;

    fn log_metrics(&mut self, run_id: &str, metrics: &[Metric]) -> Result<(), TrackingError>;

    /// Uploads one file under `artifacts/<artifact_dir>/`.
    fn log_artifact(
        &mut self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> Result<(), TrackingError>;

    /// Uploads every file below `dir`, preserving relative layout.
    fn log_artifacts(&mut self, run_id: &str, dir: &Path) -> Result<(), TrackingError> {
        for (file, rel_dir) in walk_files(dir)? {
            self.log_artifact(run_id, &file, rel_dir.as_deref())?;
        }
        Ok(())
    }

    fn end_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        end_time_ms: i64,
    ) -> Result<(), TrackingError>;
}

/// Lists files under `root` as (path, parent dir relative to root).
/// Entries are sorted for a deterministic upload order.
pub(crate) fn walk_files(root: &Path) -> Result<Vec<(PathBuf, Option<String>)>, TrackingError> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .map_err(|e| TrackingError::io(&dir, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrackingError::io(&dir, e))?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let rel = dir
                .strip_prefix(root)
                .ok()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().replace('\\', "/"));
            out.push((path, rel));
        }
    }
    Ok(out)
}

// ============================================================================
// 3. URI DISPATCH (The Factory)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingUri {
    Local(PathBuf),
    Http(String),
    Databricks,
}

impl TrackingUri {
    pub fn parse(raw: &str) -> Result<Self, TrackingError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(TrackingUri::Local(PathBuf::from("mlruns")));
        }
        if raw == "databricks" || raw.starts_with("databricks://") {
            return Ok(TrackingUri::Databricks);
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(TrackingUri::Http(raw.trim_end_matches('/').to_string()));
        }
        if let Some(path) = raw.strip_prefix("file://").or_else(|| raw.strip_prefix("file:")) {
            return Ok(TrackingUri::Local(PathBuf::from(path)));
        }
        if let Some((scheme, _)) = raw.split_once("://") {
            return Err(TrackingError::Configuration(format!(
                "unsupported tracking URI scheme {:?} in {:?}",
                scheme, raw
            )));
        }
        Ok(TrackingUri::Local(PathBuf::from(raw)))
    }
}

/// Builds the backend named by `settings.tracking_uri`.
///
/// Only configuration is checked here; reachability shows up on first call.
pub fn connect(settings: &Settings) -> Result<Box<dyn TrackingBackend>, TrackingError> {
    match TrackingUri::parse(&settings.tracking_uri)? {
        TrackingUri::Local(root) => Ok(Box::new(LocalStore::new(root))),
        TrackingUri::Http(base) => Ok(Box::new(RestBackend::new(
            base,
            settings.tracking_token.clone(),
            settings.http_timeout_secs,
        )?)),
        TrackingUri::Databricks => {
            let host = settings.databricks_host.clone().ok_or_else(|| {
                TrackingError::Configuration(format!(
                    "tracking URI is 'databricks' but {} is not set",
                    crate::config::ENV_DATABRICKS_HOST
                ))
            })?;
            let token = settings.databricks_token.clone().ok_or_else(|| {
                TrackingError::Configuration(format!(
                    "tracking URI is 'databricks' but {} is not set",
                    crate::config::ENV_DATABRICKS_TOKEN
                ))
            })?;
            Ok(Box::new(RestBackend::new(
                host.trim_end_matches('/').to_string(),
                Some(token),
                settings.http_timeout_secs,
            )?))
        }
    }
}

/// The local store runs degrade to.
pub fn fallback(settings: &Settings) -> LocalStore {
    LocalStore::new(settings.fallback_dir.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_forms() {
        assert_eq!(
            TrackingUri::parse("").unwrap(),
            TrackingUri::Local(PathBuf::from("mlruns"))
        );
        assert_eq!(
            TrackingUri::parse("file:///tmp/runs").unwrap(),
            TrackingUri::Local(PathBuf::from("/tmp/runs"))
        );
        assert_eq!(
            TrackingUri::parse("./runs").unwrap(),
            TrackingUri::Local(PathBuf::from("./runs"))
        );
        assert_eq!(
            TrackingUri::parse("http://localhost:5000/").unwrap(),
            TrackingUri::Http("http://localhost:5000".into())
        );
        assert_eq!(TrackingUri::parse("databricks").unwrap(), TrackingUri::Databricks);
        assert!(matches!(
            TrackingUri::parse("s3://bucket/x"),
            Err(TrackingError::Configuration(_))
        ));
    }

    #[test]
    fn databricks_without_credentials_is_a_configuration_error() {
        let settings = Settings {
            tracking_uri: "databricks".into(),
            databricks_host: None,
            ..Settings::default()
        };
        let err = connect(&settings).err().unwrap();
        assert!(matches!(err, TrackingError::Configuration(_)));
        assert!(err.is_backend_down());
    }

    #[test]
    fn walk_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("plots/deep")).unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("plots/deep/c.png"), "c").unwrap();

        let files = walk_files(dir.path()).unwrap();
        let rels: Vec<_> = files
            .iter()
            .map(|(p, rel)| (p.file_name().unwrap().to_string_lossy().into_owned(), rel.clone()))
            .collect();
        assert_eq!(
            rels,
            vec![
                ("a.txt".to_string(), None),
                ("b.txt".to_string(), None),
                ("c.png".to_string(), Some("plots/deep".to_string())),
            ]
        );
    }
}
