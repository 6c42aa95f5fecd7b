// src/tracking/local.rs
//
// =============================================================================
// RUNSCRIBE: LOCAL FILE STORE
// =============================================================================
//
// Records runs in the MLflow file-store layout so that `mlflow ui` can read
// them back:
//
//   <root>/<experiment_id>/meta.yaml
//   <root>/<experiment_id>/<run_id>/meta.yaml
//   <root>/<experiment_id>/<run_id>/{tags,params}/<key>       (value)
//   <root>/<experiment_id>/<run_id>/metrics/<key>             ("<ts> <value> <step>" lines)
//   <root>/<experiment_id>/<run_id>/artifacts/...
//
// This is also where runs land when the configured backend is unreachable.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use super::{Metric, RunInfo, RunStatus, TrackingBackend, TAG_RUN_NAME};
use crate::error::TrackingError;

const DEFAULT_EXPERIMENT_ID: &str = "0";
const DEFAULT_EXPERIMENT_NAME: &str = "Default";

// ============================================================================
// 1. ON-DISK METADATA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMeta {
    pub artifact_location: String,
    pub experiment_id: String,
    pub lifecycle_stage: String,
    pub name: String,
    #[serde(default)]
    pub creation_time: Option<i64>,
    #[serde(default)]
    pub last_update_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub artifact_uri: String,
    pub end_time: Option<i64>,
    pub entry_point_name: String,
    pub experiment_id: String,
    pub lifecycle_stage: String,
    pub run_id: String,
    pub run_name: String,
    pub run_uuid: String,
    pub source_name: String,
    pub source_type: i32,
    pub source_version: String,
    pub start_time: i64,
    /// MLflow's numeric encoding: RUNNING=1 .. KILLED=5.
    pub status: i32,
    pub tags: Vec<String>,
    pub user_id: String,
}

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Running => 1,
        RunStatus::Scheduled => 2,
        RunStatus::Finished => 3,
        RunStatus::Failed => 4,
        RunStatus::Killed => 5,
    }
}

pub fn status_from_code(code: i32) -> Option<RunStatus> {
    match code {
        1 => Some(RunStatus::Running),
        2 => Some(RunStatus::Scheduled),
        3 => Some(RunStatus::Finished),
        4 => Some(RunStatus::Failed),
        5 => Some(RunStatus::Killed),
        _ => None,
    }
}

// ============================================================================
// 2. THE STORE
// ============================================================================

pub struct LocalStore {
    root: PathBuf,
    // run_id -> experiment_id, filled as runs are created or found.
    runs: HashMap<String, String>,
}

impl LocalStore {
    /// Directories are created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_root(&self) -> PathBuf {
        if self.root.is_absolute() {
            self.root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.root))
                .unwrap_or_else(|_| self.root.clone())
        }
    }

    fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), TrackingError> {
        let text = serde_yaml::to_string(value)?;
        fs::write(path, text).map_err(|e| TrackingError::io(path, e))
    }

    fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrackingError> {
        let text = fs::read_to_string(path).map_err(|e| TrackingError::io(path, e))?;
        Ok(serde_yaml::from_str(&text)?)
    }

    fn experiments(&self) -> Result<Vec<ExperimentMeta>, TrackingError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| TrackingError::io(&self.root, e))? {
            let entry = entry.map_err(|e| TrackingError::io(&self.root, e))?;
            let meta = entry.path().join("meta.yaml");
            if meta.is_file() {
                out.push(Self::read_yaml::<ExperimentMeta>(&meta)?);
            }
        }
        Ok(out)
    }

    fn create_experiment(&self, id: &str, name: &str) -> Result<(), TrackingError> {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir).map_err(|e| TrackingError::io(&dir, e))?;
        let now = chrono::Utc::now().timestamp_millis();
        let meta = ExperimentMeta {
            artifact_location: format!("file://{}", self.absolute_root().join(id).display()),
            experiment_id: id.to_string(),
            lifecycle_stage: "active".into(),
            name: name.to_string(),
            creation_time: Some(now),
            last_update_time: Some(now),
        };
        Self::write_yaml(&dir.join("meta.yaml"), &meta)?;
        log::info!("Created experiment '{}' (id {}) in {:?}", name, id, self.root);
        Ok(())
    }

    /// Directory of `run_id`, looked up across experiments when not cached.
    pub fn run_dir(&mut self, run_id: &str) -> Result<PathBuf, TrackingError> {
        if let Some(exp) = self.runs.get(run_id) {
            return Ok(self.root.join(exp).join(run_id));
        }
        for exp in self.experiments()? {
            let dir = self.root.join(&exp.experiment_id).join(run_id);
            if dir.join("meta.yaml").is_file() {
                self.runs.insert(run_id.to_string(), exp.experiment_id);
                return Ok(dir);
            }
        }
        Err(TrackingError::UnknownRun(run_id.to_string()))
    }

    pub fn run_meta(&mut self, run_id: &str) -> Result<RunMeta, TrackingError> {
        let dir = self.run_dir(run_id)?;
        Self::read_yaml(&dir.join("meta.yaml"))
    }

    /// Writes `value` to `<run>/<kind>/<key>`. Keys may contain `/`.
    fn write_keyed(
        &mut self,
        run_id: &str,
        kind: &str,
        key: &str,
        value: &str,
    ) -> Result<(), TrackingError> {
        let path = self.run_dir(run_id)?.join(kind).join(safe_key(key)?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TrackingError::io(parent, e))?;
        }
        fs::write(&path, value).map_err(|e| TrackingError::io(&path, e))
    }
}

/// Rejects keys that would escape their directory.
fn safe_key(key: &str) -> Result<PathBuf, TrackingError> {
    let path = PathBuf::from(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path)
    } else {
        Err(TrackingError::Rejected {
            endpoint: "local".into(),
            status: 400,
            body: format!("invalid key {:?}", key),
        })
    }
}

impl TrackingBackend for LocalStore {
    fn uri(&self) -> String {
        format!("file://{}", self.absolute_root().display())
    }

    fn ensure_experiment(&mut self, name: &str) -> Result<String, TrackingError> {
        let existing = self.experiments()?;
        if let Some(exp) = existing.iter().find(|e| e.name == name) {
            return Ok(exp.experiment_id.clone());
        }
        if !existing.iter().any(|e| e.experiment_id == DEFAULT_EXPERIMENT_ID) {
            self.create_experiment(DEFAULT_EXPERIMENT_ID, DEFAULT_EXPERIMENT_NAME)?;
            if name == DEFAULT_EXPERIMENT_NAME {
                return Ok(DEFAULT_EXPERIMENT_ID.into());
            }
        }
        let next = existing
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let id = next.to_string();
        self.create_experiment(&id, name)?;
        Ok(id)
    }

    fn create_run(
        &mut self,
        experiment_id: &str,
        run_name: Option<&str>,
        start_time_ms: i64,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, TrackingError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let run_name = run_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", &run_id[..8]));
        let dir = self.root.join(experiment_id).join(&run_id);
        for sub in ["artifacts", "metrics", "params", "tags"] {
            let d = dir.join(sub);
            fs::create_dir_all(&d).map_err(|e| TrackingError::io(&d, e))?;
        }

        let artifact_uri = format!(
            "file://{}",
            self.absolute_root()
                .join(experiment_id)
                .join(&run_id)
                .join("artifacts")
                .display()
        );
        let meta = RunMeta {
            artifact_uri: artifact_uri.clone(),
            end_time: None,
            entry_point_name: String::new(),
            experiment_id: experiment_id.to_string(),
            lifecycle_stage: "active".into(),
            run_id: run_id.clone(),
            run_name: run_name.clone(),
            run_uuid: run_id.clone(),
            source_name: String::new(),
            source_type: 4,
            source_version: String::new(),
            start_time: start_time_ms,
            status: status_code(RunStatus::Running),
            tags: Vec::new(),
            user_id: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
        };
        Self::write_yaml(&dir.join("meta.yaml"), &meta)?;
        self.runs.insert(run_id.clone(), experiment_id.to_string());

        let mut all_tags = tags.clone();
        all_tags.insert(TAG_RUN_NAME.into(), run_name.clone());
        self.set_tags(&run_id, &all_tags)?;

        Ok(RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
            run_name: Some(run_name),
            artifact_uri,
            start_time_ms,
        })
    }

    fn set_tags(
        &mut self,
        run_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        for (k, v) in tags {
            self.write_keyed(run_id, "tags", k, v)?;
        }
        Ok(())
    }

    fn log_params(
        &mut self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        for (k, v) in params {
            self.write_keyed(run_id, "params", k, v)?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, run_id: &str, metrics: &[Metric]) -> Result<(), TrackingError> {
        let metrics_dir = self.run_dir(run_id)?.join("metrics");
        for m in metrics {
            let path = metrics_dir.join(safe_key(&m.key)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| TrackingError::io(parent, e))?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| TrackingError::io(&path, e))?;
            writeln!(file, "{} {} {}", m.timestamp_ms, m.value, m.step)
                .map_err(|e| TrackingError::io(&path, e))?;
        }
        Ok(())
    }

    fn log_artifact(
        &mut self,
        run_id: &str,
        local_path: &Path,
        artifact_dir: Option<&str>,
    ) -> Result<(), TrackingError> {
        let mut dest = self.run_dir(run_id)?.join("artifacts");
        if let Some(sub) = artifact_dir {
            dest = dest.join(safe_key(sub)?);
        }
        fs::create_dir_all(&dest).map_err(|e| TrackingError::io(&dest, e))?;
        let file_name = local_path.file_name().ok_or_else(|| {
            TrackingError::io(
                local_path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file path"),
            )
        })?;
        let target = dest.join(file_name);
        fs::copy(local_path, &target).map_err(|e| TrackingError::io(local_path, e))?;
        Ok(())
    }

    fn end_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        end_time_ms: i64,
    ) -> Result<(), TrackingError> {
        let path = self.run_dir(run_id)?.join("meta.yaml");
        let mut meta: RunMeta = Self::read_yaml(&path)?;
        meta.status = status_code(status);
        meta.end_time = Some(end_time_ms);
        Self::write_yaml(&path, &meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiments_are_found_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::new(dir.path());

        let a = store.ensure_experiment("alpha").unwrap();
        let b = store.ensure_experiment("beta").unwrap();
        assert_eq!(a, "1");
        assert_eq!(b, "2");
        assert_eq!(store.ensure_experiment("alpha").unwrap(), "1");
        assert_eq!(store.ensure_experiment("Default").unwrap(), "0");
    }

    #[test]
    fn run_lifecycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::new(dir.path());
        let exp = store.ensure_experiment("exp").unwrap();
        let tags = BTreeMap::from([("team".to_string(), "vision".to_string())]);
        let run = store.create_run(&exp, Some("first"), 1000, &tags).unwrap();

        let params = BTreeMap::from([("lr".to_string(), "0.1".to_string())]);
        store.log_params(&run.run_id, &params).unwrap();
        store
            .log_metrics(
                &run.run_id,
                &[
                    Metric { key: "loss".into(), value: 0.5, timestamp_ms: 1, step: 0 },
                    Metric { key: "loss".into(), value: 0.25, timestamp_ms: 2, step: 1 },
                ],
            )
            .unwrap();
        store.end_run(&run.run_id, RunStatus::Finished, 2000).unwrap();

        let run_dir = dir.path().join(&exp).join(&run.run_id);
        assert_eq!(fs::read_to_string(run_dir.join("tags/team")).unwrap(), "vision");
        assert_eq!(fs::read_to_string(run_dir.join("tags/mlflow.runName")).unwrap(), "first");
        assert_eq!(fs::read_to_string(run_dir.join("params/lr")).unwrap(), "0.1");
        assert_eq!(
            fs::read_to_string(run_dir.join("metrics/loss")).unwrap(),
            "1 0.5 0\n2 0.25 1\n"
        );

        let meta = store.run_meta(&run.run_id).unwrap();
        assert_eq!(status_from_code(meta.status), Some(RunStatus::Finished));
        assert_eq!(meta.end_time, Some(2000));
    }

    #[test]
    fn run_lookup_survives_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let mut store = LocalStore::new(dir.path());
            let exp = store.ensure_experiment("exp").unwrap();
            store.create_run(&exp, None, 0, &BTreeMap::new()).unwrap().run_id
        };
        let mut fresh = LocalStore::new(dir.path());
        assert!(fresh.run_dir(&run_id).is_ok());
        assert!(matches!(
            fresh.run_dir("nope"),
            Err(TrackingError::UnknownRun(_))
        ));
    }

    #[test]
    fn keys_cannot_escape() {
        assert!(safe_key("nested/key").is_ok());
        assert!(safe_key("../x").is_err());
        assert!(safe_key("/abs").is_err());
        assert!(safe_key("").is_err());
    }
}
