// src/run.rs
//
// =============================================================================
// RUNSCRIBE: ACTIVE RUN (Scoped)
// =============================================================================
//
// A run that talks to the backend while it executes.
//
// Lifecycle:
// 1. START:  resolve backend -> experiment -> run. Any backend failure is
//            reported once and the run moves to the local fallback store.
// 2. ENTER:  open the run log, push a capture layer on it, stage artifacts,
//            apply default + user tags.
// 3. BODY:   tags / params / metrics / artifacts go straight to the backend;
//            failures are downgraded to warnings.
// 4. FINISH: runtime metric, artifact upload, capture layer popped, run log
//            uploaded, run ended. Runs on every exit path (Drop included).

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;
use uuid::Uuid;

use crate::artifacts::{self, Artifactory};
use crate::capture::{CaptureScope, OutputRouter};
use crate::config::Settings;
use crate::error::TrackingError;
use crate::fallback::{self, FallbackNotice};
use crate::table::Table;
use crate::tags;
use crate::tracking::{
    self, Metric, RunInfo, RunStatus, TrackingBackend, TrackingUri, TAG_PARENT_RUN_ID,
};

pub const RUNTIME_METRIC: &str = "runtime_in_sec";
pub const LOG_FILE_PREFIX: &str = "log_run_";

const BADLY_CONFIGURED: &str = "Tracking backend is badly configured; logging this run locally";

// ============================================================================
// 1. OPTIONS & OUTCOME
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stored as the `mlflow.runName` tag.
    pub run_name: Option<String>,
    /// Link this run to the innermost run already active in the process.
    pub nested: bool,
    /// Staging directory for artifacts; `./run_artifacts_<id>` when unset.
    pub artifacts_dir: Option<PathBuf>,
    /// Extra directories uploaded when the run finishes.
    pub extra_artifact_dirs: Vec<PathBuf>,
    pub tags: BTreeMap<String, String>,
    /// Attach source-control and host tags.
    pub default_tags: bool,
    /// Tee stdout/stderr into the run log.
    pub capture_output: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_name: None,
            nested: false,
            artifacts_dir: None,
            extra_artifact_dirs: Vec::new(),
            tags: BTreeMap::new(),
            default_tags: true,
            capture_output: true,
        }
    }
}

impl RunOptions {
    pub fn named(run_name: impl Into<String>) -> Self {
        Self {
            run_name: Some(run_name.into()),
            ..Self::default()
        }
    }
}

/// Where a finished run ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `None` only when even the local fallback could not record the run.
    pub run_id: Option<String>,
    pub experiment_id: Option<String>,
    pub tracking_uri: String,
    pub status: RunStatus,
    /// Set when the configured backend was abandoned for the local store.
    pub fallback: Option<FallbackNotice>,
    /// Run directory, when the run was recorded in a local file store.
    pub local_run_dir: Option<PathBuf>,
}

impl RunOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Directory of a run inside a local store rooted per `tracking_uri`.
pub(crate) fn local_run_dir(
    settings: &Settings,
    fell_back: bool,
    experiment_id: &str,
    run_id: &str,
) -> Option<PathBuf> {
    let root = if fell_back {
        settings.fallback_dir.clone()
    } else {
        match TrackingUri::parse(&settings.tracking_uri).ok()? {
            TrackingUri::Local(root) => root,
            _ => return None,
        }
    };
    Some(root.join(experiment_id).join(run_id))
}

// ============================================================================
// 2. PROCESS-WIDE ACTIVE RUN STACK (nesting)
// ============================================================================

fn active_runs() -> &'static Mutex<Vec<String>> {
    static ACTIVE: OnceLock<Mutex<Vec<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Innermost run currently active in this process.
pub fn current_run_id() -> Option<String> {
    active_runs()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .last()
        .cloned()
}

fn push_active(run_id: &str) {
    active_runs()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(run_id.to_string());
}

fn remove_active(run_id: &str) {
    let mut runs = active_runs().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(idx) = runs.iter().rposition(|r| r == run_id) {
        runs.remove(idx);
    }
}

/// Tags every run starts with.
pub(crate) fn initial_tags(options: &RunOptions, parent: Option<String>) -> BTreeMap<String, String> {
    let mut tags = if options.default_tags {
        tags::default_tags().clone()
    } else {
        BTreeMap::new()
    };
    tags.extend(options.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(parent) = parent {
        tags.insert(TAG_PARENT_RUN_ID.into(), parent);
    }
    tags
}

/// Opens `<cache>/log_run_<id>.txt` and pushes a capture layer on it.
/// Best-effort: a failure leaves the run uncaptured.
pub(crate) fn open_capture(settings: &Settings, id: &str) -> (PathBuf, Option<CaptureScope<'static>>) {
    let log_path = settings
        .cache_dir
        .join(format!("{}{}.txt", LOG_FILE_PREFIX, id));
    let scope = settings
        .ensure_cache_dir()
        .map_err(|e| e.to_string())
        .and_then(|_| {
            OutputRouter::global()
                .enter_file(&log_path)
                .map_err(|e| e.to_string())
        });
    match scope {
        Ok(scope) => (log_path, Some(scope)),
        Err(e) => {
            log::warn!("Output capture disabled for run {}: {}", id, e);
            (log_path, None)
        }
    }
}

/// Pops a capture layer; an out-of-order close unwinds instead.
pub(crate) fn close_capture(scope: Option<CaptureScope<'static>>) {
    if let Some(mut scope) = scope {
        if let Err(e) = scope.close() {
            drop(scope);
            log::warn!("{}; inner capture layers were unwound with it", e);
        }
    }
}

// ============================================================================
// 3. THE ACTIVE RUN
// ============================================================================

pub struct ActiveRun {
    settings: Settings,
    backend: Box<dyn TrackingBackend>,
    info: RunInfo,
    notice: Option<FallbackNotice>,
    started: Instant,
    log_path: PathBuf,
    capture: Option<CaptureScope<'static>>,
    artifactory: Option<Artifactory>,
    extra_artifact_dirs: Vec<PathBuf>,
    finished: Option<RunStatus>,
}

impl ActiveRun {
    /// Starts a run with settings resolved from config file + environment.
    pub fn start(experiment: &str, options: RunOptions) -> Result<Self> {
        Self::start_with(Settings::load()?, experiment, options)
    }

    /// Starts a run. Only fails when the local fallback store itself
    /// cannot record the run.
    pub fn start_with(settings: Settings, experiment: &str, options: RunOptions) -> Result<Self> {
        let started = Instant::now();
        let start_ms = chrono::Utc::now().timestamp_millis();
        let parent = if options.nested { current_run_id() } else { None };
        let tags = initial_tags(&options, parent);
        let run_name = options.run_name.as_deref();

        let attempt = tracking::connect(&settings).and_then(|mut backend| {
            let exp_id = backend.ensure_experiment(experiment)?;
            let info = backend.create_run(&exp_id, run_name, start_ms, &tags)?;
            Ok((backend, info))
        });

        let (mut backend, info, notice) = match attempt {
            Ok((backend, info)) => (backend, info, None),
            Err(e) => {
                let notice = fallback::report(BADLY_CONFIGURED, e, &settings);
                let mut local: Box<dyn TrackingBackend> = Box::new(tracking::fallback(&settings));
                let exp_id = local
                    .ensure_experiment(experiment)
                    .context("Local fallback store failed")?;
                let info = local
                    .create_run(&exp_id, run_name, start_ms, &tags)
                    .context("Local fallback store failed")?;
                (local, info, Some(notice))
            }
        };

        // The run exists on the backend from here on; it must not stay RUNNING.
        let artifactory = match Artifactory::new(&info.run_id, options.artifacts_dir.clone()) {
            Ok(a) => a,
            Err(e) => {
                let ended = backend.end_run(
                    &info.run_id,
                    RunStatus::Failed,
                    chrono::Utc::now().timestamp_millis(),
                );
                if let Err(end_err) = ended {
                    log::warn!("Run {}: end_run failed: {}", info.run_id, end_err);
                }
                return Err(e.context(format!("Run {} could not stage artifacts", info.run_id)));
            }
        };
        let (log_path, capture) = if options.capture_output {
            open_capture(&settings, &info.run_id)
        } else {
            (settings.cache_dir.join(format!("{}{}.txt", LOG_FILE_PREFIX, info.run_id)), None)
        };

        push_active(&info.run_id);
        log::info!(
            "Run {} started in experiment {} on {}",
            info.run_id,
            info.experiment_id,
            backend.uri()
        );

        Ok(Self {
            settings,
            backend,
            info,
            notice,
            started,
            log_path,
            capture,
            artifactory: Some(artifactory),
            extra_artifact_dirs: options.extra_artifact_dirs,
            finished: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub fn experiment_id(&self) -> &str {
        &self.info.experiment_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// The warning issued if this run fell back to the local store.
    pub fn notice(&self) -> Option<&FallbackNotice> {
        self.notice.as_ref()
    }

    pub fn is_fallback(&self) -> bool {
        self.notice.is_some()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifactory.as_ref().map(Artifactory::dir)
    }

    fn degrade(&self, what: &str, result: Result<(), TrackingError>) {
        if let Err(e) = result {
            log::warn!("Run {}: {} failed: {}", self.info.run_id, what, e);
        }
    }

    // --- Tags / Params / Metrics ---

    pub fn set_tag(&mut self, key: &str, value: impl Display) {
        self.set_tags([(key.to_string(), value.to_string())]);
    }

    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = (String, String)>) {
        let tags: BTreeMap<String, String> = tags.into_iter().collect();
        let res = self.backend.set_tags(&self.info.run_id, &tags);
        self.degrade("set_tags", res);
    }

    pub fn log_param(&mut self, key: &str, value: impl Display) {
        self.log_params([(key.to_string(), value.to_string())]);
    }

    pub fn log_params(&mut self, params: impl IntoIterator<Item = (String, String)>) {
        let params: BTreeMap<String, String> = params.into_iter().collect();
        let res = self.backend.log_params(&self.info.run_id, &params);
        self.degrade("log_params", res);
    }

    pub fn log_metric(&mut self, key: &str, value: f64) {
        self.log_metric_at(key, value, 0);
    }

    pub fn log_metric_at(&mut self, key: &str, value: f64, step: i64) {
        let res = self
            .backend
            .log_metrics(&self.info.run_id, &[Metric::now(key, value, step)]);
        self.degrade("log_metric", res);
    }

    pub fn log_metrics(&mut self, metrics: impl IntoIterator<Item = (String, f64)>) {
        let metrics: Vec<Metric> = metrics
            .into_iter()
            .map(|(k, v)| Metric::now(k, v, 0))
            .collect();
        let res = self.backend.log_metrics(&self.info.run_id, &metrics);
        self.degrade("log_metrics", res);
    }

    // --- Artifacts ---

    /// Uploads a file now, under `artifacts/<artifact_dir>/`.
    pub fn log_artifact(&mut self, path: &Path, artifact_dir: Option<&str>) {
        let res = self
            .backend
            .log_artifact(&self.info.run_id, path, artifact_dir);
        self.degrade("log_artifact", res);
    }

    /// Writes an artifact through `write` into a scratch dir, uploads it, and
    /// removes the scratch copy.
    fn log_one_shot(
        &mut self,
        write: impl FnOnce(&Path) -> Result<PathBuf>,
    ) -> Result<()> {
        let scratch = self
            .settings
            .ensure_cache_dir()?
            .join(format!("oneshot_{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&scratch)
            .with_context(|| format!("Failed to create scratch dir {:?}", scratch))?;
        let written = write(&scratch);
        if let Ok(path) = &written {
            let path = path.clone();
            self.log_artifact(&path, None);
        }
        fs::remove_dir_all(&scratch).ok();
        written.map(|_| ())
    }

    /// Logs `table` as a CSV artifact named `name`.
    pub fn log_table(&mut self, table: &Table, name: &str) -> Result<()> {
        self.log_one_shot(|dir| artifacts::write_table(dir, name, table))
    }

    /// Logs `obj` serialized as JSON.
    pub fn log_object<T: Serialize + ?Sized>(&mut self, obj: &T, name: &str) -> Result<()> {
        self.log_one_shot(|dir| artifacts::write_object(dir, name, obj))
    }

    /// Logs the `Display` form of `obj` as a text artifact.
    pub fn log_object_as_text<T: Display + ?Sized>(&mut self, obj: &T, name: &str) -> Result<()> {
        self.log_one_shot(|dir| artifacts::write_text(dir, name, obj))
    }

    // --- Teardown ---

    /// Ends the run with `status`.
    pub fn finish(mut self, status: RunStatus) -> RunOutcome {
        self.finish_in_place(status)
    }

    fn finish_in_place(&mut self, status: RunStatus) -> RunOutcome {
        if let Some(done) = self.finished {
            return self.outcome(done);
        }
        self.finished = Some(status);
        let run_id = self.info.run_id.clone();

        let runtime = self.started.elapsed().as_secs_f64();
        let res = self
            .backend
            .log_metrics(&run_id, &[Metric::now(RUNTIME_METRIC, runtime, 0)]);
        self.degrade("log runtime", res);

        if let Some(mut artifactory) = self.artifactory.take() {
            let res = artifactory.upload(self.backend.as_mut(), &run_id, &self.extra_artifact_dirs);
            self.degrade("log_artifacts", res);
            artifactory.close();
        }

        let captured = self.capture.is_some();
        close_capture(self.capture.take());
        if captured {
            let log_path = self.log_path.clone();
            self.log_artifact(&log_path, None);
            fs::remove_file(&log_path).ok();
        }

        let res = self
            .backend
            .end_run(&run_id, status, chrono::Utc::now().timestamp_millis());
        self.degrade("end_run", res);
        remove_active(&run_id);
        log::info!("Run {} ended: {}", run_id, status.as_str());
        self.outcome(status)
    }

    fn outcome(&self, status: RunStatus) -> RunOutcome {
        RunOutcome {
            run_id: Some(self.info.run_id.clone()),
            experiment_id: Some(self.info.experiment_id.clone()),
            tracking_uri: self.backend.uri(),
            status,
            fallback: self.notice.clone(),
            local_run_dir: local_run_dir(
                &self.settings,
                self.notice.is_some(),
                &self.info.experiment_id,
                &self.info.run_id,
            ),
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.finished.is_none() {
            let status = if std::thread::panicking() {
                RunStatus::Failed
            } else {
                RunStatus::Killed
            };
            self.finish_in_place(status);
        }
    }
}

// ============================================================================
// 4. SCOPED HELPERS
// ============================================================================

/// Runs `body` inside an active run.
///
/// The run ends `FINISHED` when `body` returns `Ok`, `FAILED` otherwise; in
/// both cases the capture layer is popped before the result is returned.
/// `body`'s error is returned unchanged.
pub fn with_run_using<T, E, F>(
    settings: Settings,
    experiment: &str,
    options: RunOptions,
    body: F,
) -> Result<T, E>
where
    F: FnOnce(&mut ActiveRun) -> Result<T, E>,
    E: From<anyhow::Error>,
{
    let mut run = ActiveRun::start_with(settings, experiment, options)?;
    let result = body(&mut run);
    let status = if result.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    };
    run.finish(status);
    result
}

/// [`with_run_using`] with settings from config file + environment.
pub fn with_run<T, E, F>(experiment: &str, options: RunOptions, body: F) -> Result<T, E>
where
    F: FnOnce(&mut ActiveRun) -> Result<T, E>,
    E: From<anyhow::Error>,
{
    let settings = Settings::load()?;
    with_run_using(settings, experiment, options, body)
}
