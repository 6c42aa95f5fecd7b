// src/deferred.rs
//
// =============================================================================
// RUNSCRIBE: DEFERRED RUN
// =============================================================================
//
// A run that records everything locally and only contacts the backend in
// `end_run`. Useful where the tracking server may be down for the whole
// duration of an experiment: nothing is attempted until the very end.
//
// Publication failures:
// - run cannot be created, or backend down midway -> one warning, the run is
//   republished in the local fallback store, a half-created run is ended
//   FAILED on the primary backend
// - a single record refused (artifact root unsupported, bad value, ...)
//   -> warning, publication continues on the primary backend

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

use crate::artifacts::Artifactory;
use crate::capture::CaptureScope;
use crate::config::Settings;
use crate::error::TrackingError;
use crate::fallback;
use crate::run::{
    close_capture, current_run_id, initial_tags, local_run_dir, open_capture, RunOptions,
    RunOutcome, RUNTIME_METRIC,
};
use crate::table::Table;
use crate::tracking::{self, Metric, RunStatus, TrackingBackend};

const UNAVAILABLE: &str = "Tracking backend is unavailable; publishing this run to the local fallback store";

/// Extras merged in by [`ExperimentRun::end_run`].
#[derive(Debug, Clone, Default)]
pub struct EndRun {
    pub tags: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// Uploaded in addition to the run's own artifact directory.
    pub artifact_dirs: Vec<PathBuf>,
}

pub struct ExperimentRun {
    settings: Settings,
    experiment: String,
    options: RunOptions,
    temp_id: String,
    started: Instant,
    start_ms: i64,
    log_path: PathBuf,
    capture: Option<CaptureScope<'static>>,
    artifactory: Option<Artifactory>,
    tags: BTreeMap<String, String>,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, Metric>,
    outcome: Option<RunOutcome>,
}

impl ExperimentRun {
    pub fn new(experiment: &str, options: RunOptions) -> Result<Self> {
        Self::with_settings(Settings::load()?, experiment, options)
    }

    pub fn with_settings(settings: Settings, experiment: &str, options: RunOptions) -> Result<Self> {
        let temp_id = Uuid::new_v4().simple().to_string();
        let artifactory = Artifactory::new(&temp_id, options.artifacts_dir.clone())?;
        let (log_path, capture) = if options.capture_output {
            open_capture(&settings, &temp_id)
        } else {
            (PathBuf::new(), None)
        };

        Ok(Self {
            settings,
            experiment: experiment.to_string(),
            temp_id,
            started: Instant::now(),
            start_ms: chrono::Utc::now().timestamp_millis(),
            log_path,
            capture,
            artifactory: Some(artifactory),
            tags: options.tags.clone(),
            options,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            outcome: None,
        })
    }

    /// Local identifier used until the backend assigns a real run id.
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    /// Staging directory for this run's artifacts (`None` once ended).
    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifactory.as_ref().map(Artifactory::dir)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).map(|m| m.value)
    }

    // --- Accumulators (later values override earlier ones) ---

    pub fn set_tag(&mut self, key: &str, value: impl Display) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = (String, String)>) {
        self.tags.extend(tags);
    }

    pub fn log_param(&mut self, key: &str, value: impl Display) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn log_params(&mut self, params: impl IntoIterator<Item = (String, String)>) {
        self.params.extend(params);
    }

    pub fn log_metric(&mut self, key: &str, value: f64) {
        self.metrics
            .insert(key.to_string(), Metric::now(key, value, 0));
    }

    pub fn log_metrics(&mut self, metrics: impl IntoIterator<Item = (String, f64)>) {
        for (k, v) in metrics {
            self.log_metric(&k, v);
        }
    }

    fn staging(&self) -> Result<&Artifactory> {
        self.artifactory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Run {} has already ended", self.temp_id))
    }

    pub fn log_table(&self, table: &Table, name: &str) -> Result<PathBuf> {
        self.staging()?.log_table(name, table)
    }

    pub fn log_object<T: Serialize + ?Sized>(&self, obj: &T, name: &str) -> Result<PathBuf> {
        self.staging()?.log_object(name, obj)
    }

    pub fn log_object_as_text<T: Display + ?Sized>(&self, obj: &T, name: &str) -> Result<PathBuf> {
        self.staging()?.log_object_as_text(name, obj)
    }

    // --- Publication ---

    /// Creates the run on `backend` and pushes tags, params, metrics and
    /// staged artifacts. Returns (experiment_id, run_id).
    fn publish(
        &self,
        backend: &mut dyn TrackingBackend,
        tags: &BTreeMap<String, String>,
        metrics: &[Metric],
        artifact_dirs: &[PathBuf],
    ) -> Result<(String, String), (TrackingError, Option<String>)> {
        let exp_id = backend.ensure_experiment(&self.experiment).map_err(|e| (e, None))?;
        let info = backend
            .create_run(&exp_id, self.options.run_name.as_deref(), self.start_ms, tags)
            .map_err(|e| (e, None))?;
        let run_id = info.run_id;

        match self.push_records(backend, &run_id, metrics, artifact_dirs) {
            Ok(()) => Ok((exp_id, run_id)),
            Err(e) => Err((e, Some(run_id))),
        }
    }

    fn push_records(
        &self,
        backend: &mut dyn TrackingBackend,
        run_id: &str,
        metrics: &[Metric],
        artifact_dirs: &[PathBuf],
    ) -> Result<(), TrackingError> {
        tolerate(run_id, "log_params", backend.log_params(run_id, &self.params))?;
        tolerate(run_id, "log_metrics", backend.log_metrics(run_id, metrics))?;
        if let Some(art) = &self.artifactory {
            let res = art.upload(backend, run_id, artifact_dirs);
            tolerate(run_id, "log_artifacts", res)?;
        }
        Ok(())
    }

    /// Publishes the run and ends it. Never fails: a broken backend costs one
    /// warning and the run is recorded in the local fallback store under a
    /// fresh run id. A second call returns the first outcome.
    pub fn end_run(&mut self, extra: EndRun) -> RunOutcome {
        if let Some(done) = &self.outcome {
            return done.clone();
        }

        let runtime = self.started.elapsed().as_secs_f64();
        self.tags.extend(extra.tags);
        self.params.extend(extra.params);
        for (k, v) in extra.metrics {
            self.log_metric(&k, v);
        }
        self.log_metric(RUNTIME_METRIC, runtime);

        let parent = if self.options.nested { current_run_id() } else { None };
        let mut tags = initial_tags(&self.options, parent);
        tags.extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        let metrics: Vec<Metric> = self.metrics.values().cloned().collect();

        let mut notice = None;
        let published = match tracking::connect(&self.settings) {
            Ok(mut backend) => {
                match self.publish(backend.as_mut(), &tags, &metrics, &extra.artifact_dirs) {
                    Ok(ids) => Ok((backend, ids)),
                    Err((e, half_created)) => {
                        if let Some(run_id) = half_created {
                            abandon(backend.as_mut(), &run_id);
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let chosen: Option<(Box<dyn TrackingBackend>, (String, String))> = match published {
            Ok(ok) => Some(ok),
            Err(e) => {
                notice = Some(fallback::report(UNAVAILABLE, e, &self.settings));
                let mut local: Box<dyn TrackingBackend> =
                    Box::new(tracking::fallback(&self.settings));
                match self.publish(local.as_mut(), &tags, &metrics, &extra.artifact_dirs) {
                    Ok(ids) => Some((local, ids)),
                    Err((e, half_created)) => {
                        if let Some(run_id) = half_created {
                            abandon(local.as_mut(), &run_id);
                        }
                        log::error!(
                            "Local fallback store failed too, run {} was not recorded: {}",
                            self.temp_id,
                            e
                        );
                        None
                    }
                }
            }
        };

        if let Some(mut art) = self.artifactory.take() {
            art.close();
        }
        let captured = self.capture.is_some();
        close_capture(self.capture.take());

        let outcome = match chosen {
            Some((mut backend, (exp_id, run_id))) => {
                if captured {
                    if let Err(e) = backend.log_artifact(&run_id, &self.log_path, None) {
                        log::warn!("Run {}: uploading the run log failed: {}", run_id, e);
                    }
                }
                if let Err(e) = backend.end_run(
                    &run_id,
                    RunStatus::Finished,
                    chrono::Utc::now().timestamp_millis(),
                ) {
                    log::warn!("Run {}: end_run failed: {}", run_id, e);
                }
                RunOutcome {
                    local_run_dir: local_run_dir(&self.settings, notice.is_some(), &exp_id, &run_id),
                    run_id: Some(run_id),
                    experiment_id: Some(exp_id),
                    tracking_uri: backend.uri(),
                    status: RunStatus::Finished,
                    fallback: notice,
                }
            }
            None => RunOutcome {
                run_id: None,
                experiment_id: None,
                tracking_uri: self.settings.tracking_uri.clone(),
                status: RunStatus::Failed,
                fallback: notice,
                local_run_dir: None,
            },
        };

        if captured {
            fs::remove_file(&self.log_path).ok();
        }
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Per-record failures become warnings; a backend that is down as a whole
/// aborts publication.
fn tolerate(run_id: &str, what: &str, res: Result<(), TrackingError>) -> Result<(), TrackingError> {
    match res {
        Err(e) if e.is_backend_down() => Err(e),
        Err(e) => {
            log::warn!("Run {}: {} failed: {}", run_id, what, e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Ends a run whose publication was given up, so it does not stay RUNNING.
fn abandon(backend: &mut dyn TrackingBackend, run_id: &str) {
    let now = chrono::Utc::now().timestamp_millis();
    match backend.end_run(run_id, RunStatus::Failed, now) {
        Ok(()) => log::info!("Run {} on {} ended FAILED after a partial publish", run_id, backend.uri()),
        Err(e) => log::debug!("Run {} on {} stays unfinished: {}", run_id, backend.uri(), e),
    }
}

impl Drop for ExperimentRun {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            log::warn!(
                "Run {} dropped without end_run; its records were discarded",
                self.temp_id
            );
        }
    }
}
