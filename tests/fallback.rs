use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use runscribe::logs::{warnings, ScribeLogger};
use runscribe::{
    with_run_using, ActiveRun, EndRun, ExperimentRun, RunOptions, RunStatus, Settings,
};

/// Settings pointing at a closed local port. `marker` ends up in the backend
/// URI, and therefore in the warning, so each test can find its own record.
fn unreachable(tmp: &Path, marker: &str, print_stacktrace: bool) -> Settings {
    ScribeLogger::init().ok();
    Settings {
        tracking_uri: format!("http://127.0.0.1:9/{}", marker),
        http_timeout_secs: 2,
        cache_dir: tmp.join("cache"),
        fallback_dir: tmp.join("fallback"),
        print_stacktrace,
        ..Settings::default()
    }
}

fn options(tmp: &Path) -> RunOptions {
    RunOptions {
        artifacts_dir: Some(tmp.join("staging")),
        default_tags: false,
        capture_output: false,
        ..RunOptions::default()
    }
}

fn warnings_mentioning(marker: &str) -> Vec<String> {
    warnings()
        .get_lines()
        .into_iter()
        .filter(|l| l.contains(marker))
        .collect()
}

#[test]
fn unreachable_backend_degrades_to_one_warning_and_a_local_run() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = unreachable(tmp.path(), "quiet-scoped", false);

    let mut run = ActiveRun::start_with(settings, "outage", options(tmp.path())).unwrap();
    assert!(run.is_fallback());
    run.log_param("batch", 32);
    run.log_metric("loss", 1.5);
    let outcome = run.finish(RunStatus::Finished);

    assert!(outcome.used_fallback());
    let dir = outcome.local_run_dir.unwrap();
    assert!(dir.starts_with(tmp.path().join("fallback")));
    assert_eq!(fs::read_to_string(dir.join("params/batch")).unwrap(), "32");
    assert!(dir.join("metrics/loss").is_file());

    let notice = outcome.fallback.unwrap();
    assert!(notice.detail.is_none());

    let seen = warnings_mentioning("quiet-scoped");
    assert_eq!(seen.len(), 1, "{seen:#?}");
    assert!(seen[0].contains("RUNSCRIBE_PRINT_STACKTRACE"), "{}", seen[0]);
}

#[test]
fn diagnostic_toggle_attaches_the_error_chain_to_the_same_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = unreachable(tmp.path(), "loud-scoped", true);

    let outcome = ActiveRun::start_with(settings, "outage", options(tmp.path()))
        .unwrap()
        .finish(RunStatus::Finished);

    let notice = outcome.fallback.unwrap();
    let detail = notice.detail.expect("detail with the toggle on");
    assert!(detail.contains("Caused by"), "{detail}");

    let seen = warnings_mentioning("loud-scoped");
    assert_eq!(seen.len(), 1, "{seen:#?}");
    assert!(seen[0].contains("Caused by"), "{}", seen[0]);
}

#[test]
fn body_result_is_untouched_by_a_degraded_backend() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = unreachable(tmp.path(), "body-result", false);

    let value = with_run_using(settings, "outage", options(tmp.path()), |run| {
        run.log_metric("acc", 0.75);
        Ok::<_, anyhow::Error>(42)
    })
    .unwrap();
    assert_eq!(value, 42);
    assert_eq!(warnings_mentioning("body-result").len(), 1);
}

#[test]
fn databricks_without_credentials_falls_back() {
    let tmp = tempfile::tempdir().unwrap();
    ScribeLogger::init().ok();
    let settings = Settings {
        tracking_uri: "databricks".into(),
        databricks_host: None,
        databricks_token: None,
        cache_dir: tmp.path().join("cache"),
        fallback_dir: tmp.path().join("fallback"),
        ..Settings::default()
    };

    let outcome = ActiveRun::start_with(settings, "no-creds", options(tmp.path()))
        .unwrap()
        .finish(RunStatus::Finished);

    let notice = outcome.fallback.expect("fallback notice");
    assert!(notice.message.contains("DATABRICKS_HOST"), "{}", notice.message);
    assert!(outcome.local_run_dir.unwrap().join("meta.yaml").is_file());
}

#[test]
fn deferred_run_falls_back_under_a_fresh_id() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = unreachable(tmp.path(), "deferred-outage", false);

    let mut run = ExperimentRun::with_settings(settings, "outage", options(tmp.path())).unwrap();
    run.log_param("trees", 200);
    run.log_object(&BTreeMap::from([("depth", 6)]), "model.json")
        .unwrap();

    let outcome = run.end_run(EndRun {
        metrics: BTreeMap::from([("auc".to_string(), 0.81)]),
        ..EndRun::default()
    });

    assert!(outcome.used_fallback());
    assert_eq!(outcome.status, RunStatus::Finished);
    let run_id = outcome.run_id.clone().unwrap();
    assert_ne!(run_id, run.temp_id());

    let dir = outcome.local_run_dir.clone().unwrap();
    assert!(dir.starts_with(tmp.path().join("fallback")));
    assert!(dir.ends_with(&run_id));
    assert_eq!(fs::read_to_string(dir.join("params/trees")).unwrap(), "200");
    assert!(dir.join("metrics/auc").is_file());
    assert!(dir.join("artifacts/model.json").is_file());

    assert_eq!(warnings_mentioning("deferred-outage").len(), 1);
    // Ending again neither retries nor warns again.
    assert_eq!(run.end_run(EndRun::default()), outcome);
    assert_eq!(warnings_mentioning("deferred-outage").len(), 1);
}
