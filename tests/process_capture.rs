#![cfg(unix)]

use std::fs;
use std::io::{self, Write};
use std::process::Command;

use runscribe::run::LOG_FILE_PREFIX;
use runscribe::{with_run_using, LocalStore, RunOptions, Settings};

// Descriptors 1 and 2 are process-wide; this binary holds a single test.
// The harness intercepts `println!`, so the body writes through the
// `io::stdout()` / `io::stderr()` handles, which is what `println!` does
// outside of a test.
#[test]
fn plain_process_output_lands_in_the_run_log() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("mlruns");
    let options = RunOptions {
        artifacts_dir: Some(tmp.path().join("staging")),
        default_tags: false,
        capture_output: true,
        ..RunOptions::default()
    };

    let run_id = with_run_using(Settings::local(&root), "plain-io", options, |run| {
        let mut out = io::stdout();
        writeln!(out, "written to stdout directly")?;
        out.flush()?;
        writeln!(io::stderr(), "written to stderr directly")?;

        let status = Command::new("sh")
            .args(["-c", "echo from the child; echo child complains >&2"])
            .status()?;
        assert!(status.success());
        Ok::<_, anyhow::Error>(run.run_id().to_string())
    })
    .unwrap();

    let mut out = io::stdout();
    writeln!(out, "written after the run").unwrap();
    out.flush().unwrap();

    let dir = LocalStore::new(&root).run_dir(&run_id).unwrap();
    let log_path = dir
        .join("artifacts")
        .join(format!("{}{}.txt", LOG_FILE_PREFIX, run_id));
    let log = fs::read_to_string(&log_path).unwrap_or_else(|e| panic!("{log_path:?}: {e}"));

    for line in [
        "written to stdout directly\n",
        "written to stderr directly\n",
        "from the child\n",
        "child complains\n",
    ] {
        assert!(log.contains(line), "missing {line:?} in {log}");
    }
    assert!(!log.contains("written after the run"), "{log}");
}
