use std::fs;

use runscribe::run::{current_run_id, LOG_FILE_PREFIX};
use runscribe::tracking::TAG_PARENT_RUN_ID;
use runscribe::{tee_println, with_run_using, LocalStore, RunOptions, Settings};

// The active-run stack and the capture stack are process-wide; this binary
// holds a single test so no other run can interleave with it.
#[test]
fn nested_run_is_linked_to_its_parent_and_both_capture_its_output() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("mlruns");
    let options = |staging: &str, nested: bool| RunOptions {
        nested,
        artifacts_dir: Some(tmp.path().join(staging)),
        default_tags: false,
        capture_output: true,
        ..RunOptions::default()
    };

    assert_eq!(current_run_id(), None);
    let (outer_id, inner_id) = with_run_using(
        Settings::local(&root),
        "tuning",
        options("outer", false),
        |outer| {
            let outer_id = outer.run_id().to_string();
            assert_eq!(current_run_id().as_deref(), Some(outer_id.as_str()));
            tee_println!("outer: sweep starts");

            let inner_id = with_run_using(
                Settings::local(&root),
                "tuning",
                options("inner", true),
                |inner| {
                    tee_println!("inner: trial 1 loss=0.25");
                    Ok::<_, anyhow::Error>(inner.run_id().to_string())
                },
            )?;
            tee_println!("outer: sweep done");
            assert_eq!(current_run_id().as_deref(), Some(outer_id.as_str()));
            Ok::<_, anyhow::Error>((outer_id, inner_id))
        },
    )
    .unwrap();
    assert_eq!(current_run_id(), None);

    let mut store = LocalStore::new(&root);
    let inner_dir = store.run_dir(&inner_id).unwrap();
    assert_eq!(
        fs::read_to_string(inner_dir.join("tags").join(TAG_PARENT_RUN_ID)).unwrap(),
        outer_id
    );
    let outer_dir = store.run_dir(&outer_id).unwrap();
    assert!(!outer_dir.join("tags").join(TAG_PARENT_RUN_ID).exists());

    let run_log = |dir: &std::path::Path, id: &str| {
        let path = dir
            .join("artifacts")
            .join(format!("{}{}.txt", LOG_FILE_PREFIX, id));
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("{path:?}: {e}"))
    };
    let inner_log = run_log(&inner_dir, &inner_id);
    let outer_log = run_log(&outer_dir, &outer_id);

    assert!(inner_log.contains("inner: trial 1 loss=0.25\n"), "{inner_log}");
    assert!(!inner_log.contains("outer:"), "{inner_log}");
    for line in [
        "outer: sweep starts\n",
        "inner: trial 1 loss=0.25\n",
        "outer: sweep done\n",
    ] {
        assert!(outer_log.contains(line), "missing {line:?} in {outer_log}");
    }
}
