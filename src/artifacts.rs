// src/artifacts.rs
//
// =============================================================================
// RUNSCRIBE: ARTIFACT STAGING
// =============================================================================
//
// Responsibilities:
// 1. Serialize tables / objects / text into files (the bytes a run uploads).
// 2. `Artifactory`: a per-run staging directory that is uploaded as a whole
//    when the run ends, then removed.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use crate::table::Table;
use crate::tracking::TrackingBackend;

pub const ARTIFACTS_DIR_PREFIX: &str = "run_artifacts_";

// ============================================================================
// 1. FILE WRITERS
// ============================================================================

/// Artifact names are file names, never paths.
fn artifact_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let file = Path::new(name);
    if name.is_empty() || file.file_name().map(|f| f != file.as_os_str()).unwrap_or(true) {
        anyhow::bail!("Artifact name must be a plain file name: {:?}", name);
    }
    Ok(dir.join(file))
}

pub fn write_table(dir: &Path, name: &str, table: &Table) -> Result<PathBuf> {
    let path = artifact_path(dir, name)?;
    let bytes = table.to_csv().context("Failed to encode table as CSV")?;
    fs::write(&path, bytes).with_context(|| format!("Failed to write artifact {:?}", path))?;
    Ok(path)
}

/// Serializes any `Serialize` value as pretty JSON.
pub fn write_object<T: Serialize + ?Sized>(dir: &Path, name: &str, obj: &T) -> Result<PathBuf> {
    let path = artifact_path(dir, name)?;
    let bytes = serde_json::to_vec_pretty(obj).context("Failed to serialize object")?;
    fs::write(&path, bytes).with_context(|| format!("Failed to write artifact {:?}", path))?;
    Ok(path)
}

pub fn write_text<T: Display + ?Sized>(dir: &Path, name: &str, obj: &T) -> Result<PathBuf> {
    let path = artifact_path(dir, name)?;
    fs::write(&path, obj.to_string())
        .with_context(|| format!("Failed to write artifact {:?}", path))?;
    Ok(path)
}

// ============================================================================
// 2. THE ARTIFACTORY
// ============================================================================

pub struct Artifactory {
    run_id: String,
    dir: PathBuf,
    closed: bool,
}

impl Artifactory {
    /// Creates (or reuses) the staging directory.
    /// Default location: `./run_artifacts_<run_id>`.
    pub fn new(run_id: &str, dir: Option<PathBuf>) -> Result<Self> {
        let dir = match dir {
            Some(d) => d,
            None => std::env::current_dir()
                .context("Failed to resolve working directory")?
                .join(format!("{}{}", ARTIFACTS_DIR_PREFIX, run_id)),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact dir {:?}", dir))?;
        crate::tee_println!("Artifact directory for current run: {}", dir.display());
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn log_table(&self, name: &str, table: &Table) -> Result<PathBuf> {
        write_table(&self.dir, name, table)
    }

    pub fn log_object<T: Serialize + ?Sized>(&self, name: &str, obj: &T) -> Result<PathBuf> {
        write_object(&self.dir, name, obj)
    }

    pub fn log_object_as_text<T: Display + ?Sized>(&self, name: &str, obj: &T) -> Result<PathBuf> {
        write_text(&self.dir, name, obj)
    }

    /// Uploads the staging directory, then every extra directory, to `run_id`
    /// on `backend`. Extra directories that do not exist are skipped with a
    /// warning; otherwise stops at the first backend failure.
    pub fn upload(
        &self,
        backend: &mut dyn TrackingBackend,
        run_id: &str,
        extra_dirs: &[PathBuf],
    ) -> Result<(), crate::error::TrackingError> {
        crate::tee_println!("Logging artifacts for run {}...", self.run_id);
        if self.closed {
            crate::tee_println!("Artifactory is already closed! Artifact logging skipped.");
        } else {
            crate::tee_println!("Logging artifacts in {}...", self.dir.display());
            backend.log_artifacts(run_id, &self.dir)?;
        }
        for extra in extra_dirs {
            if !extra.is_dir() {
                log::warn!(
                    "Run {}: artifact dir {:?} is not a directory, skipped",
                    run_id,
                    extra
                );
                continue;
            }
            crate::tee_println!("Logging artifacts in {}...", extra.display());
            backend.log_artifacts(run_id, extra)?;
        }
        crate::tee_println!("Done logging artifacts.");
        Ok(())
    }

    /// Removes the staging directory. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove artifact dir {:?}: {}", self.dir, e);
            }
        }
    }
}

impl Drop for Artifactory {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_text(dir.path(), "../escape.txt", "x").is_err());
        assert!(write_text(dir.path(), "a/b.txt", "x").is_err());
        assert!(write_text(dir.path(), "", "x").is_err());
        assert!(write_text(dir.path(), "ok.txt", "x").is_ok());
    }

    #[test]
    fn object_and_text_forms() {
        let dir = tempfile::tempdir().unwrap();
        let obj = BTreeMap::from([("a", 3), ("b", 88)]);

        let p = write_object(dir.path(), "obj.json", &obj).unwrap();
        let back: BTreeMap<String, i32> =
            serde_json::from_slice(&fs::read(p).unwrap()).unwrap();
        assert_eq!(back["b"], 88);

        let p = write_text(dir.path(), "list.txt", &format!("{:?}", [1, 3, 5])).unwrap();
        assert_eq!(fs::read_to_string(p).unwrap(), "[1, 3, 5]");
    }

    #[test]
    fn close_removes_staging_dir_once() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("stage");
        let mut art = Artifactory::new("r1", Some(staging.clone())).unwrap();
        art.log_object_as_text("note.txt", "hello").unwrap();
        assert!(staging.join("note.txt").exists());

        art.close();
        assert!(!staging.exists());
        art.close();
        assert!(art.is_closed());
    }

    #[test]
    fn missing_extra_dir_is_skipped() {
        use crate::tracking::local::LocalStore;

        let root = tempfile::tempdir().unwrap();
        let mut store = LocalStore::new(root.path().join("mlruns"));
        let exp = store.ensure_experiment("e").unwrap();
        let run = store.create_run(&exp, None, 0, &BTreeMap::new()).unwrap();

        let art = Artifactory::new(&run.run_id, Some(root.path().join("stage"))).unwrap();
        art.log_object_as_text("note.txt", "hello").unwrap();
        let extra = root.path().join("extra");
        fs::create_dir_all(&extra).unwrap();
        fs::write(extra.join("more.txt"), "more").unwrap();

        let missing = root.path().join("never-created");
        art.upload(&mut store, &run.run_id, &[missing, extra]).unwrap();

        let dir = store.run_dir(&run.run_id).unwrap();
        assert!(dir.join("artifacts/note.txt").is_file());
        assert!(dir.join("artifacts/more.txt").is_file());
    }
}
