// src/tags.rs
//
// =============================================================================
// RUNSCRIBE: DEFAULT RUN TAGS
// =============================================================================
//
// Tags attached to every run: source-control identity of the working
// directory plus where the run executed. Each value is computed once per
// process and cached; a lookup never fails, it degrades to a sentinel string.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

pub const NOT_FROM_GIT_REPO: &str = "NotFromGitRepo";
pub const UNKNOWN_VALUE: &str = "UnknownValue";
pub const NOT_FROM_SAGEMAKER: &str = "NotFromSageMaker";

const SAGEMAKER_METADATA: &str = "/opt/ml/metadata/resource-metadata.json";

// ============================================================================
// 1. GIT
// ============================================================================

/// Runs `git <args>` with a minimal, locale-neutral environment.
/// Returns trimmed stdout, or `None` on any failure or empty output.
fn git(args: &[&str], cwd: Option<&Path>) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).env_clear();
    for key in ["SYSTEMROOT", "PATH", "HOME"] {
        if let Ok(v) = std::env::var(key) {
            cmd.env(key, v);
        }
    }
    cmd.env("LANGUAGE", "C").env("LANG", "C").env("LC_ALL", "C");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!out.is_empty()).then_some(out)
}

/// `https://host/org/proj.git` -> `proj`.
pub fn repo_name_from_url(url: &str) -> String {
    let name = url.rsplit(['/', ':']).next().unwrap_or(url);
    name.strip_suffix(".git").unwrap_or(name).to_string()
}

/// Source-control tags for the repository containing `cwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitTags {
    pub repo: String,
    pub branch: String,
    pub username: String,
    pub user_email: String,
    pub commit_checksum: String,
}

impl GitTags {
    pub fn detect(cwd: Option<&Path>) -> Self {
        let in_repo = git(&["rev-parse", "--git-dir"], cwd).is_some();
        let repo = if in_repo {
            git(&["config", "--get", "remote.origin.url"], cwd)
                .map(|url| repo_name_from_url(&url))
                .unwrap_or_else(|| UNKNOWN_VALUE.into())
        } else {
            NOT_FROM_GIT_REPO.into()
        };
        let branch = if in_repo {
            // Detached HEAD has no active branch.
            git(&["symbolic-ref", "--short", "-q", "HEAD"], cwd)
                .unwrap_or_else(|| NOT_FROM_GIT_REPO.into())
        } else {
            NOT_FROM_GIT_REPO.into()
        };

        Self {
            repo,
            branch,
            username: git(&["config", "user.name"], cwd).unwrap_or_else(|| UNKNOWN_VALUE.into()),
            user_email: git(&["config", "user.email"], cwd)
                .unwrap_or_else(|| UNKNOWN_VALUE.into()),
            commit_checksum: git(&["rev-parse", "HEAD"], cwd)
                .unwrap_or_else(|| NOT_FROM_GIT_REPO.into()),
        }
    }
}

// ============================================================================
// 2. HOST
// ============================================================================

#[derive(Deserialize)]
struct ResourceMetadata {
    #[serde(rename = "ResourceName")]
    resource_name: String,
}

pub fn sagemaker_instance_name_from(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ResourceMetadata>(&raw).ok())
        .map(|m| m.resource_name)
        .unwrap_or_else(|| NOT_FROM_SAGEMAKER.into())
}

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into())
}

// ============================================================================
// 3. THE TAG SET
// ============================================================================

pub fn build_tags(git: &GitTags, sagemaker: String, host: String) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("git_repo".to_string(), git.repo.clone()),
        ("git_branch".to_string(), git.branch.clone()),
        ("git_username".to_string(), git.username.clone()),
        ("git_user_email".to_string(), git.user_email.clone()),
        ("git_commit_checksum".to_string(), git.commit_checksum.clone()),
        ("sagemaker_instance_name".to_string(), sagemaker),
        ("host".to_string(), host),
    ])
}

/// Default tags for the current process, computed on first call.
pub fn default_tags() -> &'static BTreeMap<String, String> {
    static TAGS: OnceLock<BTreeMap<String, String>> = OnceLock::new();
    TAGS.get_or_init(|| {
        let tags = build_tags(
            &GitTags::detect(None),
            sagemaker_instance_name_from(SAGEMAKER_METADATA),
            host_name(),
        );
        log::debug!("Default run tags: {:?}", tags);
        tags
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_names() {
        assert_eq!(repo_name_from_url("https://github.com/acme/widgets.git"), "widgets");
        assert_eq!(repo_name_from_url("git@github.com:acme/widgets.git"), "widgets");
        assert_eq!(repo_name_from_url("/srv/git/widgets"), "widgets");
        assert_eq!(repo_name_from_url("widgets"), "widgets");
    }

    #[test]
    fn sagemaker_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        assert_eq!(sagemaker_instance_name_from(&path), NOT_FROM_SAGEMAKER);

        std::fs::write(&path, r#"{"ResourceName": "nb-42", "Other": 1}"#).unwrap();
        assert_eq!(sagemaker_instance_name_from(&path), "nb-42");

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(sagemaker_instance_name_from(&path), NOT_FROM_SAGEMAKER);
    }

    #[test]
    fn outside_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let tags = GitTags::detect(Some(dir.path()));
        assert_eq!(tags.repo, NOT_FROM_GIT_REPO);
        assert_eq!(tags.branch, NOT_FROM_GIT_REPO);
        assert_eq!(tags.commit_checksum, NOT_FROM_GIT_REPO);
    }

    #[test]
    fn tag_keys() {
        let git = GitTags {
            repo: "r".into(),
            branch: "b".into(),
            username: "u".into(),
            user_email: "e".into(),
            commit_checksum: "c".into(),
        };
        let tags = build_tags(&git, "s".into(), "h".into());
        let keys: Vec<_> = tags.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "git_branch",
                "git_commit_checksum",
                "git_repo",
                "git_user_email",
                "git_username",
                "host",
                "sagemaker_instance_name"
            ]
        );
    }
}
