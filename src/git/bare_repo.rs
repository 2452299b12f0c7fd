//! Bare Git repository helpers.
//!
//! Initialisation shells out to the `git` binary; inspection is plain
//! filesystem access through Tokio.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Run `git init --bare` in the existing directory `path`.
///
/// Unlike a general-purpose helper this never short-circuits on an existing
/// repository; existence checks belong to the provisioner, which holds the
/// provisioning lock while calling this.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a bare Git repository.
///
/// A bare repo must be a directory containing a `HEAD` file.  This is a
/// lightweight heuristic, not an integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if !is_dir {
        debug!("path does not exist or is not a directory");
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);

    if !head_exists {
        warn!("directory exists but has no HEAD; not a usable bare repo");
        return false;
    }

    true
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Names of the directories directly under `root`, sorted.
///
/// A missing root is an empty listing.
pub async fn list_repos(root: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", root.display()));
        }
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read {}", root.display()))?
    {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn validate_nonexistent_path() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!validate_bare_repo(&tmp.path().join("missing")).await);
    }

    #[tokio::test]
    async fn validate_directory_without_head() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!validate_bare_repo(tmp.path()).await);
    }

    #[tokio::test]
    async fn validate_directory_with_head() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert!(validate_bare_repo(tmp.path()).await);
    }

    #[tokio::test]
    async fn init_creates_bare_layout() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("demo");
        std::fs::create_dir(&repo).unwrap();

        init_bare_repo(&repo).await.unwrap();

        assert!(validate_bare_repo(&repo).await);
        assert!(repo.join("objects").is_dir());
        assert!(repo.join("refs").is_dir());
    }

    #[tokio::test]
    async fn list_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_repos(&tmp.path().join("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_returns_sorted_directories_only() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("zeta")).unwrap();
        std::fs::create_dir(tmp.path().join("alpha")).unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let names = list_repos(tmp.path()).await.unwrap();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
