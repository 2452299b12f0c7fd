//! Post-receive backup hook.
//!
//! Every new repository gets a `hooks/post-receive` script that, for each
//! updated ref, archives the pushed tree as a zip file under the backup root
//! and uploads it to the backup endpoint with `curl`.  The script runs inside
//! `git receive-pack`, never inside this process, and must not turn a backup
//! failure into a rejected push: it always exits 0.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use tracing::{debug, instrument};

use crate::auth::repo_name::is_valid_repo_name;

/// Revision git reports as `newrev` when a ref is deleted.
pub const ZERO_REV: &str = "0000000000000000000000000000000000000000";

/// Location of the hook relative to the bare repository root.
pub const HOOK_RELATIVE_PATH: &str = "hooks/post-receive";

/// Seconds `curl` may spend on a single upload attempt.
pub const UPLOAD_TIMEOUT_SECS: u32 = 30;

/// Extra upload attempts after the first failure.
pub const UPLOAD_RETRIES: u32 = 3;

// Parameters are bound once at the top of the script; this body only ever
// expands those variables, double-quoted.
const SCRIPT_BODY: &str = r#"
while read -r oldrev newrev refname; do
    if [ -z "$newrev" ] || [ "$newrev" = "$ZERO_REV" ]; then
        continue
    fi

    if ! mkdir -p "$BACKUP_DIR"; then
        echo "backup: cannot create $BACKUP_DIR for $REPO" >&2
        continue
    fi

    zip_path="$BACKUP_DIR/$newrev.zip"
    if ! git archive --format=zip --output="$zip_path" "$newrev"; then
        echo "backup: failed to archive $newrev ($refname) of $REPO" >&2
        continue
    fi

    if ! curl --silent --show-error --fail \
        --max-time "$UPLOAD_TIMEOUT" --retry "$UPLOAD_RETRIES" \
        -F "repo=$REPO" \
        -F "commit=$newrev" \
        -F "file=@$zip_path" \
        "$UPLOAD_URL" >/dev/null; then
        echo "backup: failed to upload $zip_path for $REPO" >&2
    fi
done

exit 0
"#;

/// A rendered post-receive hook script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHook {
    script: String,
}

impl BackupHook {
    /// Render the hook for `repo`.
    ///
    /// Archives land in `{backup_root}/{repo}/{newrev}.zip`.  git runs hooks
    /// from inside the bare repository, so callers installing a real hook
    /// should pass an absolute `backup_root`.
    pub fn render(backup_root: &Path, repo: &str, upload_url: &str) -> Result<Self> {
        ensure!(
            is_valid_repo_name(repo),
            "refusing to render backup hook for invalid repository name {repo:?}"
        );

        let backup_dir = backup_root.join(repo);
        let backup_dir = backup_dir
            .to_str()
            .with_context(|| format!("backup path is not UTF-8: {}", backup_dir.display()))?;

        let mut script = String::from("#!/bin/sh\n");
        script.push_str("# post-receive: archive and upload every pushed revision.\n");
        script.push_str("# Generated once when the repository was created.\n\n");
        push_assignment(&mut script, "REPO", repo);
        push_assignment(&mut script, "BACKUP_DIR", backup_dir);
        push_assignment(&mut script, "UPLOAD_URL", upload_url);
        push_assignment(&mut script, "UPLOAD_TIMEOUT", &UPLOAD_TIMEOUT_SECS.to_string());
        push_assignment(&mut script, "UPLOAD_RETRIES", &UPLOAD_RETRIES.to_string());
        push_assignment(&mut script, "ZERO_REV", ZERO_REV);
        script.push_str(SCRIPT_BODY);

        Ok(Self { script })
    }

    pub fn as_str(&self) -> &str {
        &self.script
    }

    /// Path the hook is installed at inside `repo_path`.
    pub fn path_in(repo_path: &Path) -> PathBuf {
        repo_path.join(HOOK_RELATIVE_PATH)
    }

    /// Write the hook into the bare repository at `repo_path` with mode 0755.
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub async fn install(&self, repo_path: &Path) -> Result<PathBuf> {
        let hook_path = Self::path_in(repo_path);
        if let Some(hooks_dir) = hook_path.parent() {
            tokio::fs::create_dir_all(hooks_dir)
                .await
                .with_context(|| format!("failed to create {}", hooks_dir.display()))?;
        }

        tokio::fs::write(&hook_path, self.script.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", hook_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))
                .await
                .with_context(|| format!("failed to mark {} executable", hook_path.display()))?;
        }

        debug!(hook = %hook_path.display(), "post-receive hook installed");
        Ok(hook_path)
    }
}

fn push_assignment(script: &mut String, name: &str, value: &str) {
    script.push_str(name);
    script.push('=');
    script.push_str(&shell_quote(value));
    script.push('\n');
}

/// Quote `value` as a single POSIX shell word.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::io::AsyncWriteExt;

    use super::*;

    fn demo_hook() -> BackupHook {
        BackupHook::render(Path::new("repo_backups"), "demo", "http://auth/upload").unwrap()
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn render_binds_parameters_once() {
        let hook = demo_hook();
        let script = hook.as_str();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("REPO='demo'\n"));
        assert!(script.contains("BACKUP_DIR='repo_backups/demo'\n"));
        assert!(script.contains("UPLOAD_URL='http://auth/upload'\n"));
        assert!(script.contains(&format!("ZERO_REV='{ZERO_REV}'\n")));
        assert_eq!(script.matches("http://auth/upload").count(), 1);
        assert!(script.trim_end().ends_with("exit 0"));
    }

    #[test]
    fn render_rejects_invalid_repo_name() {
        for bad in ["", "a/b", "..", "x;rm -rf /", "a b"] {
            assert!(
                BackupHook::render(Path::new("b"), bad, "http://u").is_err(),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn hostile_upload_url_stays_quoted() {
        let hook = BackupHook::render(Path::new("b"), "demo", "http://x/'; touch pwned; '").unwrap();
        assert!(hook
            .as_str()
            .contains(r"UPLOAD_URL='http://x/'\''; touch pwned; '\'''"));
    }

    #[tokio::test]
    async fn install_writes_executable_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("demo");
        tokio::fs::create_dir_all(&repo).await.unwrap();

        let hook = demo_hook();
        let path = hook.install(&repo).await.unwrap();

        assert_eq!(path, repo.join("hooks").join("post-receive"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), hook.as_str());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    // ── Executing the script against stub git/curl ──────────────────

    /// Lay out `{tmp}/bin/git` and `{tmp}/bin/curl` stubs that append their
    /// argv to `{tmp}/calls.log`.  `curl_status` is the stub curl's exit code.
    #[cfg(unix)]
    fn write_stubs(tmp: &Path, curl_status: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let bin = tmp.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let log = tmp.join("calls.log");

        let git = format!(
            "#!/bin/sh\necho \"git $*\" >> '{}'\nexit 0\n",
            log.display()
        );
        let curl = format!(
            "#!/bin/sh\necho \"curl $*\" >> '{}'\nexit {curl_status}\n",
            log.display()
        );
        for (name, body) in [("git", git), ("curl", curl)] {
            let path = bin.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        bin
    }

    #[cfg(unix)]
    async fn run_hook(tmp: &Path, hook: &BackupHook, stdin: &str, curl_status: i32) -> (i32, String) {
        let bin = write_stubs(tmp, curl_status);
        let script = tmp.join("post-receive");
        std::fs::write(&script, hook.as_str()).unwrap();

        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        let mut child = tokio::process::Command::new("sh")
            .arg(&script)
            .current_dir(tmp)
            .env("PATH", path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let mut child_stdin = child.stdin.take().unwrap();
        child_stdin.write_all(stdin.as_bytes()).await.unwrap();
        drop(child_stdin);

        let status = child.wait().await.unwrap();
        let log = std::fs::read_to_string(tmp.join("calls.log")).unwrap_or_default();
        (status.code().unwrap_or(-1), log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_archives_and_uploads_each_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let input = format!(
            "{ZERO_REV} abc123 refs/heads/main\nabc123 {ZERO_REV} refs/heads/gone\n"
        );

        let (status, log) = run_hook(tmp.path(), &demo_hook(), &input, 0).await;
        assert_eq!(status, 0);

        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2, "unexpected calls: {log}");
        assert_eq!(
            lines[0],
            "git archive --format=zip --output=repo_backups/demo/abc123.zip abc123"
        );
        assert!(lines[1].starts_with("curl "));
        assert!(lines[1].contains("--max-time 30"));
        assert!(lines[1].contains("--retry 3"));
        assert!(lines[1].contains("--fail"));
        assert!(lines[1].contains("-F repo=demo"));
        assert!(lines[1].contains("-F commit=abc123"));
        assert!(lines[1].contains("-F file=@repo_backups/demo/abc123.zip"));
        assert!(lines[1].ends_with(" http://auth/upload"));

        assert!(tmp.path().join("repo_backups/demo").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_skips_deletions_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let input = format!("abc123 {ZERO_REV} refs/heads/old\n");

        let (status, log) = run_hook(tmp.path(), &demo_hook(), &input, 0).await;
        assert_eq!(status, 0);
        assert!(log.is_empty(), "deletion must not archive or upload: {log}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_handles_empty_input() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, log) = run_hook(tmp.path(), &demo_hook(), "", 0).await;
        assert_eq!(status, 0);
        assert!(log.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_failure_does_not_fail_the_push() {
        let tmp = tempfile::tempdir().unwrap();
        let input = format!("{ZERO_REV} abc123 refs/heads/main\n{ZERO_REV} def456 refs/heads/dev\n");

        let (status, log) = run_hook(tmp.path(), &demo_hook(), &input, 22).await;
        assert_eq!(status, 0);
        // Both revisions are still attempted after the first upload fails.
        assert_eq!(log.lines().filter(|l| l.starts_with("curl ")).count(), 2);
        assert!(log.contains("--output=repo_backups/demo/def456.zip def456"));
    }
}
