//! Per-connection SSH handler: key capture, access checks and git process plumbing.
//!
//! Every connection is served by its own [`SshSession`].  Public-key
//! authentication accepts any key; the real decision is made per repository
//! when the client issues its `exec` request, through
//! [`AccessControl::auth_repo`].  Granted requests are served by spawning the
//! matching `git` pack command against the bare repository and streaming it
//! over the channel in both directions.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::auth::{AccessControl, PublicKeyLine};
use crate::AppState;

/// The only message a denied client ever sees.
const ACCESS_DENIED: &[u8] = b"ERROR: access denied\n";

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    /// Key the client authenticated with.
    key: Option<PublicKeyLine>,
    /// Stdin of the running git pack process; client data is forwarded here.
    child_stdin: Option<tokio::process::ChildStdin>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
}

impl SshSession {
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        state.metrics.metrics.active_sessions.inc();
        Self {
            state,
            peer_addr,
            key: None,
            child_stdin: None,
            git_protocol: None,
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.state.metrics.metrics.active_sessions.dec();
    }
}

// ---------------------------------------------------------------------------
// Channel close helper
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// RFC 4254.  Git's SSH transport treats a close without exit-status as
/// "the remote end hung up unexpectedly".
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

fn reject(session: &mut Session, channel_id: ChannelId, message: &[u8]) {
    session.extended_data(channel_id, 1, CryptoVec::from_slice(message));
    finish_channel(session, channel_id, 1);
}

// ---------------------------------------------------------------------------
// Git command parsing
// ---------------------------------------------------------------------------

/// The git transport commands served over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommand {
    UploadPack,
    ReceivePack,
    UploadArchive,
}

impl GitCommand {
    /// `git` subcommand that serves this request.
    fn subcommand(self) -> &'static str {
        match self {
            GitCommand::UploadPack => "upload-pack",
            GitCommand::ReceivePack => "receive-pack",
            GitCommand::UploadArchive => "upload-archive",
        }
    }

    fn notify(self, access: &dyn AccessControl, repo: &str, key: &PublicKeyLine) {
        match self {
            GitCommand::ReceivePack => access.on_push(repo, key),
            GitCommand::UploadPack => access.on_fetch(repo, key),
            GitCommand::UploadArchive => access.on_pull(repo, key),
        }
    }
}

/// Parse a git SSH exec request such as:
///
/// ```text
/// git-upload-pack 'demo.git'
/// git-receive-pack '/demo'
/// ```
///
/// Returns the command and the repository identifier with surrounding
/// quotes, a leading `/`, and a `.git` suffix removed.  The identifier is not
/// validated here; that is the access gate's first step.
pub fn parse_git_command(cmd: &str) -> Option<(GitCommand, String)> {
    let cmd = cmd.trim();
    let (git_cmd, rest) = if let Some(rest) = cmd.strip_prefix("git-upload-pack") {
        (GitCommand::UploadPack, rest)
    } else if let Some(rest) = cmd.strip_prefix("git-receive-pack") {
        (GitCommand::ReceivePack, rest)
    } else if let Some(rest) = cmd.strip_prefix("git-upload-archive") {
        (GitCommand::UploadArchive, rest)
    } else {
        return None;
    };

    // The command name must be followed by whitespace and the path.
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim();
    let rest = rest.trim_matches('\'').trim_matches('"');
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let repo = rest.strip_suffix(".git").unwrap_or(rest);

    if repo.is_empty() {
        return None;
    }

    Some((git_cmd, repo.to_string()))
}

// ---------------------------------------------------------------------------
// Repository menu
// ---------------------------------------------------------------------------

/// Text shown to clients that open an interactive shell instead of running
/// a git command.
pub fn render_menu(address: &str, repos: &[String]) -> String {
    let mut out = String::new();
    if !repos.is_empty() {
        out.push_str("\n### Repo Menu ###\n\n");
    }
    for repo in repos {
        out.push_str(&format!("• {repo}\n"));
        out.push_str(&format!("git clone ssh://{address}/{repo}\n"));
    }
    out.push_str("\n\n### Add some repos! ###\n\n");
    out.push_str("> cd some_repo\n");
    out.push_str(&format!("> git remote add origin ssh://{address}/some_repo\n"));
    out.push_str("> git push origin\n\n\n");
    out
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Accept any public key.  Which repositories the key may touch is
    /// decided per exec request.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let key = PublicKeyLine::from(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %key.fingerprint(),
            "SSH public-key auth"
        );
        self.key = Some(key);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture `GIT_PROTOCOL=version=2` so protocol v2 can be negotiated
    /// with the spawned pack command.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ref mut stdin) = self.child_stdin {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "failed to write to git stdin (process may have exited)");
                self.child_stdin.take();
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the ChildStdin closes the pipe, signalling EOF to git.
        self.child_stdin.take();
        Ok(())
    }

    /// Interactive logins get the repository menu and are disconnected.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let repos = match crate::git::list_repos(&self.state.config.repo_dir).await {
            Ok(repos) => repos,
            Err(e) => {
                error!(error = %e, "failed to list repositories");
                Vec::new()
            }
        };
        let menu = render_menu(&self.state.config.ssh_address(), &repos);
        session.data(channel_id, CryptoVec::from_slice(menu.as_bytes()));
        finish_channel(session, channel_id, 0);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(peer = ?self.peer_addr, command = %raw_cmd, "SSH exec request");

        let Some((git_cmd, repo)) = parse_git_command(&raw_cmd) else {
            warn!(command = %raw_cmd, "unrecognised SSH exec command");
            reject(
                session,
                channel_id,
                b"ERROR: Unknown command. Only git-upload-pack, git-receive-pack and git-upload-archive are supported.\n",
            );
            return Ok(());
        };

        let Some(key) = self.key.clone() else {
            warn!(repo = %repo, "exec request without an authenticated key");
            reject(session, channel_id, ACCESS_DENIED);
            return Ok(());
        };

        let access = self.state.access.auth_repo(&repo, &key).await;
        if !access.is_granted() {
            reject(session, channel_id, ACCESS_DENIED);
            return Ok(());
        }

        // The gate has validated `repo` and ensured the directory exists.
        let repo_path = self.state.config.repo_dir.join(&repo);

        let mut cmd = Command::new("git");
        cmd.arg(git_cmd.subcommand());
        if git_cmd == GitCommand::UploadPack {
            cmd.arg("--strict");
        }
        cmd.arg(&repo_path);
        if let Some(ref proto) = self.git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(repo = %repo, error = %e, "failed to spawn git {}", git_cmd.subcommand());
                reject(session, channel_id, b"ERROR: failed to start git\n");
                return Ok(());
            }
        };

        self.child_stdin = child.stdin.take();
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            error!(repo = %repo, "git child is missing piped stdout/stderr");
            let _ = child.start_kill();
            self.child_stdin.take();
            reject(session, channel_id, b"ERROR: failed to start git\n");
            return Ok(());
        };

        let handle = session.handle();
        let access = Arc::clone(&self.state.access);

        // Stream the child's output to the channel, then close it.  Tracked so
        // shutdown can wait for in-flight pushes to finish.
        self.state.tasks.spawn(async move {
            let pump_stdout = async {
                let mut buf = vec![0u8; 65536];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if handle
                                .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "error reading git stdout");
                            break;
                        }
                    }
                }
            };
            let collect_stderr = async {
                let mut stderr_buf = Vec::new();
                let _ = stderr.read_to_end(&mut stderr_buf).await;
                stderr_buf
            };
            let ((), stderr_buf) = tokio::join!(pump_stdout, collect_stderr);

            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(_) => 1,
            };

            if !stderr_buf.is_empty() {
                let _ = handle
                    .extended_data(channel_id, 1, CryptoVec::from_slice(&stderr_buf))
                    .await;
            }

            let _ = handle.exit_status_request(channel_id, exit_code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;

            if exit_code == 0 {
                git_cmd.notify(access.as_ref(), &repo, &key);
            } else {
                warn!(repo = %repo, exit_code, "git {} exited with failure", git_cmd.subcommand());
            }
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
