//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands each incoming connection to an
/// [`SshSession`].
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key from `path`, or generate an Ed25519 key and persist it
/// there so the server keeps its identity across restarts.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key from {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    warn!(path = %path.display(), "SSH host key not found; generating a new Ed25519 key");
    let key = KeyPair::generate_ed25519();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;
    write_private(path, &pem)
        .with_context(|| format!("failed to write SSH host key to {}", path.display()))?;

    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run the SSH listener until it fails.  Shutdown is driven by the caller
/// dropping this future.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let host_key = load_or_generate_host_key(&state.config.host_key_path)?;
    let address = state.config.ssh_address();

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    info!(%address, "starting SSH server");

    let mut ssh_server = SshServer::new(state);
    ssh_server
        .run_on_address(config, address.as_str())
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
