mod auth;
mod config;
mod git;
mod health;
mod http;
mod metrics;
mod ssh;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{AccessControl, AccessGate, AuthorityClient};
use crate::config::Config;
use crate::git::{GitInit, ProvisionSettings, RepoProvisioner};
use crate::metrics::MetricsRegistry;

/// How long in-flight git operations get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "repogate",
    about = "SSH git server with per-repository key authorization",
    long_about = "Settings are read from GIT_SERVER_* environment variables."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH and admin listeners (default).
    Serve,
    /// Print the post-receive hook a new repository would receive.
    RenderHook {
        /// Repository identifier.
        repo: String,
    },
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by every SSH session and admin request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub access: Arc<dyn AccessControl>,
    pub metrics: MetricsRegistry,
    /// Tracks spawned git subprocess pumps so shutdown can drain them.
    pub tasks: TaskTracker,
}

// ---------------------------------------------------------------------------
// Access gate setup
// ---------------------------------------------------------------------------

fn build_access_gate(config: &Config, metrics: &MetricsRegistry) -> Result<AccessGate> {
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("repogate/", env!("CARGO_PKG_VERSION")))
        .timeout(config.http_timeout)
        .build()
        .context("failed to build reqwest client")?;

    let authority = AuthorityClient::new(http_client, &config.authority_url, metrics.clone());

    let settings = ProvisionSettings::new(
        config.repo_dir.clone(),
        &config.backup_dir,
        config.upload_url.clone(),
    )?;
    let provisioner = RepoProvisioner::new(settings, Arc::new(GitInit), metrics.clone());

    Ok(AccessGate::new(authority, provisioner, metrics.clone()))
}

// ---------------------------------------------------------------------------
// Admin HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_admin_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.admin_listen;
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "admin server listening");

    axum::serve(listener, app)
        .await
        .context("admin server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(Config::from_env());

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Access gate ----
    let metrics = MetricsRegistry::new();
    let gate = build_access_gate(&config, &metrics)?;

    if let Some(Command::RenderHook { repo }) = cli.command {
        print!("{}", gate.provisioner().render_hook(&repo)?.as_str());
        return Ok(());
    }

    tracing::info!(
        ssh = %config.ssh_address(),
        repo_dir = %config.repo_dir.display(),
        backup_dir = %config.backup_dir.display(),
        authority = %config.authority_url,
        "starting repogate"
    );

    // ---- Storage roots ----
    for dir in [&config.repo_dir, &config.backup_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        access: Arc::new(gate),
        metrics,
        tasks: TaskTracker::new(),
    });

    // ---- Spawn services ----
    let mut ssh_handle = tokio::spawn({
        let s = Arc::clone(&state);
        async move {
            if let Err(e) = ssh::start_ssh_server(s).await {
                tracing::error!(error = %e, "SSH server failed");
            }
        }
    });

    let admin_handle = tokio::spawn({
        let s = Arc::clone(&state);
        async move {
            if let Err(e) = run_admin_server(s).await {
                tracing::error!(error = %e, "admin server failed");
            }
        }
    });

    // ---- Await shutdown ----
    tokio::select! {
        () = shutdown_signal() => {}
        _ = &mut ssh_handle => tracing::error!("SSH server stopped unexpectedly"),
    }
    ssh_handle.abort();
    admin_handle.abort();

    // In-flight git processes keep running until they exit or the drain
    // window closes.
    state.tasks.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, state.tasks.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            remaining = state.tasks.len(),
            "drain timeout elapsed with git operations still running"
        );
    }

    tracing::info!("repogate shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;

    use super::*;
    use crate::auth::gate::AccessLevel;
    use crate::auth::PublicKeyLine;

    /// Access control that refuses everything.
    pub(crate) struct DenyAll;

    #[async_trait]
    impl AccessControl for DenyAll {
        async fn auth_repo(&self, _repo: &str, _key: &PublicKeyLine) -> AccessLevel {
            AccessLevel::NoAccess
        }

        fn on_push(&self, _repo: &str, _key: &PublicKeyLine) {}

        fn on_fetch(&self, _repo: &str, _key: &PublicKeyLine) {}

        fn on_pull(&self, _repo: &str, _key: &PublicKeyLine) {}
    }

    pub(crate) fn state(config: Config) -> Arc<AppState> {
        Arc::new(AppState {
            config: Arc::new(config),
            access: Arc::new(DenyAll),
            metrics: MetricsRegistry::new(),
            tasks: TaskTracker::new(),
        })
    }

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["repogate"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_parses_render_hook() {
        let cli = Cli::try_parse_from(["repogate", "render-hook", "demo"]).unwrap();
        assert!(matches!(cli.command, Some(Command::RenderHook { repo }) if repo == "demo"));
    }
}
