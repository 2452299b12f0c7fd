//! Lazy, serialised repository provisioning.
//!
//! The first authorised access to an identifier creates
//! `{repo_root}/{identifier}`, initialises it as a bare repository and
//! installs the backup hook.  A single provisioning lock is held across the
//! whole check-and-create sequence, so two sessions racing on the same new
//! identifier cannot both create it.  The lock is shared by all identifiers:
//! a slow `git init` delays every other first access behind it.
//!
//! Failures are not rolled back.  A directory left behind by a failed
//! sequence counts as existing on the next access.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use super::bare_repo;
use super::hook::BackupHook;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Initialiser seam
// ---------------------------------------------------------------------------

/// Turns an empty directory into a bare repository.
#[async_trait]
pub trait RepoInitializer: Send + Sync {
    async fn init_bare(&self, path: &Path) -> anyhow::Result<()>;
}

/// Production initialiser backed by `git init --bare`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitInit;

#[async_trait]
impl RepoInitializer for GitInit {
    async fn init_bare(&self, path: &Path) -> anyhow::Result<()> {
        bare_repo::init_bare_repo(path).await?;
        anyhow::ensure!(
            bare_repo::validate_bare_repo(path).await,
            "git init --bare left no HEAD in {}",
            path.display()
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to create repository directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to check repository directory {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialise bare repository at {}: {reason:#}", .path.display())]
    Init { path: PathBuf, reason: anyhow::Error },

    #[error("failed to install backup hook in {}: {reason:#}", .path.display())]
    Hook { path: PathBuf, reason: anyhow::Error },
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Where repositories live and what their backup hooks point at.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub repo_root: PathBuf,
    /// Absolute backup root baked into each new hook.
    pub backup_root: PathBuf,
    pub upload_url: String,
}

impl ProvisionSettings {
    /// Build settings, resolving a relative `backup_root` against the current
    /// directory.  Hooks run with the bare repository as their working
    /// directory, so a relative path would land inside the repository.
    pub fn new(repo_root: PathBuf, backup_root: &Path, upload_url: String) -> anyhow::Result<Self> {
        let backup_root = std::path::absolute(backup_root).with_context(|| {
            format!("failed to resolve backup root {}", backup_root.display())
        })?;
        Ok(Self {
            repo_root,
            backup_root,
            upload_url,
        })
    }
}

pub struct RepoProvisioner {
    settings: ProvisionSettings,
    initializer: Arc<dyn RepoInitializer>,
    metrics: MetricsRegistry,
    lock: Mutex<()>,
}

impl RepoProvisioner {
    pub fn new(
        settings: ProvisionSettings,
        initializer: Arc<dyn RepoInitializer>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            settings,
            initializer,
            metrics,
            lock: Mutex::new(()),
        }
    }

    /// Storage path for `repo`.  `repo` must be a validated identifier.
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.settings.repo_root.join(repo)
    }

    /// Render the hook a newly created `repo` would receive.
    pub fn render_hook(&self, repo: &str) -> anyhow::Result<BackupHook> {
        BackupHook::render(&self.settings.backup_root, repo, &self.settings.upload_url)
    }

    /// Make sure `repo` exists, creating and initialising it if absent.
    ///
    /// Returns immediately, without side effects, when the directory is
    /// already present.
    #[instrument(skip(self))]
    pub async fn ensure_repo(&self, repo: &str) -> Result<(), ProvisionError> {
        let _guard = self.lock.lock().await;

        let path = self.repo_path(repo);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ProvisionError::Stat {
                path: path.clone(),
                source,
            })?;
        if exists {
            return Ok(());
        }

        info!(path = %path.display(), "provisioning new repository");

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| ProvisionError::CreateDir {
                path: path.clone(),
                source,
            })?;

        if let Err(reason) = self.initializer.init_bare(&path).await {
            error!(path = %path.display(), error = %reason, "bare init failed; leaving directory in place");
            return Err(ProvisionError::Init { path, reason });
        }

        let installed = match self.render_hook(repo) {
            Ok(hook) => hook.install(&path).await,
            Err(e) => Err(e),
        };
        if let Err(reason) = installed {
            error!(path = %path.display(), error = %reason, "hook install failed; leaving repository in place");
            return Err(ProvisionError::Hook { path, reason });
        }

        self.metrics.metrics.repos_provisioned.inc();
        info!(path = %path.display(), "repository ready");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
