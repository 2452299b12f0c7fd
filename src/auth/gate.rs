//! The access decision made for every git operation.
//!
//! [`AccessGate`] chains the three checks in a fixed order and stops at the
//! first failure:
//!
//! 1. the repository identifier must be valid (no I/O of any kind otherwise);
//! 2. the key authority must list the presented key for that repository;
//! 3. the repository must exist, or be provisioned successfully now.
//!
//! Only when all three pass is [`AccessLevel::ReadWrite`] returned.  The
//! reason for a denial is logged and counted but never reported to the
//! client.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::authority::{AuthorityClient, PublicKeyLine};
use super::repo_name::is_valid_repo_name;
use crate::git::RepoProvisioner;
use crate::metrics::{DecisionOutcome, GitOperation, MetricsRegistry};

// ---------------------------------------------------------------------------
// Decision type
// ---------------------------------------------------------------------------

/// Outcome of an access decision.  There is no read-only level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessLevel {
    #[default]
    NoAccess,
    ReadWrite,
}

impl AccessLevel {
    pub fn is_granted(&self) -> bool {
        matches!(self, AccessLevel::ReadWrite)
    }
}

// ---------------------------------------------------------------------------
// Collaborator contract
// ---------------------------------------------------------------------------

/// What the SSH transport asks of the access-control layer.
///
/// `auth_repo` runs before any protocol exchange.  The three notifications
/// fire after an operation finished and are informational only.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn auth_repo(&self, repo: &str, key: &PublicKeyLine) -> AccessLevel;

    fn on_push(&self, repo: &str, key: &PublicKeyLine);

    fn on_fetch(&self, repo: &str, key: &PublicKeyLine);

    fn on_pull(&self, repo: &str, key: &PublicKeyLine);
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// The access-control service: built once at startup and shared by every
/// session.
pub struct AccessGate {
    authority: AuthorityClient,
    provisioner: RepoProvisioner,
    metrics: MetricsRegistry,
}

impl AccessGate {
    pub fn new(
        authority: AuthorityClient,
        provisioner: RepoProvisioner,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            authority,
            provisioner,
            metrics,
        }
    }

    pub fn provisioner(&self) -> &RepoProvisioner {
        &self.provisioner
    }

    fn deny(&self, outcome: DecisionOutcome) -> AccessLevel {
        self.metrics.metrics.record_decision(outcome);
        AccessLevel::NoAccess
    }
}

#[async_trait]
impl AccessControl for AccessGate {
    #[instrument(skip(self, key), fields(fingerprint = %key.fingerprint()))]
    async fn auth_repo(&self, repo: &str, key: &PublicKeyLine) -> AccessLevel {
        if !is_valid_repo_name(repo) {
            warn!(repo, "rejected invalid repository name");
            return self.deny(DecisionOutcome::InvalidName);
        }

        if !self.authority.authorize(repo, key).await {
            warn!(repo, "key not authorized for repository");
            return self.deny(DecisionOutcome::Unauthorized);
        }

        if let Err(e) = self.provisioner.ensure_repo(repo).await {
            warn!(repo, error = %e, "provisioning failed; denying authorized key");
            return self.deny(DecisionOutcome::ProvisioningFailed);
        }

        info!(repo, "read-write access granted");
        self.metrics.metrics.record_decision(DecisionOutcome::Granted);
        AccessLevel::ReadWrite
    }

    fn on_push(&self, repo: &str, key: &PublicKeyLine) {
        info!(repo, fingerprint = %key.fingerprint(), "push");
        self.metrics.metrics.record_operation(GitOperation::Push);
    }

    fn on_fetch(&self, repo: &str, key: &PublicKeyLine) {
        info!(repo, fingerprint = %key.fingerprint(), "fetch");
        self.metrics.metrics.record_operation(GitOperation::Fetch);
    }

    fn on_pull(&self, repo: &str, key: &PublicKeyLine) {
        info!(repo, fingerprint = %key.fingerprint(), "pull");
        self.metrics.metrics.record_operation(GitOperation::Pull);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
