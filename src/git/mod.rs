//! Bare repository storage: initialisation, provisioning and the backup hook.
//!
//! Repository creation and pack transfer shell out to the `git` binary
//! through `tokio::process::Command`.

pub mod bare_repo;
pub mod hook;
pub mod provision;

pub use bare_repo::list_repos;
pub use provision::{GitInit, ProvisionSettings, RepoProvisioner};
