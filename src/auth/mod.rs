//! Access control for git operations.
//!
//! Validates repository identifiers, checks presented SSH keys against the
//! external key authority, and composes both with repository provisioning
//! into the per-operation [`AccessGate`] decision.

pub mod authority;
pub mod gate;
pub mod repo_name;

pub use authority::{AuthorityClient, PublicKeyLine};
pub use gate::{AccessControl, AccessGate};
