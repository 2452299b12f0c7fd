//! SSH transport for git.
//!
//! Accepts SSH connections, asks the access gate about every
//! `git-upload-pack` / `git-receive-pack` / `git-upload-archive` request, and
//! serves granted requests by running the corresponding `git` command against
//! the local bare repository.

pub mod server;
pub mod session;

pub use server::start_ssh_server;
