//! Process configuration sourced from `GIT_SERVER_*` environment variables.
//!
//! Every setting has a default.  Values that are missing, empty, or fail to
//! parse fall back to that default without error so that a half-configured
//! deployment still starts with predictable behaviour.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Variable names
// ---------------------------------------------------------------------------

pub const ENV_PORT: &str = "GIT_SERVER_PORT";
pub const ENV_HOST: &str = "GIT_SERVER_HOST";
pub const ENV_REPO_DIR: &str = "GIT_SERVER_REPO_DIR";
pub const ENV_BACKUP_DIR: &str = "GIT_SERVER_BACKUP_DIR";
pub const ENV_AUTHORITY_URL: &str = "GIT_SERVER_AUTHORIZATION_SERVER_URL";
pub const ENV_UPLOAD_URL: &str = "GIT_SERVER_BACKUP_UPLOAD_URL";
pub const ENV_HTTP_TIMEOUT: &str = "GIT_SERVER_HTTP_TIMEOUT";
pub const ENV_HOST_KEY_PATH: &str = "GIT_SERVER_SSH_KEY_PATH";
pub const ENV_ADMIN_LISTEN: &str = "GIT_SERVER_ADMIN_LISTEN";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TCP port of the SSH listener.
    pub port: u16,
    /// Interface the SSH listener binds to.
    pub host: String,
    /// Root directory holding one bare repository per identifier.
    pub repo_dir: PathBuf,
    /// Root directory the post-receive hook writes zip archives into.
    pub backup_dir: PathBuf,
    /// Base URL of the key authority; keys are fetched from `{url}/{repo}`.
    pub authority_url: String,
    /// Endpoint the post-receive hook uploads archives to.
    pub upload_url: String,
    /// Client-side deadline for every key authority request.
    pub http_timeout: Duration,
    /// PEM file holding the SSH host key.  Generated when missing.
    pub host_key_path: PathBuf,
    /// Socket address for the `/healthz` and `/metrics` listener.
    pub admin_listen: SocketAddr,
}

fn default_port() -> u16 {
    2222
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("repos")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("repo_backups")
}

fn default_authority_url() -> String {
    "http://0.0.0.0:3000".to_string()
}

fn default_upload_url(authority_url: &str) -> String {
    format!("{}/upload", authority_url.trim_end_matches('/'))
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from(".ssh/id_ed25519")
}

fn default_admin_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Default for Config {
    fn default() -> Self {
        let authority_url = default_authority_url();
        Self {
            port: default_port(),
            host: default_host(),
            repo_dir: default_repo_dir(),
            backup_dir: default_backup_dir(),
            upload_url: default_upload_url(&authority_url),
            authority_url,
            http_timeout: default_http_timeout(),
            host_key_path: default_host_key_path(),
            admin_listen: default_admin_listen(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));

        let authority_url = get(ENV_AUTHORITY_URL).unwrap_or_else(default_authority_url);
        let upload_url = get(ENV_UPLOAD_URL).unwrap_or_else(|| default_upload_url(&authority_url));

        Self {
            port: get(ENV_PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_port),
            host: get(ENV_HOST).unwrap_or_else(default_host),
            repo_dir: get(ENV_REPO_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(default_repo_dir),
            backup_dir: get(ENV_BACKUP_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(default_backup_dir),
            authority_url,
            upload_url,
            http_timeout: get(ENV_HTTP_TIMEOUT)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or_else(default_http_timeout),
            host_key_path: get(ENV_HOST_KEY_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(default_host_key_path),
            admin_listen: get(ENV_ADMIN_LISTEN)
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_admin_listen),
        }
    }

    /// `host:port` as used in clone URLs and the listener bind.
    pub fn ssh_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 2222);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.repo_dir, PathBuf::from("repos"));
        assert_eq!(config.backup_dir, PathBuf::from("repo_backups"));
        assert_eq!(config.authority_url, "http://0.0.0.0:3000");
        assert_eq!(config.upload_url, "http://0.0.0.0:3000/upload");
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.host_key_path, PathBuf::from(".ssh/id_ed25519"));
    }

    #[test]
    fn explicit_values_are_used() {
        let config = load(&[
            (ENV_PORT, "2022"),
            (ENV_HOST, "127.0.0.1"),
            (ENV_REPO_DIR, "/srv/git"),
            (ENV_BACKUP_DIR, "/srv/backups"),
            (ENV_AUTHORITY_URL, "http://auth:8080"),
            (ENV_HTTP_TIMEOUT, "3"),
            (ENV_HOST_KEY_PATH, "/etc/repogate/host_key"),
            (ENV_ADMIN_LISTEN, "0.0.0.0:9100"),
        ]);
        assert_eq!(config.port, 2022);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.repo_dir, PathBuf::from("/srv/git"));
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.authority_url, "http://auth:8080");
        assert_eq!(config.upload_url, "http://auth:8080/upload");
        assert_eq!(config.http_timeout, Duration::from_secs(3));
        assert_eq!(config.admin_listen.port(), 9100);
    }

    #[test]
    fn upload_url_override_wins() {
        let config = load(&[
            (ENV_AUTHORITY_URL, "http://auth/"),
            (ENV_UPLOAD_URL, "http://backup/store"),
        ]);
        assert_eq!(config.upload_url, "http://backup/store");
    }

    #[test]
    fn derived_upload_url_drops_trailing_slash() {
        let config = load(&[(ENV_AUTHORITY_URL, "http://auth/")]);
        assert_eq!(config.upload_url, "http://auth/upload");
    }

    #[test]
    fn invalid_values_fall_back_silently() {
        let config = load(&[
            (ENV_PORT, "not-a-port"),
            (ENV_HTTP_TIMEOUT, "ten"),
            (ENV_ADMIN_LISTEN, "nowhere"),
            (ENV_HOST, "   "),
        ]);
        assert_eq!(config.port, 2222);
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.admin_listen, default_admin_listen());
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = load(&[(ENV_HTTP_TIMEOUT, "0")]);
        assert_eq!(config.http_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ssh_address_brackets_ipv6() {
        let mut config = Config::default();
        assert_eq!(config.ssh_address(), "0.0.0.0:2222");
        config.host = "::1".to_string();
        assert_eq!(config.ssh_address(), "[::1]:2222");
    }
}
