//! Key authority client.
//!
//! The authority is an external HTTP service that owns the list of public
//! keys allowed to use each repository.  Keys are fetched on every decision
//! and never cached, so revoking a key upstream takes effect on the next
//! connection.  Every failure mode denies.

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::metrics::{AuthorityResult, MetricsRegistry};

// ---------------------------------------------------------------------------
// Key types
// ---------------------------------------------------------------------------

/// A public key in canonical single-line form: `<algorithm> <base64-blob>`,
/// without any trailing comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyLine(String);

impl PublicKeyLine {
    pub fn new(algorithm: &str, blob_base64: &str) -> Self {
        Self(format!("{} {}", algorithm.trim(), blob_base64.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 fingerprint in `ssh-keygen -l` format, used for logging only.
    pub fn fingerprint(&self) -> String {
        let blob = self
            .0
            .split_whitespace()
            .nth(1)
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
            .unwrap_or_default();
        let hash = Sha256::digest(&blob);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
        format!("SHA256:{encoded}")
    }
}

impl From<&PublicKey> for PublicKeyLine {
    /// The algorithm token is read from the wire blob, not `key.name()`:
    /// for RSA the latter reports the negotiated signature hash
    /// (`rsa-sha2-512`), while authorized_keys records say `ssh-rsa`.
    fn from(key: &PublicKey) -> Self {
        let blob = key.public_key_bytes();
        let algorithm = blob_algorithm(&blob).unwrap_or_else(|| key.name());
        Self::new(algorithm, &base64::engine::general_purpose::STANDARD.encode(&blob))
    }
}

/// First SSH string of a public key blob: its key type.
fn blob_algorithm(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}

impl std::fmt::Display for PublicKeyLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the authority's response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizedKey {
    pub id: String,
    pub key: String,
}

impl AuthorizedKey {
    /// The record's key with its last whitespace-separated token (the
    /// identity comment) removed and the remainder trimmed.
    ///
    /// Only single-token comments are handled: a key published without a
    /// comment loses its blob and therefore never matches.
    pub fn without_comment(&self) -> String {
        let tokens: Vec<&str> = self.key.split_whitespace().collect();
        let keep = tokens.len().saturating_sub(1);
        tokens[..keep].join(" ").trim().to_string()
    }

    pub fn matches(&self, presented: &PublicKeyLine) -> bool {
        self.without_comment() == presented.as_str().trim()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("key authority request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("key authority returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("key authority response is not a key list: {0}")]
    Decode(#[source] reqwest::Error),
}

impl AuthorityError {
    fn metric(&self) -> AuthorityResult {
        match self {
            Self::Transport(_) => AuthorityResult::TransportError,
            Self::Status(_) => AuthorityResult::BadStatus,
            Self::Decode(_) => AuthorityResult::DecodeError,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the key authority.
#[derive(Clone)]
pub struct AuthorityClient {
    http: reqwest::Client,
    base_url: String,
    metrics: MetricsRegistry,
}

impl AuthorityClient {
    /// `http` must already carry the request timeout; a request that exceeds
    /// it surfaces as a transport error and therefore as a denial.
    pub fn new(http: reqwest::Client, base_url: &str, metrics: MetricsRegistry) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            metrics,
        }
    }

    pub fn keys_url(&self, repo: &str) -> String {
        format!("{}/{}", self.base_url, repo)
    }

    /// Fetch the keys allowed to access `repo`.
    ///
    /// `repo` must already have passed
    /// [`is_valid_repo_name`](super::repo_name::is_valid_repo_name); it is
    /// used as a raw path segment.
    pub async fn fetch_keys(&self, repo: &str) -> Result<Vec<AuthorizedKey>, AuthorityError> {
        let resp = self
            .http
            .get(self.keys_url(repo))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(AuthorityError::Transport)?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(AuthorityError::Status(resp.status()));
        }

        resp.json::<Vec<AuthorizedKey>>()
            .await
            .map_err(AuthorityError::Decode)
    }

    /// Return `true` only if the authority lists `key` for `repo`.
    #[instrument(skip(self, key), fields(fingerprint = %key.fingerprint()))]
    pub async fn authorize(&self, repo: &str, key: &PublicKeyLine) -> bool {
        let keys = match self.fetch_keys(repo).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(repo, error = %e, "key authority lookup failed; denying");
                self.metrics.metrics.record_authority(e.metric());
                return false;
            }
        };

        if let Some(record) = keys.iter().find(|record| record.matches(key)) {
            debug!(repo, key_id = %record.id, "presented key is authorized");
            self.metrics.metrics.record_authority(AuthorityResult::Matched);
            return true;
        }

        debug!(repo, candidates = keys.len(), "presented key not in authority list");
        self.metrics.metrics.record_authority(AuthorityResult::NoMatch);
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
