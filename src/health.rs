use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repo_storage: CheckResult,
    pub backup_storage: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// A storage root must be an existing, writable directory.
async fn check_storage(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_dir() => {
            CheckResult::unhealthy(format!("{} is not a directory", path.display()))
        }
        Ok(meta) if meta.permissions().readonly() => {
            CheckResult::unhealthy(format!("{} is read-only", path.display()))
        }
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Repository storage is required for every decision; backups are
/// best-effort, so losing that directory only degrades the service.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.repo_storage.ok {
        HealthStatus::Unhealthy
    } else if !checks.backup_storage.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

pub async fn run_checks(config: &Config) -> HealthResponse {
    let (repo_storage, backup_storage) = tokio::join!(
        check_storage(&config.repo_dir),
        check_storage(&config.backup_dir),
    );
    let checks = HealthChecks {
        repo_storage,
        backup_storage,
    };
    let status = aggregate_status(&checks);
    HealthResponse { status, checks }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = run_checks(&state.config).await;

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Path) -> Config {
        Config {
            repo_dir: root.join("repos"),
            backup_dir: root.join("repo_backups"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn all_directories_present_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::create_dir(&config.repo_dir).unwrap();
        std::fs::create_dir(&config.backup_dir).unwrap();

        let resp = run_checks(&config).await;
        assert_eq!(resp.status, HealthStatus::Ok);
        assert!(resp.checks.repo_storage.detail.is_none());
    }

    #[tokio::test]
    async fn missing_backup_dir_is_degraded() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::create_dir(&config.repo_dir).unwrap();

        let resp = run_checks(&config).await;
        assert_eq!(resp.status, HealthStatus::Degraded);
        assert!(!resp.checks.backup_storage.ok);
    }

    #[tokio::test]
    async fn repo_root_that_is_a_file_is_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::write(&config.repo_dir, "x").unwrap();
        std::fs::create_dir(&config.backup_dir).unwrap();

        let resp = run_checks(&config).await;
        assert_eq!(resp.status, HealthStatus::Unhealthy);
        assert!(resp
            .checks
            .repo_storage
            .detail
            .unwrap()
            .contains("not a directory"));
    }

    #[test]
    fn response_serialises_lowercase_status() {
        let resp = HealthResponse {
            status: HealthStatus::Degraded,
            checks: HealthChecks {
                repo_storage: CheckResult::healthy(),
                backup_storage: CheckResult::unhealthy("gone"),
            },
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["backup_storage"]["detail"], "gone");
        assert!(json["checks"]["repo_storage"].get("detail").is_none());
    }
}
