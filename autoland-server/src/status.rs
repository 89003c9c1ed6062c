//! Health and queue status endpoints.

use std::sync::Arc;

use autoland_core::{QueueStatus, RepositoryKey};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::AppState;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "autoland"
    }))
}

#[derive(Debug, Serialize)]
pub struct RepositoryStatus {
    pub repository: String,
    #[serde(flatten)]
    pub status: QueueStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub testing: usize,
    pub repositories: Vec<RepositoryStatus>,
}

impl StatusData {
    pub fn from_snapshot(snapshot: Vec<(RepositoryKey, QueueStatus)>, version: String) -> Self {
        let repositories: Vec<_> = snapshot
            .into_iter()
            .map(|(repository, status)| RepositoryStatus {
                repository: repository.to_string(),
                status,
            })
            .collect();

        Self {
            version,
            generated_at: Utc::now(),
            testing: repositories.iter().filter(|r| !r.status.is_idle()).count(),
            repositories,
        }
    }
}

/// Check `Authorization: Bearer <token>` against the admin token.
///
/// With no admin token configured the protected endpoints are disabled.
#[allow(clippy::result_large_err)]
pub(crate) fn validate_auth(headers: &HeaderMap, admin_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = admin_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Endpoint is disabled (ADMIN_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(provided) if provided == expected_token => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

/// Handler: GET /status
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusData>, Response> {
    validate_auth(&headers, &state.admin_token)?;

    let snapshot = state.coordinator.snapshot().await;
    Ok(Json(StatusData::from_snapshot(
        snapshot,
        crate::get_bot_version(),
    )))
}

#[cfg(test)]
mod tests {
    use autoland_core::{AttemptMode, CommitSha};
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_validate_auth_success() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer test-token-123"),
        );
        let admin_token = Some("test-token-123".to_string());

        assert!(validate_auth(&headers, &admin_token).is_ok());
    }

    #[test]
    fn test_validate_auth_wrong_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong-token"),
        );
        let admin_token = Some("test-token-123".to_string());

        let response = validate_auth(&headers, &admin_token).unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_validate_auth_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        let admin_token = Some("test-token-123".to_string());

        let response = validate_auth(&headers, &admin_token).unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_validate_auth_disabled() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer test-token"),
        );

        let response = validate_auth(&headers, &None).unwrap_err();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_status_data_counts_testing_repositories() {
        let data = StatusData::from_snapshot(
            vec![
                (RepositoryKey::new("octo", "gadgets"), QueueStatus::Idle),
                (
                    RepositoryKey::new("octo", "widgets"),
                    QueueStatus::Testing {
                        pr_number: 42,
                        mode: AttemptMode::Merge,
                        head_sha: CommitSha::from("head042"),
                        integration_sha: None,
                    },
                ),
            ],
            "abc".to_string(),
        );

        assert_eq!(data.testing, 1);
        let json = serde_json::to_value(&data.repositories).unwrap();
        assert_eq!(
            json,
            json!([
                {"repository": "octo/gadgets", "state": "idle"},
                {
                    "repository": "octo/widgets",
                    "state": "testing",
                    "pr_number": 42,
                    "mode": "merge",
                    "head_sha": "head042",
                    "integration_sha": null
                }
            ])
        );
    }
}
