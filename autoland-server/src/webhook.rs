//! Inbound webhooks: GitHub review comments, CI callbacks and manual
//! reconciliation.
//!
//! Every response carries one of the tokens `PASS`, `ASSIGNED`, `AUTO`,
//! `AUTO ALREADY EXISTS`, `MERGE`, `UNKNOWN_REVIEWER`, `WHO`, `ValueError`
//! or `KeyError`, derived from the coordinator's [`Reason`].

use std::sync::Arc;

use autoland_core::{
    CiReport, CiStatus, CommitSha, QueueStatus, Reason, RepositoryKey, Resolution, ReviewComment,
    Verdict,
};
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::http_log::CorrelationId;
use crate::status::validate_auth;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub result: &'static str,
    pub detail: String,
}

impl WebhookResponse {
    fn pass(detail: impl Into<String>) -> Json<Self> {
        Json(Self {
            result: "PASS",
            detail: detail.into(),
        })
    }

    fn from_resolution(resolution: &Resolution) -> Json<Self> {
        Json(Self {
            result: response_token(&resolution.reason),
            detail: resolution.reason.to_string(),
        })
    }
}

/// Why a payload could not be handled.
#[derive(Debug)]
pub enum WebhookRejection {
    MissingField(&'static str),
    InvalidPayload(String),
    Unauthorized,
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        match self {
            WebhookRejection::MissingField(field) => (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse {
                    result: "KeyError",
                    detail: format!("missing field `{}`", field),
                }),
            )
                .into_response(),
            WebhookRejection::InvalidPayload(detail) => {
                (StatusCode::BAD_REQUEST, detail).into_response()
            }
            WebhookRejection::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
        }
    }
}

/// The response token for a coordinator outcome.
pub fn response_token(reason: &Reason) -> &'static str {
    match reason {
        Reason::Started { .. } => "AUTO",
        Reason::Finished {
            verdict: Verdict::Landed { .. },
            ..
        } => "MERGE",
        Reason::BranchConflict { .. } => "AUTO ALREADY EXISTS",
        Reason::Assigned { .. } => "ASSIGNED",
        Reason::UnauthorizedSender { .. } => "UNKNOWN_REVIEWER",
        Reason::UnrecognizedCommand { .. } => "WHO",
        Reason::MalformedCommand => "ValueError",
        _ => "PASS",
    }
}

pub fn webhook_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let github = Router::new()
        .route("/webhook/github", post(github_webhook_handler))
        .layer(middleware::from_fn_with_state(state, verify_webhook_signature));

    Router::new()
        .merge(github)
        .route("/webhook/ci", post(ci_webhook_handler))
        .route("/reconcile/{owner}/{name}", post(reconcile_handler))
}

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut request = Request::from_parts(parts, axum::body::Body::from(bytes));
    request
        .extensions_mut()
        .insert(CorrelationId(Uuid::new_v4().to_string()));

    Ok(next.run(request).await)
}

fn field<'a>(payload: &'a Value, name: &'static str) -> Result<&'a Value, WebhookRejection> {
    let pointer = format!("/{}", name.replace('.', "/"));
    payload
        .pointer(&pointer)
        .filter(|value| !value.is_null())
        .ok_or(WebhookRejection::MissingField(name))
}

fn str_field<'a>(payload: &'a Value, name: &'static str) -> Result<&'a str, WebhookRejection> {
    field(payload, name)?
        .as_str()
        .ok_or(WebhookRejection::MissingField(name))
}

fn optional_str(payload: &Value, name: &'static str) -> Option<String> {
    field(payload, name)
        .ok()
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Pull the review comment out of an `issue_comment` payload.
fn parse_comment(payload: &Value) -> Result<ReviewComment, WebhookRejection> {
    let body = str_field(payload, "comment.body")?;
    let sender = str_field(payload, "comment.user.login")?;
    let owner = str_field(payload, "repository.owner.login")?;
    let name = str_field(payload, "repository.name")?;
    let issue_number = field(payload, "issue.number")?
        .as_u64()
        .ok_or(WebhookRejection::MissingField("issue.number"))?;

    Ok(ReviewComment {
        repository: RepositoryKey::new(owner, name),
        issue_number,
        sender: sender.to_string(),
        body: body.to_string(),
    })
}

/// Handler: POST /webhook/github
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, WebhookRejection> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let event = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if event != "issue_comment" {
        info!("Ignoring GitHub event `{}`", event);
        return Ok(WebhookResponse::pass(format!("ignored event `{}`", event)));
    }

    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| WebhookRejection::InvalidPayload(e.to_string()))?;
    let payload: Value = serde_json::from_slice(&bytes)
        .map_err(|e| WebhookRejection::InvalidPayload(format!("invalid JSON: {}", e)))?;

    let action = str_field(&payload, "action")?;
    if action != "created" {
        return Ok(WebhookResponse::pass(format!("ignored action `{}`", action)));
    }

    let comment = parse_comment(&payload)?;
    let span = info_span!(
        "comment",
        correlation_id = %correlation_id,
        repository = %comment.repository,
        issue = comment.issue_number,
        sender = %comment.sender,
    );

    let resolution = state
        .coordinator
        .handle_comment(comment)
        .instrument(span)
        .await;

    info!(
        correlation_id = %correlation_id,
        "Comment resolved: {}", resolution.reason
    );
    Ok(WebhookResponse::from_resolution(&resolution))
}

/// Accept `Authorization: <token>`, `token <token>` or `Bearer <token>`.
fn ci_token_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(provided) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let provided = provided.trim();
    let provided = provided
        .strip_prefix("Bearer ")
        .or_else(|| provided.strip_prefix("token "))
        .unwrap_or(provided);
    provided == expected
}

/// CI providers post JSON, or a form whose `payload` field holds the JSON.
fn decode_ci_payload(headers: &HeaderMap, bytes: &[u8]) -> Result<Value, WebhookRejection> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let json = if is_form {
        url::form_urlencoded::parse(bytes)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .ok_or(WebhookRejection::MissingField("payload"))?
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WebhookRejection::InvalidPayload("body is not UTF-8".to_string()))?
    };

    serde_json::from_str(&json)
        .map_err(|e| WebhookRejection::InvalidPayload(format!("invalid JSON: {}", e)))
}

fn parse_ci_report(payload: &Value) -> Result<(RepositoryKey, CiReport), WebhookRejection> {
    let branch = str_field(payload, "branch")?;
    let status = str_field(payload, "state")?;
    let owner = str_field(payload, "repository.owner_name")?;
    let name = str_field(payload, "repository.name")?;

    let report = CiReport {
        branch: branch.to_string(),
        status: CiStatus::parse(status),
        commit: optional_str(payload, "commit").map(CommitSha),
        message: optional_str(payload, "message"),
        build_url: optional_str(payload, "build_url"),
    };
    Ok((RepositoryKey::new(owner, name), report))
}

/// Handler: POST /webhook/ci
pub async fn ci_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookRejection> {
    if let Some(expected) = &state.ci_token {
        if !ci_token_matches(&headers, expected) {
            warn!("Rejecting CI callback with a missing or wrong token");
            return Err(WebhookRejection::Unauthorized);
        }
    }

    let payload = decode_ci_payload(&headers, &body)?;
    let (repository, report) = parse_ci_report(&payload)?;

    let correlation_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "ci",
        correlation_id = %correlation_id,
        repository = %repository,
        branch = %report.branch,
        status = %report.status,
    );

    let resolution = state
        .coordinator
        .ci_report(&repository, report)
        .instrument(span)
        .await;

    info!(
        correlation_id = %correlation_id,
        "CI callback for {} resolved: {}", repository, resolution.reason
    );
    Ok(WebhookResponse::from_resolution(&resolution))
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub repository: String,
    pub detail: String,
    pub status: QueueStatus,
}

/// Handler: POST /reconcile/{owner}/{name}
pub async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ReconcileResponse>, Response> {
    validate_auth(&headers, &state.admin_token)?;

    let repository = RepositoryKey::new(owner, name);
    let resolution = state
        .coordinator
        .reconcile(&repository)
        .instrument(info_span!("reconcile", repository = %repository))
        .await;

    Ok(Json(ReconcileResponse {
        repository: repository.to_string(),
        detail: resolution.reason.to_string(),
        status: resolution.status,
    }))
}

#[cfg(test)]
mod tests {
    use autoland_core::testing::{pull_request, FakeHost};
    use autoland_core::{Coordinator, LogNotifier, QueueConfig, ReviewerSet};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "hush";

    fn repo() -> RepositoryKey {
        RepositoryKey::new("octo", "widgets")
    }

    fn setup() -> (Arc<FakeHost>, Arc<AppState>) {
        let host = Arc::new(FakeHost::new());
        host.add_pull_request(&repo(), pull_request(&repo(), 42, "head042"));
        let config = QueueConfig::new("@bot", ReviewerSet::new(["alice"]));
        let state = Arc::new(AppState {
            coordinator: Arc::new(Coordinator::new(
                config,
                host.clone(),
                Arc::new(LogNotifier),
            )),
            webhook_secret: SECRET.to_string(),
            ci_token: Some("ci-secret".to_string()),
            admin_token: Some("admin".to_string()),
        });
        (host, state)
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn comment_payload(sender: &str, body: &str) -> Value {
        serde_json::json!({
            "action": "created",
            "comment": {"body": body, "user": {"login": sender}},
            "repository": {"name": "widgets", "owner": {"login": "octo"}},
            "issue": {"number": 42}
        })
    }

    fn github_request(payload: &Value) -> Request<Body> {
        let body = serde_json::to_vec(payload).unwrap();
        Request::builder()
            .method("POST")
            .uri("/webhook/github")
            .header("x-github-event", "issue_comment")
            .header("x-hub-signature-256", sign(&body))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn ci_request(payload: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook/ci")
            .header("authorization", "ci-secret")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(payload).unwrap()))
            .unwrap()
    }

    async fn call(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = crate::app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[test]
    fn test_verify_github_signature() {
        let body = b"{\"zen\":\"Design for failure.\"}";
        assert!(verify_github_signature(SECRET, body, &sign(body)));
        assert!(!verify_github_signature("other", body, &sign(body)));
        assert!(!verify_github_signature(SECRET, body, "sha1=abcdef"));
        assert!(!verify_github_signature(SECRET, body, "sha256=not-hex"));
    }

    #[test]
    fn test_response_tokens() {
        use autoland_core::AttemptMode;

        let cases = [
            (
                Reason::Started {
                    pr_number: 1,
                    mode: AttemptMode::Merge,
                },
                "AUTO",
            ),
            (
                Reason::Finished {
                    pr_number: 1,
                    verdict: Verdict::Landed {
                        sha: CommitSha::from("abc"),
                    },
                },
                "MERGE",
            ),
            (
                Reason::Finished {
                    pr_number: 1,
                    verdict: Verdict::Passed,
                },
                "PASS",
            ),
            (Reason::BranchConflict { active_pr: Some(2) }, "AUTO ALREADY EXISTS"),
            (
                Reason::Assigned {
                    assignee: "bob".into(),
                },
                "ASSIGNED",
            ),
            (
                Reason::UnauthorizedSender {
                    login: "mallory".into(),
                },
                "UNKNOWN_REVIEWER",
            ),
            (
                Reason::UnrecognizedCommand {
                    attempted: "dance".into(),
                },
                "WHO",
            ),
            (Reason::MalformedCommand, "ValueError"),
            (Reason::NotACommand, "PASS"),
            (
                Reason::Inconclusive {
                    status: "errored".into(),
                },
                "PASS",
            ),
        ];

        for (reason, token) in cases {
            assert_eq!(response_token(&reason), token, "{:?}", reason);
        }
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let (host, state) = setup();
        let body = serde_json::to_vec(&comment_payload("alice", "@bot r+")).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/webhook/github")
            .header("x-github-event", "issue_comment")
            .header("x-hub-signature-256", "sha256=00")
            .body(Body::from(body))
            .unwrap();

        let (status, _) = call(&state, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_try_then_ci_passed() {
        let (host, state) = setup();

        let (status, body) = call(&state, github_request(&comment_payload("alice", "@bot try"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "AUTO");
        assert!(host.branch(&repo(), "auto").is_some());

        let (_, body) = call(&state, github_request(&comment_payload("alice", "@bot r+"))).await;
        assert_eq!(body["result"], "AUTO ALREADY EXISTS");

        let ci = serde_json::json!({
            "branch": "auto",
            "state": "passed",
            "repository": {"owner_name": "octo", "name": "widgets"}
        });
        let (status, body) = call(&state, ci_request(&ci)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "PASS");
        assert!(host.branch(&repo(), "auto").is_none());
        assert_eq!(host.merges_into(&repo(), "main"), 0);
    }

    #[tokio::test]
    async fn test_r_plus_then_ci_passed_merges() {
        let (host, state) = setup();

        let (_, body) = call(&state, github_request(&comment_payload("alice", "@bot r+"))).await;
        assert_eq!(body["result"], "AUTO");

        let ci = serde_json::json!({
            "branch": "auto",
            "state": "passed",
            "repository": {"owner_name": "octo", "name": "widgets"}
        });
        let (_, body) = call(&state, ci_request(&ci)).await;
        assert_eq!(body["result"], "MERGE");
        assert_eq!(host.merges_into(&repo(), "main"), 1);
    }

    #[tokio::test]
    async fn test_comment_tokens() {
        let (host, state) = setup();

        let cases = [
            ("mallory", "@bot r+", "UNKNOWN_REVIEWER"),
            ("alice", "@bot dance", "WHO"),
            ("alice", "@bot", "ValueError"),
            ("alice", "LGTM", "PASS"),
            ("alice", "@alice r? @bob", "ASSIGNED"),
        ];
        for (sender, text, token) in cases {
            let (status, body) = call(&state, github_request(&comment_payload(sender, text))).await;
            assert_eq!(status, StatusCode::OK, "{}", text);
            assert_eq!(body["result"], token, "{}", text);
        }

        assert!(host.branch(&repo(), "auto").is_none());
        assert_eq!(host.assignees(&repo(), 42), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_field_is_key_error() {
        let (_, state) = setup();
        let mut payload = comment_payload("alice", "@bot r+");
        payload["issue"] = Value::Null;

        let (status, body) = call(&state, github_request(&payload)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], "KeyError");
        assert_eq!(body["detail"], "missing field `issue.number`");
    }

    #[tokio::test]
    async fn test_edited_comments_and_other_events_pass() {
        let (host, state) = setup();

        let mut payload = comment_payload("alice", "@bot r+");
        payload["action"] = "edited".into();
        let (_, body) = call(&state, github_request(&payload)).await;
        assert_eq!(body["result"], "PASS");

        let body_bytes = b"{\"zen\":\"Keep it logically awesome.\"}".to_vec();
        let request = Request::builder()
            .method("POST")
            .uri("/webhook/github")
            .header("x-github-event", "ping")
            .header("x-hub-signature-256", sign(&body_bytes))
            .body(Body::from(body_bytes))
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "PASS");

        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ci_form_payload_and_token() {
        let (_, state) = setup();
        let payload = serde_json::json!({
            "branch": "auto",
            "state": "failed",
            "repository": {"owner_name": "octo", "name": "widgets"}
        })
        .to_string();
        let form: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("payload", &payload)
            .finish();

        let unauthorized = Request::builder()
            .method("POST")
            .uri("/webhook/ci")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form.clone()))
            .unwrap();
        let (status, _) = call(&state, unauthorized).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/webhook/ci")
            .header("authorization", "token ci-secret")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "PASS");
        assert_eq!(body["detail"], "no attempt in flight");
    }

    #[tokio::test]
    async fn test_ci_missing_state_is_key_error() {
        let (_, state) = setup();
        let ci = serde_json::json!({
            "branch": "auto",
            "repository": {"owner_name": "octo", "name": "widgets"}
        });

        let (status, body) = call(&state, ci_request(&ci)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["result"], "KeyError");
    }

    #[tokio::test]
    async fn test_reconcile_and_status_need_admin_token() {
        let (host, state) = setup();
        host.add_branch(&repo(), "auto", "stray01", "Manual experiment");

        let request = Request::builder()
            .method("POST")
            .uri("/reconcile/octo/widgets")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&state, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/reconcile/octo/widgets")
            .header("authorization", "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repository"], "octo/widgets");
        assert_eq!(body["status"]["state"], "idle");

        let request = Request::builder()
            .uri("/status")
            .header("authorization", "Bearer admin")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repositories"][0]["repository"], "octo/widgets");
        assert_eq!(body["testing"], 0);
    }

    #[tokio::test]
    async fn test_health() {
        let (_, state) = setup();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, body) = call(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }
}
