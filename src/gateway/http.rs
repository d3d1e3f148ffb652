use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::HttpConfig;
use super::dispatcher::Dispatcher;
use super::observability::ObservabilitySnapshot;
use super::router::RouteSummary;
use super::task::TaskKind;
use super::upstream::UpstreamFailure;
use super::{AnalysisRequest, GatewayError};

const REQUEST_ID_HEADER: &str = "x-taskroute-request-id";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    dispatcher: Arc<Dispatcher>,
    paths: HttpConfig,
}

impl GatewayHttpState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            paths: HttpConfig::default(),
        }
    }

    pub fn with_paths(mut self, paths: HttpConfig) -> Self {
        self.paths = paths;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Fields stay untyped so a wrong JSON type is reported against its field
/// instead of failing the whole body.
#[derive(Debug, Deserialize)]
struct AnalyzeHttpRequest {
    #[serde(default)]
    task: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
    retryable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    let paths = state.paths.clone();
    Router::new()
        .route(&paths.health_path, get(health))
        .route(&paths.metrics_path, get(metrics))
        .route(&paths.routes_path, get(list_routes))
        .route(&paths.analyze_path, post(analyze))
        .fallback(handle_fallback)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    tracing::info!(endpoint = "health", "request");
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<ObservabilitySnapshot> {
    tracing::info!(endpoint = "metrics", "request");
    Json(state.dispatcher.observability())
}

async fn list_routes(State(state): State<GatewayHttpState>) -> Json<Vec<RouteSummary>> {
    let routes = state.dispatcher.routes().summaries();
    tracing::info!(endpoint = "routes", routes = routes.len(), "request");
    Json(routes)
}

async fn handle_fallback() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "no such endpoint", None, false)
}

async fn analyze(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeHttpRequest>, JsonRejection>,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);
    let started = Instant::now();

    let (task, result, attempts) = match parse_analyze_request(payload) {
        Ok(request) => {
            let (result, attempts) = state.dispatcher.dispatch_with_attempts(&request).await;
            (Some(request.task), result, attempts)
        }
        Err(err) => {
            state.dispatcher.record_rejected();
            (None, Err(err), 0)
        }
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.outcome(),
    };
    tracing::info!(
        request_id = %request_id,
        task = task.map(TaskKind::as_str).unwrap_or("-"),
        outcome,
        latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        attempts,
        "analyze"
    );

    let mut response = match result {
        Ok(analysis) => (StatusCode::OK, Json(analysis)).into_response(),
        Err(err) => gateway_error_response(&err),
    };
    insert_request_id(response.headers_mut(), &request_id);
    response
}

/// Checks the body shape and the task name. Text content is left to the
/// dispatcher so library callers get the same rules.
fn parse_analyze_request(
    payload: Result<Json<AnalyzeHttpRequest>, JsonRejection>,
) -> Result<AnalysisRequest, GatewayError> {
    let Json(body) = payload.map_err(|rejection| {
        GatewayError::validation("body", rejection.body_text())
    })?;
    let task = required_string("task", body.task)?
        .parse::<TaskKind>()
        .map_err(|err| GatewayError::validation("task", err.to_string()))?;
    let text = required_string("text", body.text)?;
    Ok(AnalysisRequest::new(task, text))
}

fn required_string(field: &'static str, value: Option<Value>) -> Result<String, GatewayError> {
    match value {
        None | Some(Value::Null) => Err(GatewayError::validation(field, "is required")),
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(GatewayError::validation(field, "must be a string")),
    }
}

fn gateway_error_response(err: &GatewayError) -> Response {
    let retryable = err.is_retryable();
    let (status, code, message) = match err {
        GatewayError::Validation { field, .. } => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                err.to_string(),
                Some(*field),
                false,
            );
        }
        GatewayError::Routing { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "no route configured for task",
        ),
        GatewayError::Upstream { failure, .. } => match failure {
            UpstreamFailure::Auth { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "upstream_auth_failed",
                "inference provider rejected the gateway credential",
            ),
            UpstreamFailure::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                "inference provider did not respond in time",
            ),
            UpstreamFailure::Transport(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream_unavailable",
                "inference provider is unreachable",
            ),
            UpstreamFailure::Status { status, .. } if *status >= 500 || *status == 429 => (
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream_unavailable",
                "inference provider is unavailable",
            ),
            UpstreamFailure::Status { .. } => (
                StatusCode::BAD_GATEWAY,
                "upstream_rejected",
                "inference provider rejected the request",
            ),
            UpstreamFailure::InvalidResponse(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_invalid_response",
                "inference provider returned an unreadable response",
            ),
        },
    };
    error_response(status, code, message, None, retryable)
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    field: Option<&'static str>,
    retryable: bool,
) -> Response {
    let mut response = (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
                field,
                retryable,
            },
        }),
    )
        .into_response();
    if retryable {
        response
            .headers_mut()
            .insert("retry-after", HeaderValue::from_static("1"));
    }
    response
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("taskroute-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert(REQUEST_ID_HEADER, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }

    #[test]
    fn upstream_failures_map_to_statuses() {
        let cases = [
            (UpstreamFailure::Auth { status: 401 }, 500, false),
            (UpstreamFailure::Timeout, 504, true),
            (UpstreamFailure::Transport("refused".to_string()), 503, true),
            (
                UpstreamFailure::Status {
                    status: 502,
                    body: String::new(),
                },
                503,
                true,
            ),
            (
                UpstreamFailure::Status {
                    status: 429,
                    body: String::new(),
                },
                503,
                true,
            ),
            (
                UpstreamFailure::Status {
                    status: 404,
                    body: String::new(),
                },
                502,
                false,
            ),
            (UpstreamFailure::InvalidResponse("eof".to_string()), 502, false),
        ];
        for (failure, status, retryable) in cases {
            let response = gateway_error_response(&GatewayError::Upstream {
                failure: failure.clone(),
                attempts: 1,
            });
            assert_eq!(response.status().as_u16(), status, "{failure:?}");
            assert_eq!(
                response.headers().contains_key("retry-after"),
                retryable,
                "{failure:?}"
            );
        }
    }

    #[test]
    fn unknown_task_is_a_task_validation_error() {
        let payload = Ok(Json(AnalyzeHttpRequest {
            task: Some(Value::from("translate")),
            text: Some(Value::from("hello")),
        }));
        let err = parse_analyze_request(payload).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { field: "task", .. }));
    }

    #[test]
    fn wrongly_typed_fields_are_reported_by_name() {
        let payload = Ok(Json(AnalyzeHttpRequest {
            task: Some(Value::from(5)),
            text: Some(Value::from("hi")),
        }));
        let err = parse_analyze_request(payload).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { field: "task", .. }));

        let payload = Ok(Json(AnalyzeHttpRequest {
            task: Some(Value::from("sentiment")),
            text: Some(serde_json::json!(["hi"])),
        }));
        let err = parse_analyze_request(payload).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { field: "text", .. }));
    }

    #[test]
    fn missing_text_names_the_field() {
        let payload = Ok(Json(AnalyzeHttpRequest {
            task: Some(Value::from("classify")),
            text: None,
        }));
        let err = parse_analyze_request(payload).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { field: "text", .. }));
    }
}
