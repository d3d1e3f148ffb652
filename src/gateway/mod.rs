//! Per-task model routing: route table, upstream client, dispatcher and
//! (behind the `gateway` feature) the HTTP surface.

pub mod config;
pub mod dispatcher;
pub mod observability;
pub mod retry;
pub mod router;
pub mod task;
pub mod upstream;

#[cfg(feature = "gateway")]
pub mod http;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{GatewayConfig, HttpConfig, LimitsConfig, TaskRouteConfig, UpstreamConfig};
pub use dispatcher::Dispatcher;
pub use observability::{Observability, ObservabilitySnapshot};
pub use retry::{FailureKind, RetryConfig, RetryDecision, RetryPolicy};
pub use router::{ModelRoute, RouteSummary, RouteTable};
pub use task::{TaskKind, UnknownTask};
pub use upstream::{
    HttpUpstream, RawUpstreamResponse, Upstream, UpstreamCredential, UpstreamFailure,
};

#[cfg(feature = "gateway")]
pub use http::GatewayHttpState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub task: TaskKind,
    pub text: String,
}

impl AnalysisRequest {
    pub fn new(task: TaskKind, text: impl Into<String>) -> Self {
        Self {
            task,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub task: TaskKind,
    /// Always the routed model; provider-reported mismatches are logged.
    pub model_used: String,
    pub output: String,
    /// Duration of the successful attempt only.
    pub latency_millis: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("no route for task {task}")]
    Routing { task: TaskKind },
    #[error("{failure} (after {attempts} attempt(s))")]
    Upstream {
        failure: UpstreamFailure,
        attempts: u32,
    },
}

impl GatewayError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            GatewayError::Upstream { attempts, .. } => *attempts,
            GatewayError::Validation { .. } | GatewayError::Routing { .. } => 0,
        }
    }

    /// Whether a caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        let GatewayError::Upstream { failure, .. } = self else {
            return false;
        };
        match failure.kind() {
            kind if kind.is_transient() => true,
            FailureKind::Status(status) => status >= 500 || status == 429,
            _ => false,
        }
    }

    /// Short label used as the `outcome` field of request logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::Routing { .. } => "routing_error",
            GatewayError::Upstream { failure, .. } => match failure {
                UpstreamFailure::Auth { .. } => "auth_error",
                UpstreamFailure::Timeout => "timeout",
                UpstreamFailure::Transport(_) => "transport_error",
                UpstreamFailure::Status { .. } => "upstream_error",
                UpstreamFailure::InvalidResponse(_) => "invalid_response",
            },
        }
    }
}
