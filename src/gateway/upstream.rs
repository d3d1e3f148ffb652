use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::http::response_text_truncated;

use super::retry::FailureKind;
use super::router::ModelRoute;

const MAX_UPSTREAM_ERROR_BODY_BYTES: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bearer token for the inference provider.
///
/// Deliberately not `Serialize`; `Debug` never prints the value.
#[derive(Clone)]
pub struct UpstreamCredential(Arc<str>);

impl UpstreamCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UpstreamCredential(<redacted>)")
    }
}

/// What the provider produced, before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawUpstreamResponse {
    /// Model the provider says it ran, when it reports one.
    pub model: Option<String>,
    pub text: String,
}

/// Outcome of a single failed attempt.
///
/// `Display` never includes the provider's body; use `Debug` for logs.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UpstreamFailure {
    #[error("upstream rejected the credential (status {status})")]
    Auth { status: u16 },
    #[error("upstream did not respond in time")]
    Timeout,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("upstream response could not be decoded: {0}")]
    InvalidResponse(String),
}

impl UpstreamFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            UpstreamFailure::Auth { .. } => FailureKind::Auth,
            UpstreamFailure::Timeout => FailureKind::Timeout,
            UpstreamFailure::Transport(_) => FailureKind::Transport,
            UpstreamFailure::Status { status, .. } => FailureKind::Status(*status),
            UpstreamFailure::InvalidResponse(_) => FailureKind::InvalidResponse,
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => UpstreamFailure::Auth { status },
            _ => UpstreamFailure::Status { status, body },
        }
    }
}

/// One network attempt against the provider. Retries belong to the caller.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn invoke(
        &self,
        route: &ModelRoute,
        text: &str,
        credential: &UpstreamCredential,
        timeout: Duration,
    ) -> Result<RawUpstreamResponse, UpstreamFailure>;
}

/// OpenAI-compatible `chat/completions` client.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_http_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim().trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f64,
    stream: bool,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn invoke(
        &self,
        route: &ModelRoute,
        text: &str,
        credential: &UpstreamCredential,
        timeout: Duration,
    ) -> Result<RawUpstreamResponse, UpstreamFailure> {
        let body = ChatCompletionRequest {
            model: &route.model,
            temperature: route.temperature,
            stream: false,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &route.instruction,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        // reqwest's per-request timeout spans connect, headers and body.
        let response = self
            .client
            .post(Self::endpoint(&route.base_url))
            .bearer_auth(credential.expose())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_UPSTREAM_ERROR_BODY_BYTES).await;
            return Err(UpstreamFailure::from_status(status.as_u16(), body));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|err| UpstreamFailure::InvalidResponse(err.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                UpstreamFailure::InvalidResponse("missing choices[0].message.content".to_string())
            })?;

        Ok(RawUpstreamResponse {
            model: parsed.model.filter(|model| !model.trim().is_empty()),
            text,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        return UpstreamFailure::Timeout;
    }
    UpstreamFailure::Transport(err.without_url().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_is_redacted() {
        let credential = UpstreamCredential::new("sk-very-secret");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert_eq!(credential.expose(), "sk-very-secret");
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            HttpUpstream::endpoint("https://ollama.com/v1/"),
            "https://ollama.com/v1/chat/completions"
        );
        assert_eq!(
            HttpUpstream::endpoint("http://127.0.0.1:11434/v1"),
            "http://127.0.0.1:11434/v1/chat/completions"
        );
    }

    #[test]
    fn auth_statuses_are_classified_separately() {
        assert_eq!(
            UpstreamFailure::from_status(401, String::new()),
            UpstreamFailure::Auth { status: 401 }
        );
        assert_eq!(
            UpstreamFailure::from_status(403, String::new()).kind(),
            FailureKind::Auth
        );
        assert_eq!(
            UpstreamFailure::from_status(502, "bad gateway".to_string()).kind(),
            FailureKind::Status(502)
        );
    }

    #[test]
    fn status_display_does_not_leak_body() {
        let failure = UpstreamFailure::Status {
            status: 500,
            body: "internal trace with secrets".to_string(),
        };
        assert!(!failure.to_string().contains("secrets"));
    }
}
