use thiserror::Error;

/// Startup and configuration failures. Request-time failures live in
/// [`crate::gateway::GatewayError`].
#[derive(Debug, Error)]
pub enum TaskRouteError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TaskRouteError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, TaskRouteError>;
