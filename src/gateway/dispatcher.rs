use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::Result;

use super::config::{DEFAULT_MAX_TEXT_BYTES, GatewayConfig};
use super::observability::{Observability, ObservabilitySnapshot};
use super::retry::{FailureKind, RetryDecision, RetryPolicy, random_u64, with_jitter};
use super::router::{ModelRoute, RouteTable};
use super::upstream::{RawUpstreamResponse, Upstream, UpstreamCredential, UpstreamFailure};
use super::{AnalysisRequest, AnalysisResult, GatewayError};

/// Validates a request, resolves its route and drives the upstream call
/// through the retry policy. The only place that decides retry vs surface.
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    upstream: Arc<dyn Upstream>,
    credential: UpstreamCredential,
    policy: RetryPolicy,
    max_text_bytes: usize,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .field("credential", &self.credential)
            .field("policy", &self.policy)
            .field("max_text_bytes", &self.max_text_bytes)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        routes: RouteTable,
        upstream: Arc<dyn Upstream>,
        credential: UpstreamCredential,
    ) -> Self {
        Self {
            routes: Arc::new(routes),
            upstream,
            credential,
            policy: RetryPolicy::default(),
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
            observability: Arc::new(Observability::default()),
        }
    }

    /// Validates the whole config and builds the route table eagerly.
    pub fn from_config(
        config: &GatewayConfig,
        upstream: Arc<dyn Upstream>,
        credential: UpstreamCredential,
    ) -> Result<Self> {
        config.validate()?;
        let routes = config.build_route_table()?;
        Ok(Self::new(routes, upstream, credential)
            .with_retry_policy(RetryPolicy::new(config.retry.clone()))
            .with_max_text_bytes(config.limits.max_text_bytes))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_text_bytes(mut self, max_text_bytes: usize) -> Self {
        self.max_text_bytes = max_text_bytes.max(1);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub fn validate(&self, request: &AnalysisRequest) -> std::result::Result<(), GatewayError> {
        if request.text.len() > self.max_text_bytes {
            return Err(GatewayError::validation(
                "text",
                format!("must be at most {} bytes", self.max_text_bytes),
            ));
        }
        if request.text.trim().is_empty() {
            return Err(GatewayError::validation("text", "must not be empty"));
        }
        Ok(())
    }

    pub async fn dispatch(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisResult, GatewayError> {
        self.dispatch_with_attempts(request).await.0
    }

    /// Like [`Dispatcher::dispatch`], also reporting how many upstream
    /// attempts were started (0 when the request never reached the upstream).
    #[tracing::instrument(name = "dispatch", skip_all, fields(task = %request.task))]
    pub async fn dispatch_with_attempts(
        &self,
        request: &AnalysisRequest,
    ) -> (std::result::Result<AnalysisResult, GatewayError>, u32) {
        self.observability.record_request();
        if let Err(err) = self.validate(request) {
            self.observability.record_client_error();
            return (Err(err), 0);
        }

        let route = match self.routes.resolve(request.task) {
            Ok(route) => route,
            Err(err) => {
                tracing::error!(error = %err, "route table is not total");
                self.observability.record_upstream_failure();
                return (Err(err), 0);
            }
        };

        let deadline = self.policy.deadline(route.timeout, route.max_retries);
        let attempts = AtomicU32::new(0);
        let result = match tokio::time::timeout(
            deadline,
            self.run_attempts(route, request.text.trim(), &attempts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed).max(1);
                tracing::warn!(
                    attempts,
                    deadline_ms = duration_millis(deadline),
                    "dispatch deadline exceeded"
                );
                Err(GatewayError::Upstream {
                    failure: UpstreamFailure::Timeout,
                    attempts,
                })
            }
        };

        match &result {
            Ok(_) => self.observability.record_success(),
            Err(_) => self.observability.record_upstream_failure(),
        }
        let attempts = match &result {
            Ok(_) => attempts.load(Ordering::Relaxed),
            Err(err) => err.attempts(),
        };
        (result, attempts)
    }

    /// Counts a request rejected before it could be dispatched, e.g. an
    /// unknown task name or a malformed body.
    pub fn record_rejected(&self) {
        self.observability.record_request();
        self.observability.record_client_error();
    }

    async fn run_attempts(
        &self,
        route: &ModelRoute,
        text: &str,
        attempts: &AtomicU32,
    ) -> std::result::Result<AnalysisResult, GatewayError> {
        let mut server_errors_retried = 0;
        loop {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            self.observability.record_attempt();

            let started = Instant::now();
            let failure = match self
                .upstream
                .invoke(route, text, &self.credential, route.timeout)
                .await
            {
                Ok(raw) => return Ok(normalize(route, raw, started.elapsed())),
                Err(failure) => failure,
            };

            let kind = failure.kind();
            match self.policy.decide(attempt, kind, route.max_retries, server_errors_retried) {
                RetryDecision::Retry { delay } => {
                    if matches!(kind, FailureKind::Status(status) if status >= 500) {
                        server_errors_retried += 1;
                    }
                    let delay = with_jitter(delay, random_u64());
                    tracing::warn!(
                        attempt,
                        error = %failure,
                        backoff_ms = duration_millis(delay),
                        "upstream attempt failed; retrying"
                    );
                    self.observability.record_retry();
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(attempt, detail = ?failure, "upstream call failed");
                    return Err(GatewayError::Upstream {
                        failure,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

fn normalize(route: &ModelRoute, raw: RawUpstreamResponse, latency: Duration) -> AnalysisResult {
    if let Some(reported) = raw.model.as_deref() {
        if reported != route.model {
            tracing::warn!(
                routed = %route.model,
                reported,
                "upstream reported a different model than the one routed"
            );
        }
    }
    AnalysisResult {
        task: route.task,
        model_used: route.model.clone(),
        output: raw.text.trim().to_string(),
        latency_millis: duration_millis(latency),
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
