use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::{Result, TaskRouteError};

use super::retry::RetryConfig;
use super::router::{ModelRoute, RouteTable};
use super::task::TaskKind;
use super::upstream::UpstreamCredential;

pub const DEFAULT_BASE_URL: &str = "https://ollama.com/v1";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_MAX_TEXT_BYTES: usize = 32 * 1024;
pub const DEFAULT_API_KEY_ENVS: &[&str] = &["TASKROUTE_API_KEY", "OLLAMA_API_KEY"];

const ENV_PREFIX: &str = "TASKROUTE";

/// Built-in route values for a task when nothing is configured.
#[derive(Clone, Copy, Debug)]
pub struct TaskDefaults {
    pub model: &'static str,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub instruction: &'static str,
}

pub fn task_defaults(task: TaskKind) -> TaskDefaults {
    match task {
        TaskKind::Classify => TaskDefaults {
            model: "gemma3:4b",
            timeout_secs: 30,
            max_retries: 2,
            instruction: "Classify the user's text into a single concise topic label. \
                Reply with the label only.",
        },
        TaskKind::Sentiment => TaskDefaults {
            model: "ministral-3:3b",
            timeout_secs: 30,
            max_retries: 2,
            instruction: "Determine the sentiment of the user's text. Reply with exactly one \
                word: positive, negative, neutral, or mixed.",
        },
        TaskKind::Summarize => TaskDefaults {
            model: "ministral-3:8b",
            timeout_secs: 30,
            max_retries: 2,
            instruction: "Summarize the user's text in at most three sentences.",
        },
        // Larger model: longer attempt budget, fewer attempts.
        TaskKind::Intent => TaskDefaults {
            model: "gpt-oss:20b",
            timeout_secs: 60,
            max_retries: 1,
            instruction: "Identify the intent behind the user's text. Reply with a short \
                snake_case intent name only.",
        },
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Keyed by task name; unknown names are rejected by [`GatewayConfig::validate`].
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRouteConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Settings shared by every task unless a task overrides them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Name of the environment variable holding the bearer token. The token
    /// itself is never read from a config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            temperature: default_temperature(),
            timeout_secs: None,
            max_retries: None,
            api_key_env: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskRouteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
}

fn default_max_text_bytes() -> usize {
    DEFAULT_MAX_TEXT_BYTES
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_bytes: default_max_text_bytes(),
        }
    }
}

/// Inbound paths. Only the shape of the contract is fixed, not the names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_analyze_path")]
    pub analyze_path: String,
    #[serde(default = "default_routes_path")]
    pub routes_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_analyze_path() -> String {
    "/api/ai/analyze".to_string()
}

fn default_routes_path() -> String {
    "/api/ai/routes".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            analyze_path: default_analyze_path(),
            routes_path: default_routes_path(),
            health_path: default_health_path(),
            metrics_path: default_metrics_path(),
        }
    }
}

impl HttpConfig {
    fn validate(&self) -> Result<()> {
        let paths = [
            ("http.analyze_path", &self.analyze_path),
            ("http.routes_path", &self.routes_path),
            ("http.health_path", &self.health_path),
            ("http.metrics_path", &self.metrics_path),
        ];
        for (name, path) in paths {
            if !is_literal_route_path(path) {
                return Err(TaskRouteError::config(format!(
                    "{name} must be an absolute literal path (no whitespace, empty segments, \
                     `:`/`*` captures or braces), got {path:?}"
                )));
            }
        }
        for (index, (name, path)) in paths.iter().enumerate() {
            if let Some((other, _)) = paths[index + 1..].iter().find(|(_, p)| p == path) {
                return Err(TaskRouteError::config(format!(
                    "{name} and {other} both use {path:?}"
                )));
            }
        }
        Ok(())
    }
}

/// `/` or `/seg/seg` where no segment is empty or uses router capture syntax.
fn is_literal_route_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty()
            && !segment.starts_with([':', '*'])
            && !segment.contains(['{', '}'])
            && !segment.contains(char::is_whitespace)
    })
}

impl GatewayConfig {
    /// Loads a `.toml` file, or JSON for any other extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Ok(toml::from_str(&raw)?)
        } else {
            Ok(serde_json::from_str(&raw)?)
        }
    }

    /// Overlays `TASKROUTE_*` variables on top of file values.
    pub fn apply_env(&mut self, env: &Env) -> Result<()> {
        if let Some(base_url) = env.get(&format!("{ENV_PREFIX}_BASE_URL")) {
            self.upstream.base_url = base_url;
        }
        if let Some(value) = parse_env(env, &format!("{ENV_PREFIX}_TEMPERATURE"))? {
            self.upstream.temperature = value;
        }
        if let Some(value) = parse_env(env, &format!("{ENV_PREFIX}_TIMEOUT_SECS"))? {
            self.upstream.timeout_secs = Some(value);
        }
        if let Some(value) = parse_env(env, &format!("{ENV_PREFIX}_MAX_RETRIES"))? {
            self.upstream.max_retries = Some(value);
        }
        if let Some(value) = parse_env(env, &format!("{ENV_PREFIX}_MAX_TEXT_BYTES"))? {
            self.limits.max_text_bytes = value;
        }

        for task in TaskKind::ALL {
            let prefix = format!("{ENV_PREFIX}_{}", task.env_segment());
            let model = env.get(&format!("{prefix}_MODEL"));
            let base_url = env.get(&format!("{prefix}_BASE_URL"));
            let temperature = parse_env::<f64>(env, &format!("{prefix}_TEMPERATURE"))?;
            let timeout_secs = parse_env::<u64>(env, &format!("{prefix}_TIMEOUT_SECS"))?;
            let max_retries = parse_env::<u32>(env, &format!("{prefix}_MAX_RETRIES"))?;

            if model.is_none()
                && base_url.is_none()
                && temperature.is_none()
                && timeout_secs.is_none()
                && max_retries.is_none()
            {
                continue;
            }

            let entry = self.tasks.entry(task.as_str().to_string()).or_default();
            entry.model = model.or(entry.model.take());
            entry.base_url = base_url.or(entry.base_url.take());
            entry.temperature = temperature.or(entry.temperature);
            entry.timeout_secs = timeout_secs.or(entry.timeout_secs);
            entry.max_retries = max_retries.or(entry.max_retries);
        }
        Ok(())
    }

    /// Checks everything that is not part of a route.
    pub fn validate(&self) -> Result<()> {
        if let Some(unknown) = self
            .tasks
            .keys()
            .find(|name| name.parse::<TaskKind>().is_err())
        {
            return Err(TaskRouteError::config(format!(
                "tasks.{unknown}: not a known task"
            )));
        }
        if self.limits.max_text_bytes == 0 {
            return Err(TaskRouteError::config("limits.max_text_bytes must be > 0"));
        }
        self.retry.validate()?;
        self.http.validate()
    }

    /// Resolves one route per task; fails on the first invalid value.
    pub fn build_route_table(&self) -> Result<RouteTable> {
        let routes = TaskKind::ALL.into_iter().map(|task| self.resolve_route(task));
        RouteTable::from_routes(routes)
    }

    fn resolve_route(&self, task: TaskKind) -> ModelRoute {
        let defaults = task_defaults(task);
        let overrides = self.tasks.get(task.as_str()).cloned().unwrap_or_default();

        let timeout_secs = overrides
            .timeout_secs
            .or(self.upstream.timeout_secs)
            .unwrap_or(defaults.timeout_secs);
        let max_retries = overrides
            .max_retries
            .or(self.upstream.max_retries)
            .unwrap_or(defaults.max_retries);

        ModelRoute {
            task,
            model: overrides
                .model
                .unwrap_or_else(|| defaults.model.to_string()),
            temperature: overrides.temperature.unwrap_or(self.upstream.temperature),
            base_url: overrides
                .base_url
                .unwrap_or_else(|| self.upstream.base_url.clone()),
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            instruction: overrides
                .instruction
                .unwrap_or_else(|| defaults.instruction.to_string()),
        }
    }

    pub fn resolve_credential(&self, env: &Env) -> Result<UpstreamCredential> {
        let keys: Vec<&str> = match self.upstream.api_key_env.as_deref() {
            Some(key) => vec![key],
            None => DEFAULT_API_KEY_ENVS.to_vec(),
        };
        keys.iter()
            .find_map(|key| env.get(key))
            .map(|token| UpstreamCredential::new(token.trim()))
            .ok_or_else(|| {
                TaskRouteError::config(format!(
                    "upstream credential is not set (expected one of: {})",
                    keys.join(", ")
                ))
            })
    }
}

fn parse_env<T: FromStr>(env: &Env, key: &str) -> Result<Option<T>> {
    let Some(raw) = env.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| TaskRouteError::config(format!("invalid value for {key}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn defaults_cover_every_task() {
        let table = GatewayConfig::default().build_route_table().unwrap();
        for task in TaskKind::ALL {
            let route = table.resolve(task).unwrap();
            let defaults = task_defaults(task);
            assert_eq!(route.model, defaults.model);
            assert_eq!(route.temperature, DEFAULT_TEMPERATURE);
            assert_eq!(route.base_url, DEFAULT_BASE_URL);
            assert_eq!(route.timeout, Duration::from_secs(defaults.timeout_secs));
            assert_eq!(route.max_retries, defaults.max_retries);
        }
    }

    #[test]
    fn task_overrides_win_over_global_values() {
        let env = Env::from_pairs([
            ("TASKROUTE_TEMPERATURE", "0.7"),
            ("TASKROUTE_TIMEOUT_SECS", "10"),
            ("TASKROUTE_INTENT_MODEL", "qwen3:32b"),
            ("TASKROUTE_INTENT_TEMPERATURE", "0"),
            ("TASKROUTE_INTENT_TIMEOUT_SECS", "90"),
            ("TASKROUTE_SUMMARIZE_BASE_URL", "http://127.0.0.1:11434/v1"),
        ]);
        let mut config = GatewayConfig::default();
        config.apply_env(&env).unwrap();
        let table = config.build_route_table().unwrap();

        let intent = table.resolve(TaskKind::Intent).unwrap();
        assert_eq!(intent.model, "qwen3:32b");
        assert_eq!(intent.temperature, 0.0);
        assert_eq!(intent.timeout, Duration::from_secs(90));

        let classify = table.resolve(TaskKind::Classify).unwrap();
        assert_eq!(classify.temperature, 0.7);
        assert_eq!(classify.timeout, Duration::from_secs(10));
        assert_eq!(classify.base_url, DEFAULT_BASE_URL);

        let summarize = table.resolve(TaskKind::Summarize).unwrap();
        assert_eq!(summarize.base_url, "http://127.0.0.1:11434/v1");
    }

    #[test]
    fn temperature_out_of_range_fails_fast() {
        for raw in ["2.5", "-0.1", "NaN"] {
            let env = Env::from_pairs([("TASKROUTE_SENTIMENT_TEMPERATURE", raw)]);
            let mut config = GatewayConfig::default();
            config.apply_env(&env).unwrap();
            let err = config.build_route_table().unwrap_err();
            assert!(matches!(err, TaskRouteError::Config(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn unparsable_env_value_names_the_variable() {
        let env = Env::from_pairs([("TASKROUTE_CLASSIFY_MAX_RETRIES", "many")]);
        let err = GatewayConfig::default().apply_env(&env).unwrap_err();
        assert!(err.to_string().contains("TASKROUTE_CLASSIFY_MAX_RETRIES"));
    }

    #[test]
    fn missing_credential_is_a_configuration_error() {
        let err = GatewayConfig::default()
            .resolve_credential(&Env::from_pairs(Vec::<(String, String)>::new()))
            .unwrap_err();
        assert!(matches!(err, TaskRouteError::Config(_)));
    }

    #[test]
    fn credential_env_name_can_be_overridden() {
        let env = Env::from_pairs([("TASKROUTE_API_KEY", "sk-default"), ("MY_KEY", "sk-mine")]);
        let mut config = GatewayConfig::default();
        assert_eq!(config.resolve_credential(&env).unwrap().expose(), "sk-default");
        config.upstream.api_key_env = Some("MY_KEY".to_string());
        assert_eq!(config.resolve_credential(&env).unwrap().expose(), "sk-mine");
    }

    #[test]
    fn loads_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("gateway.toml");
        let mut file = std::fs::File::create(&toml_path).unwrap();
        writeln!(
            file,
            "[upstream]\nbase_url = \"http://localhost:11434/v1\"\n\n[tasks.classify]\nmodel = \"llama3.2:1b\"\n\n[limits]\nmax_text_bytes = 1024"
        )
        .unwrap();
        let config = GatewayConfig::from_path(&toml_path).unwrap();
        assert_eq!(config.upstream.base_url, "http://localhost:11434/v1");
        assert_eq!(config.limits.max_text_bytes, 1024);
        assert_eq!(
            config.tasks["classify"].model.as_deref(),
            Some("llama3.2:1b")
        );

        let json_path = dir.path().join("gateway.json");
        std::fs::write(
            &json_path,
            r#"{"tasks":{"intent":{"max_retries":3}},"http":{"analyze_path":"/analyze"}}"#,
        )
        .unwrap();
        let config = GatewayConfig::from_path(&json_path).unwrap();
        assert_eq!(config.tasks["intent"].max_retries, Some(3));
        assert_eq!(config.http.analyze_path, "/analyze");
        assert_eq!(config.http.routes_path, "/api/ai/routes");
        config.validate().unwrap();
    }

    #[test]
    fn unknown_task_section_is_rejected() {
        let mut config = GatewayConfig::default();
        config
            .tasks
            .insert("translate".to_string(), TaskRouteConfig::default());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tasks.translate"));
    }

    #[test]
    fn colliding_http_paths_are_rejected() {
        let mut config = GatewayConfig::default();
        config.http.metrics_path = config.http.health_path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn router_capture_syntax_in_http_paths_is_rejected() {
        for bad in ["/a/*", "/a/*rest", "/a/:id", "/a/{id}", "/a//b", "/a/", "health", ""] {
            let mut config = GatewayConfig::default();
            config.http.health_path = bad.to_string();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("http.health_path"), "{bad}: {err}");
        }

        let mut config = GatewayConfig::default();
        config.http.health_path = "/".to_string();
        config.http.analyze_path = "/v2/analyze-text".to_string();
        config.validate().unwrap();
    }
}
