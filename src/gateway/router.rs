use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TaskRouteError};

use super::GatewayError;
use super::config::task_defaults;
use super::task::TaskKind;

pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;

/// Everything needed to send one task to the upstream provider.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelRoute {
    pub task: TaskKind,
    pub model: String,
    pub temperature: f64,
    pub base_url: String,
    /// Budget for a single attempt, connect through body read.
    pub timeout: Duration,
    pub max_retries: u32,
    /// System message sent ahead of the user's text.
    pub instruction: String,
}

impl ModelRoute {
    /// A route with the task's default timeout, retry budget and instruction.
    pub fn new(
        task: TaskKind,
        model: impl Into<String>,
        temperature: f64,
        base_url: impl Into<String>,
    ) -> Self {
        let defaults = task_defaults(task);
        Self {
            task,
            model: model.into(),
            temperature,
            base_url: base_url.into(),
            timeout: Duration::from_secs(defaults.timeout_secs),
            max_retries: defaults.max_retries,
            instruction: defaults.instruction.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn summary(&self) -> RouteSummary {
        RouteSummary {
            task: self.task,
            model: self.model.clone(),
            temperature: self.temperature,
        }
    }

    fn validate(&self) -> Result<()> {
        let task = self.task;
        if self.model.trim().is_empty() {
            return Err(TaskRouteError::config(format!(
                "tasks.{task}.model must not be empty"
            )));
        }
        if !self.temperature.is_finite()
            || !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature)
        {
            return Err(TaskRouteError::config(format!(
                "tasks.{task}.temperature must be within [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}], got {}",
                self.temperature
            )));
        }
        let url = url::Url::parse(self.base_url.trim()).map_err(|err| {
            TaskRouteError::config(format!("tasks.{task}.base_url is not a valid url: {err}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TaskRouteError::config(format!(
                "tasks.{task}.base_url must use http or https, got {}",
                url.scheme()
            )));
        }
        if self.timeout.is_zero() {
            return Err(TaskRouteError::config(format!(
                "tasks.{task}.timeout_secs must be > 0"
            )));
        }
        Ok(())
    }
}

/// The public projection of a route. No endpoint, no credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub task: TaskKind,
    pub model: String,
    pub temperature: f64,
}

/// Immutable task → route mapping, total over [`TaskKind`].
#[derive(Clone, Debug)]
pub struct RouteTable {
    routes: BTreeMap<TaskKind, ModelRoute>,
}

impl RouteTable {
    pub fn from_routes(routes: impl IntoIterator<Item = ModelRoute>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for route in routes {
            route.validate()?;
            let task = route.task;
            if out.insert(task, route).is_some() {
                return Err(TaskRouteError::config(format!(
                    "duplicate route for task {task}"
                )));
            }
        }
        if let Some(missing) = TaskKind::ALL.iter().find(|task| !out.contains_key(*task)) {
            return Err(TaskRouteError::config(format!(
                "no route configured for task {missing}"
            )));
        }
        Ok(Self { routes: out })
    }

    /// Never fails for a table built by [`RouteTable::from_routes`]; a miss is
    /// an internal invariant violation.
    pub fn resolve(&self, task: TaskKind) -> std::result::Result<&ModelRoute, GatewayError> {
        self.routes
            .get(&task)
            .ok_or(GatewayError::Routing { task })
    }

    /// All routes in task identifier order.
    pub fn snapshot(&self) -> Vec<ModelRoute> {
        self.routes.values().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<RouteSummary> {
        self.routes.values().map(ModelRoute::summary).collect()
    }
}
