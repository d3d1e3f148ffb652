use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of analysis tasks the gateway routes.
///
/// Variants are declared in identifier order so the derived `Ord` sorts
/// them the same way their wire names sort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Classify,
    Intent,
    Sentiment,
    Summarize,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Classify,
        TaskKind::Intent,
        TaskKind::Sentiment,
        TaskKind::Summarize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Classify => "classify",
            TaskKind::Intent => "intent",
            TaskKind::Sentiment => "sentiment",
            TaskKind::Summarize => "summarize",
        }
    }

    /// Upper-case segment used in per-task environment variables,
    /// e.g. `TASKROUTE_SENTIMENT_MODEL`.
    pub fn env_segment(self) -> &'static str {
        match self {
            TaskKind::Classify => "CLASSIFY",
            TaskKind::Intent => "INTENT",
            TaskKind::Sentiment => "SENTIMENT",
            TaskKind::Summarize => "SUMMARIZE",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown task `{0}` (expected one of: classify, intent, sentiment, summarize)")]
pub struct UnknownTask(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTask;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|task| task.as_str() == raw)
            .ok_or_else(|| UnknownTask(raw.to_string()))
    }
}
