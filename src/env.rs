use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// Variable lookup used while resolving configuration.
///
/// Values from a dotenv file shadow the process environment; blank values
/// count as unset in both sources.
#[derive(Clone, Default)]
pub struct Env {
    dotenv: BTreeMap<String, String>,
    process: bool,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(String::as_str).collect();
        f.debug_struct("Env")
            .field("dotenv_keys", &keys)
            .field("process", &self.process)
            .finish()
    }
}

impl Env {
    /// Reads from the process environment only.
    pub fn process() -> Self {
        Self {
            dotenv: BTreeMap::new(),
            process: true,
        }
    }

    /// Reads only from the given pairs. Handy for tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            dotenv: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            process: false,
        }
    }

    pub fn with_dotenv_file(mut self, path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        self.dotenv.extend(parse_dotenv(&contents));
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key).filter(|value| !value.trim().is_empty()) {
            return Some(value.clone());
        }
        if !self.process {
            return None;
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let value = unquote(value.trim());
            if key.is_empty() || value.trim().is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
