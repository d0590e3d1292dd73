use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{BackendError, BackendResult};
use crate::env;

const LIST_PREFIX: &str = "HYBRID";
const FALLBACK_BACKEND: &str = "cpu";

/// Member backends of a hybrid backend, in priority order.
///
/// Accepted textual forms:
/// - a JSON object: `{"backends": ["gpu", "cpu"], "default_backend": "cpu"}`
/// - a comma-separated list, optionally prefixed: `HYBRID:gpu,cpu` or `gpu,cpu`
/// - an empty string, which reads `HYBRID_RS_BACKENDS` and then falls back to `cpu`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HybridConfig {
    pub backends: Vec<String>,
    /// Moved to the front of `backends`, making it the first choice for every node.
    #[serde(default)]
    pub default_backend: Option<String>,
    #[serde(default)]
    pub verify_partitions: bool,
}

impl HybridConfig {
    pub fn new<I, S>(backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            default_backend: None,
            verify_partitions: false,
        }
    }

    pub fn with_default_backend(mut self, name: impl Into<String>) -> Self {
        self.default_backend = Some(name.into());
        self
    }

    pub fn parse(text: &str) -> BackendResult<Self> {
        let trimmed = text.trim();
        let config = if trimmed.starts_with('{') {
            serde_json::from_str::<HybridConfig>(trimmed)
                .map_err(|err| BackendError::config(format!("invalid JSON configuration: {err}")))?
        } else {
            let list = if trimmed == LIST_PREFIX {
                ""
            } else {
                trimmed
                    .strip_prefix(LIST_PREFIX)
                    .and_then(|rest| rest.strip_prefix(':'))
                    .unwrap_or(trimmed)
                    .trim()
            };
            if list.is_empty() {
                Self::parse_list(env::configured_backends().unwrap_or(FALLBACK_BACKEND))?
            } else {
                Self::parse_list(list)?
            }
        };
        config.normalized()
    }

    fn parse_list(list: &str) -> BackendResult<Self> {
        let names = list
            .split(',')
            .map(str::trim)
            .map(|name| {
                if name.is_empty() {
                    Err(BackendError::config(format!(
                        "empty backend name in `{list}`"
                    )))
                } else {
                    Ok(name.to_string())
                }
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self::new(names))
    }

    /// Checks the backend list and applies `default_backend`.
    pub fn normalized(mut self) -> BackendResult<Self> {
        if self.backends.is_empty() {
            return Err(BackendError::config("no backends configured"));
        }
        for (index, name) in self.backends.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(BackendError::config("backend names must not be empty"));
            }
            if self.backends[..index].contains(name) {
                return Err(BackendError::config(format!(
                    "backend `{name}` is listed twice"
                )));
            }
        }
        if let Some(default) = &self.default_backend {
            let position = self
                .backends
                .iter()
                .position(|name| name == default)
                .ok_or_else(|| {
                    BackendError::config(format!(
                        "default backend `{default}` is not among {:?}",
                        self.backends
                    ))
                })?;
            let name = self.backends.remove(position);
            self.backends.insert(0, name);
        }
        Ok(self)
    }
}

impl FromStr for HybridConfig {
    type Err = BackendError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        HybridConfig::parse(text)
    }
}
