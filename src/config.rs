//! Backend configuration loading.
//!
//! The shell hands the core one JSON document describing every back end a
//! screen may mount. Sections that a screen does not use may be omitted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::editor::EditorConfig;
use crate::DEFAULT_HTTP_TIMEOUT;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{section}: invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        section: &'static str,
        endpoint: String,
        reason: String,
    },

    #[error("{section}: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },

    #[error("{0} back end is not configured")]
    Missing(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub graphql: Option<GraphQlConfig>,
    pub rest: Option<RestConfig>,
    pub datastore: DataStoreConfig,
    pub http: HttpConfig,
    pub editor: EditorConfig,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlConfig {
    pub endpoint: String,
    pub api_key: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct RestConfig {
    pub endpoint: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default)]
    pub auth_token: Option<SecretString>,
}

fn default_resource() -> String {
    "todos".to_string()
}

/// Local SQLite store. Without a path the store lives in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: u64::try_from(DEFAULT_HTTP_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BackendConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Parses and validates a config document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(graphql) = &self.graphql {
            check_endpoint("graphql", &graphql.endpoint)?;
            if graphql.api_key.expose_secret().trim().is_empty() {
                return Err(ConfigError::Invalid {
                    section: "graphql",
                    reason: "api_key must not be empty".into(),
                });
            }
        }

        if let Some(rest) = &self.rest {
            check_endpoint("rest", &rest.endpoint)?;
            let resource = rest.resource.trim();
            if resource.is_empty() || resource.contains('/') {
                return Err(ConfigError::Invalid {
                    section: "rest",
                    reason: format!("resource {:?} must be a single path segment", rest.resource),
                });
            }
        }

        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.http.timeout_ms) {
            return Err(ConfigError::Invalid {
                section: "http",
                reason: format!(
                    "timeout_ms must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}, got {}",
                    self.http.timeout_ms
                ),
            });
        }

        Ok(())
    }

    pub fn graphql(&self) -> Result<&GraphQlConfig, ConfigError> {
        self.graphql.as_ref().ok_or(ConfigError::Missing("graphql"))
    }

    pub fn rest(&self) -> Result<&RestConfig, ConfigError> {
        self.rest.as_ref().ok_or(ConfigError::Missing("rest"))
    }
}

fn check_endpoint(section: &'static str, endpoint: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        section,
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(())
}
