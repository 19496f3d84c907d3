//! Configuration file.
//!
//! Everything has a default, so an empty or missing `excise.toml` is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::Backend;
use crate::hosted::{HostedApiBackend, HostedConfig};
use crate::local::{ConflictPolicy, LocalCliBackend, LocalConfig};
use crate::retry::RetryPolicy;

/// File looked up in the current directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "excise.toml";

/// Which backends to try, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// The forge's REST API
    Hosted,
    /// A private clone, failing on any cherry-pick conflict
    Local,
    /// A private clone, resolving conflicts in favour of the rebuilt chain
    LocalOurs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backends: Vec<BackendKind>,

    /// Ceiling on one rewrite across all backends
    pub deadline_secs: Option<u64>,

    pub hosted: HostedConfig,

    pub local: LocalConfig,

    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: vec![
                BackendKind::Hosted,
                BackendKind::Local,
                BackendKind::LocalOurs,
            ],
            deadline_secs: Some(600),
            hosted: HostedConfig::default(),
            local: LocalConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Parse a config from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Serialize the config back to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists, or
    /// fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// The API token from the configured environment variable, if set.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.hosted.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn hosted_backend(&self, token: Option<String>) -> HostedApiBackend {
        HostedApiBackend::new(self.hosted.clone(), token, self.retry.clone())
    }

    /// Instantiate `kinds` in order.
    pub fn build_backends(
        &self,
        kinds: &[BackendKind],
        token: Option<String>,
    ) -> Vec<Box<dyn Backend>> {
        kinds
            .iter()
            .map(|kind| -> Box<dyn Backend> {
                match kind {
                    BackendKind::Hosted => Box::new(self.hosted_backend(token.clone())),
                    BackendKind::Local => Box::new(LocalCliBackend::new(
                        self.local.clone(),
                        token.clone(),
                        ConflictPolicy::Abort,
                    )),
                    BackendKind::LocalOurs => Box::new(LocalCliBackend::new(
                        self.local.clone(),
                        token.clone(),
                        ConflictPolicy::PreferOurs,
                    )),
                }
            })
            .collect()
    }
}

/// Errors that can occur loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
}
