use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, FileExtension, LanguageProfile, RunConfig, SCRATCH_DIR,
};
pub use crate::config::registry::Registry;
use crate::types::ResourceLimits;
use crate::validator::DEFAULT_MAX_SOURCE_BYTES;

pub mod language;
mod loader;
mod registry;

/// Example configuration embedded at compile time.
///
/// It is also the default language catalog.
pub const EXAMPLE_CONFIG: &str = include_str!("../../gavel.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What to do when the live-environment ceiling is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a live environment to be released
    #[default]
    Queue,
    /// Fail immediately with `SystemBusy`
    Reject,
}

/// Config for the gavel engine
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Docker endpoint (uses the local defaults if not specified).
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Identity every sandboxed process runs as (`uid:gid`, never root).
    #[serde(default = "default_sandbox_user")]
    pub sandbox_user: String,

    /// Host-wide ceiling on concurrently live environments.
    #[serde(default)]
    pub max_live_environments: Option<usize>,

    /// Behavior when `max_live_environments` is reached.
    #[serde(default)]
    pub admission: AdmissionPolicy,

    /// Retries for transient failures while creating an environment.
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,

    /// Base delay between acquisition retries in milliseconds (grows linearly).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Ceiling on submitted source size in bytes.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Allow unisolated host execution when the container runtime is down.
    ///
    /// Every verdict produced that way is flagged insecure.
    #[serde(default)]
    pub insecure_fallback: bool,

    /// Default resource limits applied beneath every language profile.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Language profiles keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, LanguageProfile>,
}

impl Config {
    /// Create a new config with the embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            docker_host: None,
            sandbox_user: default_sandbox_user(),
            max_live_environments: None,
            admission: AdmissionPolicy::default(),
            acquire_retries: default_acquire_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_source_bytes: default_max_source_bytes(),
            insecure_fallback: false,
            default_limits: ResourceLimits::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language profile by its exact configured ID
    pub fn get_language(&self, id: &str) -> Result<&LanguageProfile, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::UnsupportedLanguage(id.to_string()))
    }

    /// Build the immutable lookup registry from this configuration
    pub fn registry(&self) -> Result<Registry, ConfigError> {
        Registry::from_config(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_sandbox_user() -> String {
    "65534:65534".to_owned()
}

fn default_acquire_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_max_source_bytes() -> usize {
    DEFAULT_MAX_SOURCE_BYTES
}
