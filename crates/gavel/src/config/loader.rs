//! Configuration file loading for gavel
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError};
use crate::types::ResourceLimits;

/// Prefix for environment variable overrides (e.g. `GAVEL_INSECURE_FALLBACK`)
const ENV_PREFIX: &str = "GAVEL";

impl Config {
    /// Load configuration from a file, then apply `GAVEL_*` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let user = self.sandbox_user.trim();
        let uid = user.split(':').next().unwrap_or_default();
        if user.is_empty() || uid == "0" || uid == "root" {
            return Err(ConfigError::Invalid(format!(
                "sandbox_user must be a non-root identity, got {user:?}"
            )));
        }

        if self.max_live_environments == Some(0) {
            return Err(ConfigError::Invalid(
                "max_live_environments must be at least 1".to_owned(),
            ));
        }

        if self.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_source_bytes must be positive".to_owned(),
            ));
        }

        // inherited by every profile
        check_limits(&self.default_limits, "default_limits")?;

        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.image.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty image"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile
                && compile.command.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty compile command"
                )));
            }
            if let Some(name) = lang.source_name.as_deref()
                && (name.is_empty() || name.contains('/') || name.contains(".."))
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has invalid source name {name:?}"
                )));
            }
            for limits in [&lang.limits, &lang.max_limits] {
                check_limits(limits, &format!("language '{id}'"))?;
            }
        }

        Ok(())
    }
}

/// Reject time limits and cpu shares that are not finite and positive
fn check_limits(limits: &ResourceLimits, owner: &str) -> Result<(), ConfigError> {
    let times = [limits.wall_time_limit, limits.compile_time_limit];
    if times.iter().flatten().any(|t| !t.is_finite() || *t <= 0.0) {
        return Err(ConfigError::Invalid(format!(
            "{owner} has a non-positive time limit"
        )));
    }
    if limits.cpu_share.is_some_and(|c| !c.is_finite() || c <= 0.0) {
        return Err(ConfigError::Invalid(format!(
            "{owner} has a non-positive cpu share"
        )));
    }
    Ok(())
}
