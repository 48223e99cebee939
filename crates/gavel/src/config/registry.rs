//! Immutable lookup table from language identifiers to profiles

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{Config, ConfigError, LanguageProfile};

/// Read-only catalog of language profiles.
///
/// Lookups are case-insensitive and resolve aliases. Profiles carry their
/// limits already layered over the configured defaults. Changing anything
/// means building a new registry.
#[derive(Debug, Clone)]
pub struct Registry {
    profiles: BTreeMap<String, Arc<LanguageProfile>>,
    aliases: HashMap<String, String>,
}

impl Registry {
    /// Build a registry from a loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut profiles = BTreeMap::new();
        let mut aliases = HashMap::new();

        for (id, profile) in &config.languages {
            let key = id.to_lowercase();
            let mut profile = profile.clone();
            profile.limits = config.default_limits.with_overrides(&profile.limits);

            for alias in &profile.aliases {
                let alias = alias.to_lowercase();
                if let Some(previous) = aliases.insert(alias.clone(), key.clone())
                    && previous != key
                {
                    return Err(ConfigError::Invalid(format!(
                        "alias '{alias}' is claimed by both '{previous}' and '{key}'"
                    )));
                }
            }

            if profiles.insert(key.clone(), Arc::new(profile)).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "language '{key}' is defined more than once"
                )));
            }
        }

        if let Some(alias) = aliases.keys().find(|alias| profiles.contains_key(*alias)) {
            return Err(ConfigError::Invalid(format!(
                "alias '{alias}' shadows a language identifier"
            )));
        }

        Ok(Self { profiles, aliases })
    }

    /// Resolve a language identifier or alias
    pub fn lookup(&self, language: &str) -> Result<Arc<LanguageProfile>, ConfigError> {
        let key = language.trim().to_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::UnsupportedLanguage(language.to_owned()))
    }

    /// Canonical identifiers in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Canonical identifiers with their profiles, sorted by identifier
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<LanguageProfile>)> {
        self.profiles.iter().map(|(id, profile)| (id.as_str(), profile))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
