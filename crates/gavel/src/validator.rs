//! Static pre-execution checks on submitted source
//!
//! The validator runs before any environment is acquired. It is a cheap
//! first filter only: containment is always enforced by the orchestrator,
//! whatever the validator decides.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::LanguageProfile;

/// Default ceiling on source size in bytes
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;

/// Reason a submission was rejected without being executed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("source is empty")]
    EmptySource,

    #[error("source is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("disallowed construct on line {line}: {reason} ({matched:?})")]
    Denylisted {
        reason: String,
        matched: String,
        line: usize,
    },
}

/// A single compiled denylist entry
#[derive(Debug, Clone)]
pub struct DenyRule {
    pattern: Regex,
    reason: String,
}

impl DenyRule {
    pub fn new(pattern: &str, reason: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            reason: reason.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Ordered set of deny rules for one language
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    rules: Vec<DenyRule>,
}

impl Denylist {
    pub fn new(rules: Vec<DenyRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// Find the earliest match in `source` across all rules.
    ///
    /// Ties on position are broken by rule order, so the outcome depends only
    /// on the source and the rule list.
    pub fn first_match(&self, source: &str) -> Option<(usize, &DenyRule, String)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.pattern.find(source).map(|m| (m, rule)))
            .min_by_key(|(m, _)| m.start())
            .map(|(m, rule)| (m.start(), rule, m.as_str().to_owned()))
    }
}

#[derive(Deserialize)]
struct RawRule {
    pattern: String,
    reason: String,
}

impl<'de> Deserialize<'de> for Denylist {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<RawRule>::deserialize(deserializer)?;
        let rules = raw
            .into_iter()
            .map(|rule| {
                DenyRule::new(&rule.pattern, rule.reason).map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid denylist pattern {:?}: {e}",
                        rule.pattern
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

/// Pattern-based source validator
#[derive(Debug, Clone)]
pub struct CodeValidator {
    max_source_bytes: usize,
}

impl CodeValidator {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Check `source` against the size ceiling and the profile's denylist
    #[instrument(skip(self, source, profile), fields(language = %profile.name, len = source.len()))]
    pub fn validate(&self, source: &str, profile: &LanguageProfile) -> Result<(), Rejection> {
        if source.trim().is_empty() {
            return Err(Rejection::EmptySource);
        }

        if source.len() > self.max_source_bytes {
            return Err(Rejection::SourceTooLarge {
                size: source.len(),
                limit: self.max_source_bytes,
            });
        }

        if let Some((offset, rule, matched)) = profile.denylist.first_match(source) {
            let line = source[..offset].matches('\n').count() + 1;
            debug!(line, pattern = rule.pattern(), "source matched denylist");
            return Err(Rejection::Denylisted {
                reason: rule.reason().to_owned(),
                matched,
                line,
            });
        }

        Ok(())
    }
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOURCE_BYTES)
    }
}
