use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::ResourceLimits;
use crate::validator::Denylist;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Scratch directory inside every environment
pub const SCRATCH_DIR: &str = "/sandbox";

static PUBLIC_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"public\s+(?:final\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)")
        .expect("public class pattern is valid")
});

/// Execution profile for one language
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageProfile {
    /// Human-readable name for the language (e.g., "C++17 (GCC)")
    pub name: String,

    /// Container image the environment is created from
    pub image: String,

    /// File extension
    pub extension: FileExtension,

    /// Source file name inside the scratch directory (defaults to `main.<ext>`)
    #[serde(default)]
    pub source_name: Option<String>,

    /// Additional identifiers resolving to this profile
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Class name used for the source file when no `public class` is declared
    #[serde(default)]
    pub main_class: Option<String>,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,

    /// Default limits for this language, layered over the global defaults
    #[serde(default = "ResourceLimits::unset")]
    pub limits: ResourceLimits,

    /// Upper bounds for caller overrides (unset fields fall back to `limits`)
    #[serde(default = "ResourceLimits::unset")]
    pub max_limits: ResourceLimits,

    /// Patterns rejected before any environment is allocated
    #[serde(default)]
    pub denylist: Denylist,
}

impl LanguageProfile {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Get the source file name for this language
    pub fn source_name(&self) -> String {
        match &self.source_name {
            Some(name) => name.clone(),
            None => format!("main.{}", self.extension),
        }
    }

    /// Name of the artifact the run command refers to as `{binary}`
    pub fn binary_name(&self) -> String {
        match &self.compile {
            Some(compile) => compile.output_name.clone(),
            None => self.source_name(),
        }
    }

    /// Public class declared by `source`, for profiles with a `main_class`
    pub fn public_class<'a>(&self, source: &'a str) -> Option<&'a str> {
        self.main_class.as_ref()?;
        PUBLIC_CLASS
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|name| name.as_str())
    }

    /// Profile with file names resolved for `source`.
    ///
    /// For profiles with a `main_class`, the source file and the run target
    /// are named after the first public class, so the compiler accepts the
    /// file as written. `main_class` is used when no public class is declared.
    pub fn for_source(&self, source: &str) -> Cow<'_, LanguageProfile> {
        let Some(main_class) = self.main_class.as_deref() else {
            return Cow::Borrowed(self);
        };
        let class = self.public_class(source).unwrap_or(main_class);

        let mut resolved = self.clone();
        resolved.source_name = Some(format!("{class}.{}", self.extension));
        if let Some(compile) = resolved.compile.as_mut() {
            compile.output_name = class.to_owned();
        }
        Cow::Owned(resolved)
    }

    /// Expand the compile command, if the language has one
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile_command_in(SCRATCH_DIR)
    }

    /// Expand the run command
    pub fn run_command(&self) -> Vec<String> {
        self.run_command_in(SCRATCH_DIR)
    }

    /// Expand the compile command with `{dir}` set to `dir`
    pub fn compile_command_in(&self, dir: &str) -> Option<Vec<String>> {
        self.compile.as_ref().map(|compile| {
            Self::expand_command_in(&compile.command, &self.source_name(), &compile.output_name, dir)
        })
    }

    /// Expand the run command with `{dir}` set to `dir`
    pub fn run_command_in(&self, dir: &str) -> Vec<String> {
        Self::expand_command_in(&self.run.command, &self.source_name(), &self.binary_name(), dir)
    }

    /// Expand placeholders in the given command
    ///
    /// Placeholders: `{source}`, `{output}`, `{binary}`, `{dir}`
    fn expand_command_in(command: &[String], source: &str, binary: &str, dir: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
                    .replace("{dir}", dir)
            })
            .collect()
    }
}

/// File extension without dot (e.g., "cpp")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,

    /// Output artifact name (e.g., "main")
    pub output_name: String,
}

/// Configuration for the execution step
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,
}
