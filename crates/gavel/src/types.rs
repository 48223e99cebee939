use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Declarative resource ceilings attached to environment acquisition.
///
/// Every field is optional so that partial tables (profile limits, caller
/// overrides) can be layered with [`with_overrides`](Self::with_overrides).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall clock limit for the run phase in seconds
    #[serde(default)]
    pub wall_time_limit: Option<f64>,

    /// Wall clock limit for the compile phase in seconds
    #[serde(default)]
    pub compile_time_limit: Option<f64>,

    /// Memory ceiling in kilobytes (accepts "128m"-style strings)
    #[serde(default, deserialize_with = "memory_size::deserialize")]
    pub memory_limit: Option<u64>,

    /// CPU share as a fraction of one core
    #[serde(default)]
    pub cpu_share: Option<f64>,

    /// Maximum number of concurrent processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum open file descriptors
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Maximum size of any single file in kilobytes
    #[serde(default, deserialize_with = "memory_size::deserialize")]
    pub max_file_size: Option<u64>,

    /// Maximum captured output per stream in kilobytes
    #[serde(default, deserialize_with = "memory_size::deserialize")]
    pub max_output: Option<u64>,

    /// Size of the writable scratch area in kilobytes
    #[serde(default, deserialize_with = "memory_size::deserialize")]
    pub scratch_size: Option<u64>,
}

impl ResourceLimits {
    /// 1 kilobyte
    pub const KB: u64 = 1;
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;
    /// 1 gigabyte in kilobytes
    pub const GB: u64 = 1024 * 1024;

    /// Create new resource limits populated with engine defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset, for use as an override layer
    pub fn unset() -> Self {
        Self {
            wall_time_limit: None,
            compile_time_limit: None,
            memory_limit: None,
            cpu_share: None,
            max_processes: None,
            max_open_files: None,
            max_file_size: None,
            max_output: None,
            scratch_size: None,
        }
    }

    /// Set the run-phase wall clock limit in seconds
    pub fn with_wall_time_limit(mut self, seconds: f64) -> Self {
        self.wall_time_limit = Some(seconds);
        self
    }

    /// Set the compile-phase wall clock limit in seconds
    pub fn with_compile_time_limit(mut self, seconds: f64) -> Self {
        self.compile_time_limit = Some(seconds);
        self
    }

    /// Set the memory ceiling in kilobytes
    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.memory_limit = Some(kb);
        self
    }

    /// Set the CPU share (1.0 = one full core)
    pub fn with_cpu_share(mut self, share: f64) -> Self {
        self.cpu_share = Some(share);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the maximum captured output size in kilobytes
    pub fn with_max_output(mut self, kb: u64) -> Self {
        self.max_output = Some(kb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            compile_time_limit: overrides.compile_time_limit.or(self.compile_time_limit),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            cpu_share: overrides.cpu_share.or(self.cpu_share),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            max_file_size: overrides.max_file_size.or(self.max_file_size),
            max_output: overrides.max_output.or(self.max_output),
            scratch_size: overrides.scratch_size.or(self.scratch_size),
        }
    }

    /// Apply caller overrides, clamped so they can never exceed `maxima`.
    ///
    /// A caller may only tighten the run time and memory ceilings. When
    /// `maxima` leaves a field unset the current value acts as the ceiling.
    /// Non-positive or non-finite overrides are ignored.
    pub fn narrowed(&self, overrides: &LimitOverrides, maxima: &ResourceLimits) -> ResourceLimits {
        let mut limits = self.clone();

        if let Some(time) = overrides.time_limit.filter(|t| t.is_finite() && *t > 0.0) {
            let ceiling = maxima.wall_time_limit.or(self.wall_time_limit);
            limits.wall_time_limit = Some(match ceiling {
                Some(max) => time.min(max),
                None => time,
            });
        }

        if let Some(memory) = overrides.memory_limit.filter(|m| *m > 0) {
            let ceiling = maxima.memory_limit.or(self.memory_limit);
            limits.memory_limit = Some(match ceiling {
                Some(max) => memory.min(max),
                None => memory,
            });
        }

        limits
    }

    /// Output ceiling in bytes
    pub fn output_bytes(&self) -> Option<usize> {
        self.max_output
            .map(|kb| usize::try_from(kb.saturating_mul(1024)).unwrap_or(usize::MAX))
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_limit: Some(5.0),
            compile_time_limit: Some(15.0),
            memory_limit: Some(128 * Self::MB),
            cpu_share: Some(0.5),
            max_processes: Some(50),
            max_open_files: Some(64),
            max_file_size: Some(10 * Self::MB),
            max_output: Some(64),
            scratch_size: Some(64 * Self::MB),
        }
    }
}

/// Caller-supplied limit overrides for a single submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    /// Run-phase wall clock limit in seconds
    #[serde(default)]
    pub time_limit: Option<f64>,

    /// Memory ceiling in kilobytes
    #[serde(default, deserialize_with = "memory_size::deserialize")]
    pub memory_limit: Option<u64>,
}

/// A unit of work handed to the engine by the submission pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Declared language identifier (or alias)
    pub language: String,

    /// Source text
    pub source: String,

    /// Test input streamed to the program's stdin
    #[serde(default)]
    pub stdin: String,

    /// Expected output; absent for ad-hoc runs
    #[serde(default)]
    pub expected_output: Option<String>,

    /// Caller overrides, bounded by the profile maxima
    #[serde(flatten)]
    pub limits: LimitOverrides,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: String::new(),
            expected_output: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.limits.time_limit = Some(seconds);
        self
    }

    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.limits.memory_limit = Some(kb);
        self
    }
}

/// One input/expected-output pair of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,

    #[serde(default)]
    pub expected_output: Option<String>,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: Some(expected_output.into()),
        }
    }
}

/// One source judged against several test cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub language: String,

    pub source: String,

    pub test_cases: Vec<TestCase>,

    #[serde(flatten)]
    pub limits: LimitOverrides,
}

impl BatchSubmission {
    /// Submission for the test case at `index`
    pub fn case(&self, index: usize) -> Option<Submission> {
        let case = self.test_cases.get(index)?;
        Some(Submission {
            language: self.language.clone(),
            source: self.source.clone(),
            stdin: case.input.clone(),
            expected_output: case.expected_output.clone(),
            limits: self.limits,
        })
    }
}

/// Phase an execution reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

/// Why an execution stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// Exited on its own with status 0
    Normal,

    /// Wall clock limit reached; every process in the environment was killed
    Timeout,

    /// Killed by the kernel for exceeding the memory ceiling
    KilledMemory,

    /// Killed by the supervisor for exceeding the output ceiling
    KilledOutputOverflow,

    /// Non-zero exit or abnormal signal
    Crashed,
}

impl TerminationReason {
    /// Derive the reason for a process that exited without supervisor intervention
    pub fn from_exit(exit_code: Option<i64>, oom_killed: bool) -> Self {
        if oom_killed {
            return TerminationReason::KilledMemory;
        }
        match exit_code {
            Some(0) => TerminationReason::Normal,
            _ => TerminationReason::Crashed,
        }
    }

    /// Whether the process was stopped by a limit rather than by itself
    #[must_use]
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            TerminationReason::Timeout
                | TerminationReason::KilledMemory
                | TerminationReason::KilledOutputOverflow
        )
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::Normal => "normal",
            TerminationReason::Timeout => "timeout",
            TerminationReason::KilledMemory => "killed-memory",
            TerminationReason::KilledOutputOverflow => "killed-output-overflow",
            TerminationReason::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Raw result of one compile or run phase
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Last phase that executed
    pub phase: Phase,

    /// Why execution stopped
    pub termination: TerminationReason,

    /// Exit code if the process exited on its own
    pub exit_code: Option<i64>,

    /// Signal number if the exit code encodes one (128 + n)
    pub signal: Option<i32>,

    /// Captured standard output, truncated at the output ceiling
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,

    /// Captured standard error, truncated at the output ceiling
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,

    /// Whether either stream was truncated
    pub truncated: bool,

    /// Wall clock time used in seconds
    pub wall_time: f64,

    /// Peak memory in kilobytes, when the runtime reported it
    pub memory: Option<u64>,

    /// Additional detail about the termination
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Empty result for the given phase
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Check if the execution exited normally with status 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.termination == TerminationReason::Normal && self.exit_code == Some(0)
    }

    /// Standard output decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            phase: Phase::Run,
            termination: TerminationReason::Normal,
            exit_code: None,
            signal: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
            wall_time: 0.0,
            memory: None,
            message: None,
        }
    }
}

/// Duration of a time limit given in seconds.
///
/// A value that is not a finite, non-negative number of seconds expires at once.
pub fn limit_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

/// Signal number encoded in a shell-style exit code (128 + n)
pub fn signal_from_exit_code(code: Option<i64>) -> Option<i32> {
    match code {
        Some(c) if (129..=128 + 64).contains(&c) => i32::try_from(c - 128).ok(),
        _ => None,
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Parse a memory size into kilobytes.
///
/// Accepts a plain number of kilobytes or a number with a `k`, `m` or `g`
/// suffix (case-insensitive), e.g. `"128m"`.
pub fn parse_memory_size(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], ResourceLimits::KB),
        Some('m') => (&s[..s.len() - 1], ResourceLimits::MB),
        Some('g') => (&s[..s.len() - 1], ResourceLimits::GB),
        _ => (s.as_str(), ResourceLimits::KB),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size: {input:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size out of range: {input:?}"))
}

mod memory_size {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Kilobytes(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Kilobytes(kb)) => Ok(Some(kb)),
            Some(Raw::Text(text)) => parse_memory_size(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
