//! Memory accounting read from inside an environment
//!
//! With cgroup v2 every container sees its own cgroup at `/sys/fs/cgroup`.
//! `memory.events` counts OOM kills and `memory.peak` holds the high-water
//! mark. Both are read with a single probe exec whose output is a list of
//! `key value` lines.

use std::collections::HashMap;

use thiserror::Error;

/// Command that prints `memory.events` followed by a `peak <bytes>` line
pub const PROBE_COMMAND: [&str; 3] = [
    "sh",
    "-c",
    "cat /sys/fs/cgroup/memory.events 2>/dev/null; \
     printf 'peak %s\\n' \"$(cat /sys/fs/cgroup/memory.peak 2>/dev/null)\"",
];

/// Error that occurs during strict probe output parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cgroup stats parse error at line {line_number}: {message} (line: {line:?})")]
pub struct CgroupParseError {
    /// Line number (1-indexed) where the error occurred
    pub line_number: usize,
    /// The problematic line content
    pub line: String,
    /// Description of the error
    pub message: String,
}

/// Parsed memory counters for one environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Raw counters keyed by name
    pub entries: HashMap<String, u64>,
}

impl MemoryStats {
    /// Parse probe output, skipping lines without a numeric value
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.trim().split_once(char::is_whitespace)?;
                let value = value.trim().parse().ok()?;
                Some((key.to_owned(), value))
            })
            .collect();
        Self { entries }
    }

    /// Parse probe output, failing on any malformed line.
    ///
    /// Empty lines and a bare `peak` line (no `memory.peak` on this kernel)
    /// are accepted.
    pub fn try_parse(content: &str) -> Result<Self, CgroupParseError> {
        let mut entries = HashMap::new();

        for (line_idx, line) in content.lines().enumerate() {
            let line_number = line_idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed == "peak" {
                continue;
            }

            let Some((key, value)) = trimmed.split_once(char::is_whitespace) else {
                return Err(CgroupParseError {
                    line_number,
                    line: line.to_owned(),
                    message: "missing value".to_owned(),
                });
            };
            let value = value.trim().parse().map_err(|_| CgroupParseError {
                line_number,
                line: line.to_owned(),
                message: "value is not an unsigned integer".to_owned(),
            })?;
            entries.insert(key.to_owned(), value);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }

    /// Number of processes killed by the OOM killer so far
    pub fn oom_kills(&self) -> Option<u64> {
        self.get("oom_kill")
    }

    /// Peak memory usage in bytes
    pub fn peak_bytes(&self) -> Option<u64> {
        self.get("peak")
    }

    /// Peak memory usage in kilobytes
    pub fn peak_kb(&self) -> Option<u64> {
        self.peak_bytes().map(|bytes| bytes.div_ceil(1024))
    }

    /// Whether an OOM kill happened since `before` was taken
    pub fn oom_killed_since(&self, before: Option<&MemoryStats>) -> Option<bool> {
        let now = self.oom_kills()?;
        let then = before.and_then(MemoryStats::oom_kills).unwrap_or(0);
        Some(now > then)
    }
}
