//! Verdict derivation
//!
//! Turns a raw [`ExecutionResult`] into the outcome reported to the judge.
//! Limit breaches always take precedence over output comparison.

use serde::Serialize;
use tracing::info;

use crate::types::{ExecutionResult, Phase, TerminationReason};

/// Outcome of one judged attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    CompileError,
    /// Ran to completion with no expected output to compare against
    ExecutedSuccessfully,
}

impl VerdictKind {
    /// Whether the attempt counts as passed
    pub fn is_pass(&self) -> bool {
        matches!(
            self,
            VerdictKind::Accepted | VerdictKind::ExecutedSuccessfully
        )
    }
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerdictKind::Accepted => "Accepted",
            VerdictKind::WrongAnswer => "Wrong Answer",
            VerdictKind::TimeLimitExceeded => "Time Limit Exceeded",
            VerdictKind::MemoryLimitExceeded => "Memory Limit Exceeded",
            VerdictKind::OutputLimitExceeded => "Output Limit Exceeded",
            VerdictKind::RuntimeError => "Runtime Error",
            VerdictKind::CompileError => "Compilation Error",
            VerdictKind::ExecutedSuccessfully => "Executed Successfully",
        };
        f.write_str(s)
    }
}

/// Final, immutable record of one attempt
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub kind: VerdictKind,

    /// Result the verdict was derived from
    pub result: ExecutionResult,

    /// Set when the attempt ran without container isolation
    pub insecure: bool,
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        self.kind
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Termination reason of the underlying result
    pub fn termination(&self) -> TerminationReason {
        self.result.termination
    }

    /// Mark the verdict as produced without isolation
    pub(crate) fn into_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }
}

/// Classify `result` against `expected` output.
///
/// Priority: compile failure, timeout, memory, output overflow, crash, then
/// output comparison. Without expected output a clean run is
/// [`VerdictKind::ExecutedSuccessfully`].
pub fn classify(result: ExecutionResult, expected: Option<&str>) -> Verdict {
    let kind = if result.phase == Phase::Compile && !result.is_success() {
        VerdictKind::CompileError
    } else {
        match result.termination {
            TerminationReason::Timeout => VerdictKind::TimeLimitExceeded,
            TerminationReason::KilledMemory => VerdictKind::MemoryLimitExceeded,
            TerminationReason::KilledOutputOverflow => VerdictKind::OutputLimitExceeded,
            TerminationReason::Crashed => VerdictKind::RuntimeError,
            TerminationReason::Normal => match expected {
                None => VerdictKind::ExecutedSuccessfully,
                Some(expected) if outputs_match(&result.stdout, expected) => VerdictKind::Accepted,
                Some(_) => VerdictKind::WrongAnswer,
            },
        }
    };

    info!(verdict = %kind, termination = %result.termination, wall_time = result.wall_time, "classified");

    Verdict {
        kind,
        result,
        insecure: false,
    }
}

/// Normalize output for comparison: trailing whitespace is dropped from
/// every line, and trailing blank lines are dropped at the end.
pub fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = text.split('\n').map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Compare captured output with the expected answer
pub fn outputs_match(actual: &[u8], expected: &str) -> bool {
    normalize(&String::from_utf8_lossy(actual)) == normalize(expected)
}

/// Verdict for one test case in a batch
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseReport {
    /// Position of the test case in the batch
    pub index: usize,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Aggregate of a batch of test cases run against one source
#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    /// First non-passing verdict, or `Accepted`
    pub status: VerdictKind,
    pub passed: usize,
    pub total: usize,
    /// Longest wall time over all executed cases, in seconds
    pub max_time: f64,
    /// Compiler diagnostics when the batch stopped at compilation
    pub compilation_error: Option<String>,
    pub insecure: bool,
    pub results: Vec<TestCaseReport>,
}

impl JudgeReport {
    pub fn new(total: usize) -> Self {
        Self {
            status: VerdictKind::Accepted,
            passed: 0,
            total,
            max_time: 0.0,
            compilation_error: None,
            insecure: false,
            results: Vec::with_capacity(total),
        }
    }

    /// Record the verdict of the next test case
    pub fn push(&mut self, verdict: Verdict) {
        let kind = verdict.kind;
        if kind.is_pass() {
            self.passed += 1;
        } else if self.status == VerdictKind::Accepted {
            self.status = kind;
        }
        if kind == VerdictKind::CompileError {
            self.compilation_error = verdict
                .result
                .message
                .clone()
                .or_else(|| Some(verdict.result.stderr_lossy()));
        }
        self.max_time = self.max_time.max(verdict.result.wall_time);
        self.insecure |= verdict.insecure;
        self.results.push(TestCaseReport {
            index: self.results.len(),
            verdict,
        });
    }

    /// Whether every test case passed
    pub fn is_accepted(&self) -> bool {
        self.status == VerdictKind::Accepted && self.passed == self.total
    }

    /// Percentage of passed test cases
    pub fn score(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.passed as f64 * 100.0 / self.total as f64
    }
}
