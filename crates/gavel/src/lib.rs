//! A secure execution engine for online-judge submissions.
//!
//! Gavel accepts untrusted source code, runs it against test input inside a
//! throwaway, locked-down container, and reports a verdict together with the
//! resources the program used.
//!
//! # Features
//!
//! - **Per-attempt isolation**: every attempt gets its own container with no
//!   network, a read-only root, dropped capabilities and hard resource ceilings.
//! - **Multi-language**: compiled and interpreted languages, configured in TOML.
//! - **Static validation**: per-language denylists reject obvious escapes
//!   before anything is allocated.
//! - **Verdicts**: time, memory and output limits are reported distinctly
//!   from crashes, and output is compared whitespace-insensitively at line ends.
//! - **Insecure fallback**: an explicitly enabled host executor for when the
//!   container runtime is down, with every verdict flagged insecure.
//!
//! # Example
//!
//! ```no_run
//! use gavel::{Config, Engine, Submission};
//!
//! # async fn run() -> Result<(), gavel::EngineError> {
//! let engine = Engine::connect(&Config::default()).await?;
//! let verdict = engine
//!     .judge(&Submission::new("python", "print(input())").with_stdin("hi\n").with_expected_output("hi"))
//!     .await?;
//! println!("{}", verdict.kind());
//! # Ok(())
//! # }
//! ```

pub use config::{AdmissionPolicy, Config, ConfigError, EXAMPLE_CONFIG, LanguageProfile, Registry};
pub use container::{ContainerError, ContainerRuntime, DockerRuntime, Orchestrator, OrchestratorStats};
pub use engine::{Engine, EngineError, Executor, Readiness, SecureExecutor};
pub use legacy::{LegacyError, LegacyExecutor};
pub use supervisor::{CancelToken, Supervisor, SupervisorError};
pub use types::{
    BatchSubmission, ExecutionResult, LimitOverrides, Phase, ResourceLimits, Submission,
    TerminationReason, TestCase, parse_memory_size,
};
pub use validator::{CodeValidator, Rejection};
pub use verdict::{JudgeReport, Verdict, VerdictKind, classify};

pub mod config;
pub mod container;
pub mod engine;
pub mod legacy;
pub mod supervisor;
pub mod types;
pub mod validator;
pub mod verdict;
