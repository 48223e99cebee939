//! Container runtime boundary
//!
//! Every submission attempt runs inside its own throwaway container. This
//! module defines the narrow runtime interface the rest of the engine talks
//! to, the Docker implementation of it, and the orchestrator that turns a
//! language profile plus limits into a live, locked-down environment.
//!
//! References for the Docker Engine API:
//! - https://docs.docker.com/reference/api/engine/
//! - https://docs.kernel.org/admin-guide/cgroup-v2.html#memory-interface-files

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use crate::container::cgroup::{CgroupParseError, MemoryStats};
pub use crate::container::docker::DockerRuntime;
pub use crate::container::environment::{Environment, Orchestrator, OrchestratorStats};
pub use crate::container::spec::EnvironmentSpec;

mod cgroup;
mod docker;
mod environment;
#[cfg(test)]
pub(crate) mod fake;
mod spec;

/// Errors reported by the container runtime or the orchestrator
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("image '{0}' is not provisioned")]
    ImageMissing(String),

    #[error("runtime request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("failed to write {name} into environment: {message}")]
    WriteFailed { name: String, message: String },

    #[error("exec output stream failed: {0}")]
    Stream(String),

    #[error("no capacity for another environment")]
    Busy,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ContainerError::Unavailable(_) => true,
            ContainerError::Api { status, .. } => *status >= 500 || *status == 409,
            _ => false,
        }
    }

    /// Whether the error means no environment can be provided at all
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ContainerError::Unavailable(_) | ContainerError::ImageMissing(_)
        )
    }
}

/// A command to execute inside a running environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program and arguments
    pub command: Vec<String>,

    /// Whether the caller will stream data into stdin
    pub stdin: bool,

    /// Working directory inside the environment
    pub working_dir: Option<String>,
}

impl ExecRequest {
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            stdin: false,
            working_dir: None,
        }
    }

    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program name, used for logging
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

/// One chunk of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// State of an exec as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Still running, possibly with its output already closed
    Running,
    /// Finished, with the exit code if the runtime recorded one
    Exited(Option<i64>),
}

/// Handle to a started exec
pub struct ExecSession {
    /// Runtime-assigned exec identifier, used to fetch the exit code
    pub exec_id: String,

    /// Writable stdin, present when requested
    pub stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,

    /// Multiplexed stdout/stderr, ending when the process exits or is killed
    pub output: BoxStream<'static, Result<OutputChunk, ContainerError>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("exec_id", &self.exec_id)
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Operations the engine needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    /// Check that the runtime is reachable
    async fn ping(&self) -> Result<(), ContainerError>;

    /// Check whether an image is present locally
    async fn image_present(&self, image: &str) -> Result<bool, ContainerError>;

    /// Fetch an image so later environments can use it
    async fn pull_image(&self, image: &str) -> Result<(), ContainerError>;

    /// Create and start an environment, returning its identifier
    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, ContainerError>;

    /// Start a command inside a running environment
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecSession, ContainerError>;

    /// Whether an exec is still running, and its exit code once it is not
    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, ContainerError>;

    /// SIGKILL every process in the environment
    async fn kill_all(&self, id: &str) -> Result<(), ContainerError>;

    /// Remove the environment and its scratch storage
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;
}
