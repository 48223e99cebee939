//! Execution supervisor
//!
//! Drives the compile and run phases of one submission attempt inside an
//! acquired environment and captures their raw results. The supervisor never
//! decides verdicts and never releases environments.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument};

pub use crate::supervisor::capture::{Capture, Drain, OutputCapture};
pub use crate::supervisor::compile::compile;
pub(crate) use crate::supervisor::compile::attach_diagnostics;
pub use crate::supervisor::execute::{PhaseRequest, execute, run_phase};

mod capture;
mod compile;
mod execute;

use crate::config::LanguageProfile;
use crate::container::{ContainerError, Environment};
use crate::types::{ExecutionResult, Submission};

/// Errors that stop an attempt without a result
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("attempt cancelled")]
    Cancelled,

    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

/// Cooperative cancellation shared between a caller and an in-flight attempt
///
/// Clones observe the same state. Cancelling is permanent.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Request cancellation of every attempt holding this token
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs submissions inside environments
#[derive(Debug, Clone, Default)]
pub struct Supervisor;

impl Supervisor {
    pub fn new() -> Self {
        Self
    }

    /// Write the source, compile it if the language needs it, then run it
    ///
    /// A failed compilation is returned as the result and the run phase is
    /// skipped. The environment's limits are used as given.
    #[instrument(skip_all, fields(env = %env.name(), language = %profile.name))]
    pub async fn run(
        &self,
        env: &Environment,
        profile: &LanguageProfile,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, SupervisorError> {
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        let profile = profile.for_source(&submission.source);
        env.write_file(&profile.source_name(), submission.source.as_bytes())
            .await?;
        debug!(source = %profile.source_name(), "wrote source file");

        if let Some(result) = compile(env, &profile, cancel).await?
            && !result.is_success()
        {
            return Ok(result);
        }

        execute(env, &profile, submission.stdin.as_bytes(), cancel).await
    }
}
