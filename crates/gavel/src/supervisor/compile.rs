//! Compilation phase
//!
//! Runs the profile's compile command inside the environment. The compile
//! deadline always comes from the profile, never from the caller.

use tracing::{debug, instrument};

use crate::config::LanguageProfile;
use crate::container::Environment;
use crate::supervisor::execute::{PhaseRequest, run_phase};
use crate::supervisor::{CancelToken, SupervisorError};
use crate::types::{ExecutionResult, Phase};

/// Compile the source already written into `env`.
///
/// Returns `Ok(None)` for interpreted languages.
#[instrument(skip(env, profile, cancel), fields(env = %env.name(), language = %profile.name))]
pub async fn compile(
    env: &Environment,
    profile: &LanguageProfile,
    cancel: &CancelToken,
) -> Result<Option<ExecutionResult>, SupervisorError> {
    let Some(command) = profile.compile_command() else {
        return Ok(None);
    };

    let request = PhaseRequest {
        phase: Phase::Compile,
        command,
        input: None,
        time_limit: profile.limits.compile_time_limit,
        output_limit: env.limits().output_bytes(),
    };
    let mut result = run_phase(env, request, cancel).await?;
    attach_diagnostics(&mut result);

    debug!(
        success = result.is_success(),
        termination = %result.termination,
        "compilation complete"
    );

    Ok(Some(result))
}

/// Copy compiler diagnostics into the result message of a failed compile.
///
/// Compilers report on stderr; stdout is used for the few that don't.
pub(crate) fn attach_diagnostics(result: &mut ExecutionResult) {
    if result.is_success() || result.message.is_some() {
        return;
    }
    let diagnostics = if result.stderr.is_empty() {
        result.stdout_lossy()
    } else {
        result.stderr_lossy()
    };
    let diagnostics = diagnostics.trim();
    if !diagnostics.is_empty() {
        result.message = Some(diagnostics.to_owned());
    }
}
