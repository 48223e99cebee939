//! Supervised execution of one phase inside an environment
//!
//! A phase ends at the first of: process exit, wall clock deadline, output
//! overflow, cancellation. Every outcome other than a natural exit kills all
//! processes in the environment before returning.

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::LanguageProfile;
use crate::container::{ContainerError, Environment, ExecRequest, MemoryStats};
use crate::supervisor::capture::{Drain, OutputCapture};
use crate::supervisor::{CancelToken, SupervisorError};
use crate::types::{ExecutionResult, Phase, TerminationReason, limit_duration, signal_from_exit_code};

/// Exit code of a process killed by SIGKILL
const SIGKILL_EXIT_CODE: i64 = 128 + 9;

/// One phase to run under supervision
#[derive(Debug)]
pub struct PhaseRequest<'a> {
    pub phase: Phase,
    pub command: Vec<String>,
    /// Bytes streamed to stdin; `None` leaves stdin detached
    pub input: Option<&'a [u8]>,
    /// Wall clock limit in seconds
    pub time_limit: Option<f64>,
    /// Output ceiling per stream in bytes
    pub output_limit: Option<usize>,
}

enum Outcome {
    Exited(Option<i64>),
    Overflow,
    Timeout,
    Cancelled,
}

/// Run the program for `profile` with `input` on stdin
#[instrument(skip(env, profile, input, cancel), fields(env = %env.name(), language = %profile.name))]
pub async fn execute(
    env: &Environment,
    profile: &LanguageProfile,
    input: &[u8],
    cancel: &CancelToken,
) -> Result<ExecutionResult, SupervisorError> {
    let limits = env.limits();
    let request = PhaseRequest {
        phase: Phase::Run,
        command: profile.run_command(),
        input: Some(input),
        time_limit: limits.wall_time_limit,
        output_limit: limits.output_bytes(),
    };
    run_phase(env, request, cancel).await
}

/// Run a single phase, enforcing its deadline and output ceiling
pub async fn run_phase(
    env: &Environment,
    request: PhaseRequest<'_>,
    cancel: &CancelToken,
) -> Result<ExecutionResult, SupervisorError> {
    if cancel.is_cancelled() {
        return Err(SupervisorError::Cancelled);
    }

    let before = env.memory_stats().await;

    let mut exec = ExecRequest::new(request.command);
    if request.input.is_some() {
        exec = exec.with_stdin();
    }
    debug!(phase = ?request.phase, command = ?exec.command, "starting phase");

    let start = Instant::now();
    let mut session = env.exec(exec).await?;
    let time_limit = request.time_limit;
    let deadline = time_limit.and_then(|seconds| start.checked_add(limit_duration(seconds)));

    // Fed from its own task so a program that never reads stdin cannot
    // stall output capture.
    let feeder = match (session.stdin.take(), request.input) {
        (Some(mut stdin), Some(input)) => {
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                // a program may exit without reading its input
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "stdin closed early");
                }
                let _ = stdin.shutdown().await;
            }))
        }
        _ => None,
    };

    let mut capture = OutputCapture::new(request.output_limit);

    let outcome = tokio::select! {
        drained = capture.drain(&mut session.output) => match drained {
            // closed output is not an exit, the program may still be running
            Ok(Drain::Closed) => match wait_exit(env, &session.exec_id, deadline, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    abort(feeder);
                    kill_quietly(env).await;
                    return Err(e.into());
                }
            },
            Ok(Drain::Overflow) => Outcome::Overflow,
            Err(e) => {
                abort(feeder);
                kill_quietly(env).await;
                return Err(e.into());
            }
        },
        () = expire(deadline) => Outcome::Timeout,
        () = cancel.cancelled() => Outcome::Cancelled,
    };
    let wall_time = start.elapsed().as_secs_f64();
    abort(feeder);

    let mut result = ExecutionResult::new(request.phase);
    result.wall_time = wall_time;

    match outcome {
        Outcome::Exited(exit_code) => {
            let after = env.memory_stats().await;
            let oom_killed = oom_killed(before.as_ref(), after.as_ref(), exit_code);

            result.exit_code = exit_code;
            result.signal = signal_from_exit_code(exit_code);
            result.termination = TerminationReason::from_exit(exit_code, oom_killed);
            result.memory = phase_peak_kb(before.as_ref(), after.as_ref());
            if oom_killed {
                result.message = Some("memory limit exceeded".to_owned());
            } else if exit_code.is_none() {
                result.message = Some("exit status unavailable".to_owned());
            }
        }
        Outcome::Overflow => {
            result.memory = read_peak_and_kill(env, before.as_ref()).await;
            result.termination = TerminationReason::KilledOutputOverflow;
            result.message = Some(format!(
                "output exceeded {} bytes",
                request.output_limit.unwrap_or_default()
            ));
        }
        Outcome::Timeout => {
            result.memory = read_peak_and_kill(env, before.as_ref()).await;
            result.termination = TerminationReason::Timeout;
            result.message = Some(format!(
                "wall time limit of {}s exceeded",
                time_limit.unwrap_or_default()
            ));
        }
        Outcome::Cancelled => {
            kill_quietly(env).await;
            debug!(phase = ?request.phase, "phase cancelled");
            return Err(SupervisorError::Cancelled);
        }
    }

    let (stdout, stderr, truncated) = capture.into_parts();
    result.stdout = stdout;
    result.stderr = stderr;
    result.truncated = truncated;

    debug!(
        phase = ?result.phase,
        termination = %result.termination,
        exit_code = ?result.exit_code,
        wall_time = result.wall_time,
        memory = ?result.memory,
        "phase complete"
    );

    Ok(result)
}

/// Wait for the exec to finish after its output closed, still bounded by the
/// deadline and cancellation
async fn wait_exit(
    env: &Environment,
    exec_id: &str,
    deadline: Option<Instant>,
    cancel: &CancelToken,
) -> Result<Outcome, ContainerError> {
    tokio::select! {
        code = env.wait_exit(exec_id) => code.map(Outcome::Exited),
        () = expire(deadline) => Ok(Outcome::Timeout),
        () = cancel.cancelled() => Ok(Outcome::Cancelled),
    }
}

/// Resolve at `deadline`, or never without one
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Decide whether a natural exit was an OOM kill.
///
/// Uses the cgroup `oom_kill` counter when both reads succeeded, otherwise
/// treats a SIGKILL the supervisor never sent as the kernel's doing.
fn oom_killed(
    before: Option<&MemoryStats>,
    after: Option<&MemoryStats>,
    exit_code: Option<i64>,
) -> bool {
    match after.and_then(|after| after.oom_killed_since(before)) {
        Some(killed) => killed,
        None => exit_code == Some(SIGKILL_EXIT_CODE),
    }
}

/// Peak usage of a phase in kilobytes.
///
/// The counter covers the whole environment. A phase that never rose above
/// the peak recorded before it started (left by a compiler, say) has no peak
/// of its own to report.
fn phase_peak_kb(before: Option<&MemoryStats>, after: Option<&MemoryStats>) -> Option<u64> {
    let after = after?;
    let peak = after.peak_bytes()?;
    match before.and_then(MemoryStats::peak_bytes) {
        Some(baseline) if peak <= baseline => None,
        _ => after.peak_kb(),
    }
}

/// Read the phase peak while the processes still exist, then kill them
async fn read_peak_and_kill(env: &Environment, before: Option<&MemoryStats>) -> Option<u64> {
    let after = env.memory_stats().await;
    kill_quietly(env).await;
    phase_peak_kb(before, after.as_ref())
}

fn abort(feeder: Option<tokio::task::JoinHandle<()>>) {
    if let Some(feeder) = feeder {
        feeder.abort();
    }
}

async fn kill_quietly(env: &Environment) {
    if let Err(e) = env.kill().await {
        warn!(env = %env.name(), error = %e, "failed to kill environment processes");
    }
}
