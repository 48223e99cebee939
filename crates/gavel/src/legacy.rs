//! Unisolated host execution
//!
//! Used only when the container runtime is unreachable and insecure mode was
//! explicitly enabled. Programs run as the engine's own user in a temporary
//! directory, bounded only by the wall clock deadline and the output ceiling.
//! Each program gets its own process group so a deadline kills everything it
//! spawned. Every verdict derived from this path is flagged insecure.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::LanguageProfile;
use crate::container::OutputChunk;
use crate::supervisor::{CancelToken, Drain, OutputCapture, attach_diagnostics};
use crate::types::{
    ExecutionResult, Phase, ResourceLimits, Submission, TerminationReason, limit_duration,
    signal_from_exit_code,
};

/// Read size for host pipes
const READ_CHUNK: usize = 8 * 1024;

/// Errors from host execution
#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("attempt cancelled")]
    Cancelled,
}

/// Runs submissions directly on the host
#[derive(Debug, Clone, Default)]
pub struct LegacyExecutor {
    /// Parent of the per-attempt working directories (system temp dir if None)
    workdir_root: Option<PathBuf>,
}

impl LegacyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create working directories under `root` instead of the system temp dir
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            workdir_root: Some(root.into()),
        }
    }

    /// Write, compile and run `submission` on the host.
    ///
    /// The working directory is removed when the attempt ends.
    #[instrument(skip_all, fields(language = %profile.name))]
    pub async fn run(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, LegacyError> {
        if cancel.is_cancelled() {
            return Err(LegacyError::Cancelled);
        }
        warn!("executing submission on the host without isolation");

        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("gavel-");
            builder
        };
        let workdir = match &self.workdir_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let dir = workdir.path();
        let dir_arg = dir.to_string_lossy();

        let profile = profile.for_source(&submission.source);
        tokio::fs::write(dir.join(profile.source_name()), submission.source.as_bytes()).await?;
        debug!(dir = %dir.display(), "wrote source file");

        let output_limit = limits.output_bytes();

        if let Some(command) = profile.compile_command_in(&dir_arg) {
            let phase = HostPhase {
                phase: Phase::Compile,
                command,
                dir,
                input: None,
                time_limit: profile.limits.compile_time_limit,
                output_limit,
            };
            let mut result = run_host(phase, cancel).await?;
            if !result.is_success() {
                attach_diagnostics(&mut result);
                return Ok(result);
            }
        }

        let phase = HostPhase {
            phase: Phase::Run,
            command: profile.run_command_in(&dir_arg),
            dir,
            input: Some(submission.stdin.as_bytes()),
            time_limit: limits.wall_time_limit,
            output_limit,
        };
        run_host(phase, cancel).await
    }
}

struct HostPhase<'a> {
    phase: Phase,
    command: Vec<String>,
    dir: &'a Path,
    input: Option<&'a [u8]>,
    time_limit: Option<f64>,
    output_limit: Option<usize>,
}

enum Outcome {
    Exited(ExitStatus),
    Overflow,
    Timeout,
    Cancelled,
}

async fn run_host(request: HostPhase<'_>, cancel: &CancelToken) -> Result<ExecutionResult, LegacyError> {
    if cancel.is_cancelled() {
        return Err(LegacyError::Cancelled);
    }

    let (program, args) = request
        .command
        .split_first()
        .ok_or(LegacyError::EmptyCommand)?;
    let program = resolve_program(program, request.dir);
    debug!(phase = ?request.phase, program = %program.display(), ?args, "starting host process");

    let start = Instant::now();
    let time_limit = request.time_limit;
    let deadline = time_limit.and_then(|seconds| start.checked_add(limit_duration(seconds)));
    let mut child = Command::new(&program)
        .args(args)
        .current_dir(request.dir)
        .stdin(if request.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LegacyError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    // leader of its own group, so the group id is the pid
    let group = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .map(Pid::from_raw);

    let feeder = match (child.stdin.take(), request.input) {
        (Some(mut stdin), Some(input)) => {
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "stdin closed early");
                }
                let _ = stdin.shutdown().await;
            }))
        }
        _ => None,
    };

    let mut output = futures_util::stream::select(
        read_chunks(child.stdout.take(), OutputChunk::Stdout),
        read_chunks(child.stderr.take(), OutputChunk::Stderr),
    );
    let mut capture = OutputCapture::new(request.output_limit);

    let outcome = tokio::select! {
        drained = capture.drain(&mut output) => match drained {
            // both pipes closed, which a program can do long before exiting
            Ok(Drain::Closed) => match wait_exit(&mut child, deadline, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    kill_group(group);
                    let _ = child.wait().await;
                    return Err(e.into());
                }
            },
            Ok(Drain::Overflow) => Outcome::Overflow,
            Err(e) => {
                kill_group(group);
                let _ = child.wait().await;
                return Err(e.into());
            }
        },
        () = expire(deadline) => Outcome::Timeout,
        () = cancel.cancelled() => Outcome::Cancelled,
    };
    if let Some(feeder) = feeder {
        feeder.abort();
    }

    let mut result = ExecutionResult::new(request.phase);

    match outcome {
        Outcome::Exited(status) => {
            result.wall_time = start.elapsed().as_secs_f64();
            // stragglers left behind by the program
            kill_group(group);

            let exit_code = exit_code(status);
            result.exit_code = exit_code;
            result.signal = signal_from_exit_code(exit_code);
            result.termination = TerminationReason::from_exit(exit_code, false);
        }
        Outcome::Overflow => {
            result.wall_time = start.elapsed().as_secs_f64();
            kill_group(group);
            let _ = child.wait().await;
            result.termination = TerminationReason::KilledOutputOverflow;
            result.message = Some(format!(
                "output exceeded {} bytes",
                request.output_limit.unwrap_or_default()
            ));
        }
        Outcome::Timeout => {
            result.wall_time = start.elapsed().as_secs_f64();
            kill_group(group);
            let _ = child.wait().await;
            result.termination = TerminationReason::Timeout;
            result.message = Some(format!(
                "wall time limit of {}s exceeded",
                time_limit.unwrap_or_default()
            ));
        }
        Outcome::Cancelled => {
            kill_group(group);
            let _ = child.wait().await;
            return Err(LegacyError::Cancelled);
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
        "host process complete"
    );

    Ok(result)
}

/// Wait for the child after its pipes closed, still bounded by the deadline
/// and cancellation
async fn wait_exit(
    child: &mut Child,
    deadline: Option<Instant>,
    cancel: &CancelToken,
) -> std::io::Result<Outcome> {
    tokio::select! {
        status = child.wait() => status.map(Outcome::Exited),
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

/// Resolve a relative program path such as `./solution` against `dir`
fn resolve_program(program: &str, dir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        dir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Shell-style exit code, 128 + n for a signal
fn exit_code(status: ExitStatus) -> Option<i64> {
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|signal| 128 + i64::from(signal)))
}

fn kill_group(group: Option<Pid>) {
    let Some(group) = group else {
        return;
    };
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = group.as_raw(), error = %e, "failed to kill process group"),
    }
}

fn read_chunks<R>(
    reader: Option<R>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) -> BoxStream<'static, std::io::Result<OutputChunk>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return futures_util::stream::empty().boxed();
    };
    futures_util::stream::unfold(Some(reader), move |reader| async move {
        let mut reader = reader?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(wrap(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}
