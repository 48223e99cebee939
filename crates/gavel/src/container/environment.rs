//! Environment lifecycle management
//!
//! The [`Orchestrator`] turns a language profile and a set of limits into a
//! live, isolated [`Environment`], and accounts for every environment it
//! hands out until it is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AdmissionPolicy, Config, LanguageProfile, SCRATCH_DIR};
use crate::container::cgroup::{MemoryStats, PROBE_COMMAND};
use crate::container::{
    ContainerError, ContainerRuntime, EnvironmentSpec, ExecRequest, ExecSession, ExecStatus,
    OutputChunk,
};
use crate::types::ResourceLimits;

/// Shell script used to stream a file into the scratch directory
pub(crate) const WRITE_SCRIPT: &str = "cat > \"$1\"";

/// First and longest interval between exec status polls
const EXIT_POLL_START: Duration = Duration::from_millis(5);
const EXIT_POLL_MAX: Duration = Duration::from_millis(100);

/// Upper bound on a memory counter read
const MEMORY_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Label recording which language an environment was created for
const LANGUAGE_LABEL: &str = "io.gavel.language";

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    retired: AtomicU64,
    destroyed: AtomicU64,
    cleanup_failures: AtomicU64,
}

impl Counters {
    fn record_removal(&self, result: &Result<(), ContainerError>) {
        match result {
            Ok(()) => self.destroyed.fetch_add(1, Ordering::SeqCst),
            Err(_) => self.cleanup_failures.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// Snapshot of the orchestrator's lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Environments successfully created
    pub created: u64,
    /// Environments successfully removed
    pub destroyed: u64,
    /// Environments handed out and not yet released
    pub live: u64,
    /// Releases whose removal failed
    pub cleanup_failures: u64,
}

/// One isolated, ephemeral execution environment
///
/// # Cleanup
///
/// **Important:** Always call [`release()`](Self::release) when the attempt
/// ends. The `Drop` implementation attempts best-effort removal on a spawned
/// task, which may not complete before process exit.
#[derive(Debug)]
pub struct Environment {
    /// Runtime identifier
    id: String,

    /// Unique name, never reused
    name: String,

    /// Limits the environment was created with
    limits: ResourceLimits,

    runtime: Arc<dyn ContainerRuntime>,

    counters: Arc<Counters>,

    /// Whether release has already run
    released: bool,

    /// Admission permit, returned when the environment goes away
    _permit: Option<OwnedSemaphorePermit>,
}

impl Environment {
    /// Get the runtime identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the unique environment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the limits enforced on this environment
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Get the in-environment path for a file in the scratch directory
    ///
    /// Returns an error if the name contains path traversal attempts.
    pub fn sandbox_path(&self, name: &str) -> Result<String, ContainerError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(ContainerError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(format!("{SCRATCH_DIR}/{name}"))
    }

    /// Write a file into the scratch directory
    #[instrument(skip(self, content), fields(env = %self.name))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), ContainerError> {
        let path = self.sandbox_path(name)?;
        let request = ExecRequest::new(["sh", "-c", WRITE_SCRIPT, "sh", path.as_str()])
            .with_stdin()
            .working_dir(SCRATCH_DIR);
        let mut session = self.runtime.exec(&self.id, request).await?;

        if let Some(mut stdin) = session.stdin.take() {
            stdin.write_all(content).await?;
            stdin.shutdown().await?;
        }

        let mut stderr = Vec::new();
        while let Some(chunk) = session.output.next().await {
            if let OutputChunk::Stderr(bytes) = chunk? {
                stderr.extend_from_slice(&bytes);
            }
        }

        match self.wait_exit(&session.exec_id).await? {
            Some(0) => {
                debug!(path, len = content.len(), "wrote file to environment");
                Ok(())
            }
            code => Err(ContainerError::WriteFailed {
                name: name.to_owned(),
                message: format!(
                    "exit code {code:?}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                ),
            }),
        }
    }

    /// Start a command inside the environment
    pub async fn exec(&self, mut request: ExecRequest) -> Result<ExecSession, ContainerError> {
        if request.working_dir.is_none() {
            request.working_dir = Some(SCRATCH_DIR.to_owned());
        }
        debug!(env = %self.name, program = request.program(), "starting exec");
        self.runtime.exec(&self.id, request).await
    }

    /// Wait for an exec to finish and return its exit code.
    ///
    /// A process can close its output long before it exits, so the runtime
    /// is polled until it reports the exec finished. Callers bound the wait.
    pub async fn wait_exit(&self, exec_id: &str) -> Result<Option<i64>, ContainerError> {
        let mut interval = EXIT_POLL_START;
        loop {
            if let ExecStatus::Exited(code) = self.runtime.exec_status(exec_id).await? {
                return Ok(code);
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(EXIT_POLL_MAX);
        }
    }

    /// Read the environment's memory counters.
    ///
    /// Returns `None` when the counters cannot be read (cgroup v1 host,
    /// environment already stopped, malformed output).
    pub async fn memory_stats(&self) -> Option<MemoryStats> {
        match tokio::time::timeout(MEMORY_READ_TIMEOUT, self.read_memory_stats()).await {
            Ok(stats) => stats,
            Err(_) => {
                debug!(env = %self.name, "memory counters not read in time");
                None
            }
        }
    }

    async fn read_memory_stats(&self) -> Option<MemoryStats> {
        let request = ExecRequest::new(PROBE_COMMAND);
        let mut session = match self.exec(request).await {
            Ok(session) => session,
            Err(e) => {
                debug!(env = %self.name, error = %e, "memory counter read failed to start");
                return None;
            }
        };

        let mut stdout = Vec::new();
        while let Some(chunk) = session.output.next().await {
            match chunk {
                Ok(OutputChunk::Stdout(bytes)) => stdout.extend_from_slice(&bytes),
                Ok(OutputChunk::Stderr(_)) => {}
                Err(e) => {
                    debug!(env = %self.name, error = %e, "memory counter stream failed");
                    return None;
                }
            }
        }

        match MemoryStats::try_parse(&String::from_utf8_lossy(&stdout)) {
            Ok(stats) => (!stats.entries.is_empty()).then_some(stats),
            Err(e) => {
                warn!(env = %self.name, error = %e, "malformed memory counters");
                None
            }
        }
    }

    /// Kill every process in the environment
    #[instrument(skip(self), fields(env = %self.name))]
    pub async fn kill(&self) -> Result<(), ContainerError> {
        self.runtime.kill_all(&self.id).await
    }

    /// Release the environment, removing it and everything inside it
    ///
    /// Removal failures are logged and counted. The environment is never
    /// handed out again either way.
    #[must_use = "release errors should be handled"]
    #[instrument(skip(self), fields(env = %self.name))]
    pub async fn release(mut self) -> Result<(), ContainerError> {
        self.released = true;
        self.counters.retired.fetch_add(1, Ordering::SeqCst);

        let result = self.runtime.remove(&self.id).await;
        self.counters.record_removal(&result);

        match &result {
            Ok(()) => debug!("environment released"),
            Err(e) => warn!(id = %self.id, error = %e, "failed to remove environment"),
        }
        result
    }

    /// Check if the environment is still live (not yet released)
    pub fn is_live(&self) -> bool {
        !self.released
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            env = %self.name,
            id = %self.id,
            "Environment dropped without release! \
             Attempting best-effort removal on a spawned task (may not complete)."
        );
        self.counters.retired.fetch_add(1, Ordering::SeqCst);

        let runtime = Arc::clone(&self.runtime);
        let counters = Arc::clone(&self.counters);
        let id = std::mem::take(&mut self.id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = runtime.remove(&id).await;
                    counters.record_removal(&result);
                    if let Err(e) = result {
                        warn!(%id, error = %e, "best-effort removal failed");
                    }
                });
            }
            Err(_) => {
                counters
                    .cleanup_failures
                    .fetch_add(1, Ordering::SeqCst);
                warn!(%id, "no async runtime available, environment left for auto-removal");
            }
        }
    }
}

/// Creates and accounts for execution environments
#[derive(Debug)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,

    /// Identity every sandboxed process runs as
    sandbox_user: String,

    admission: AdmissionPolicy,

    /// Limits concurrently live environments (None = unbounded)
    slots: Option<Arc<Semaphore>>,

    /// Retries for transient creation failures
    retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    backoff: Duration,

    /// Images already confirmed present
    images: Mutex<HashSet<String>>,

    counters: Arc<Counters>,
}

impl Orchestrator {
    /// Create a new orchestrator with no admission ceiling
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let defaults = Config::empty();
        Self {
            runtime,
            sandbox_user: defaults.sandbox_user,
            admission: defaults.admission,
            slots: None,
            retries: defaults.acquire_retries,
            backoff: Duration::from_millis(defaults.retry_backoff_ms),
            images: Mutex::new(HashSet::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create an orchestrator using the engine settings from `config`
    pub fn from_config(runtime: Arc<dyn ContainerRuntime>, config: &Config) -> Self {
        let orchestrator = Self::new(runtime)
            .sandbox_user(&config.sandbox_user)
            .retries(
                config.acquire_retries,
                Duration::from_millis(config.retry_backoff_ms),
            );
        match config.max_live_environments {
            Some(max) => orchestrator.max_live(max, config.admission),
            None => orchestrator,
        }
    }

    /// Set the identity processes run as
    pub fn sandbox_user(mut self, user: impl Into<String>) -> Self {
        self.sandbox_user = user.into();
        self
    }

    /// Bound the number of concurrently live environments
    pub fn max_live(mut self, max: usize, admission: AdmissionPolicy) -> Self {
        self.slots = Some(Arc::new(Semaphore::new(max)));
        self.admission = admission;
        self
    }

    /// Set the retry budget for transient creation failures
    pub fn retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Get the underlying runtime
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Check that the runtime is reachable
    pub async fn ping(&self) -> Result<(), ContainerError> {
        self.runtime.ping().await
    }

    /// Fail fast unless `image` is present. Positive answers are memoized.
    ///
    /// Checks are serialized so concurrent submissions of one language do not
    /// repeat them.
    pub async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        let mut known = self.images.lock().await;
        if known.contains(image) {
            return Ok(());
        }
        if !self.runtime.image_present(image).await? {
            return Err(ContainerError::ImageMissing(image.to_owned()));
        }
        debug!(image, "image confirmed present");
        known.insert(image.to_owned());
        Ok(())
    }

    /// Check whether `image` is present without consulting the memo
    pub async fn image_ready(&self, image: &str) -> Result<bool, ContainerError> {
        let present = self.runtime.image_present(image).await?;
        let mut known = self.images.lock().await;
        if present {
            known.insert(image.to_owned());
        } else {
            known.remove(image);
        }
        Ok(present)
    }

    /// Pull `image` so environments can be created from it
    #[instrument(skip(self))]
    pub async fn provision(&self, image: &str) -> Result<(), ContainerError> {
        self.runtime.pull_image(image).await?;
        self.images.lock().await.insert(image.to_owned());
        info!(image, "image provisioned");
        Ok(())
    }

    /// Acquire a fresh environment for `profile` with `limits` applied
    #[instrument(skip(self, profile, limits), fields(language = %profile.name, image = %profile.image))]
    pub async fn acquire(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
    ) -> Result<Environment, ContainerError> {
        let permit = match &self.slots {
            None => None,
            Some(slots) => Some(match self.admission {
                AdmissionPolicy::Queue => Arc::clone(slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| ContainerError::Busy)?,
                AdmissionPolicy::Reject => Arc::clone(slots)
                    .try_acquire_owned()
                    .map_err(|_| ContainerError::Busy)?,
            }),
        };

        self.ensure_image(&profile.image).await?;

        let mut attempt = 0;
        let (id, spec) = loop {
            // fresh name per attempt, a failed create may still have claimed the old one
            let spec = EnvironmentSpec::new(format!("gavel-{}", Uuid::new_v4()), &profile.image)
                .user(&self.sandbox_user)
                .limits(limits.clone())
                .label(LANGUAGE_LABEL, &profile.name);

            match self.runtime.create(&spec).await {
                Ok(id) => break (id, spec),
                Err(ContainerError::ImageMissing(image)) => {
                    self.images.lock().await.remove(&image);
                    return Err(ContainerError::ImageMissing(image));
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff * attempt;
                    warn!(attempt, ?delay, error = %e, "transient failure creating environment, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.counters.created.fetch_add(1, Ordering::SeqCst);
        debug!(%id, name = spec.name(), "acquired environment");

        Ok(Environment {
            id,
            name: spec.name().to_owned(),
            limits: spec.resource_limits().clone(),
            runtime: Arc::clone(&self.runtime),
            counters: Arc::clone(&self.counters),
            released: false,
            _permit: permit,
        })
    }

    /// Snapshot of the lifecycle counters
    pub fn stats(&self) -> OrchestratorStats {
        let created = self.counters.created.load(Ordering::SeqCst);
        let retired = self.counters.retired.load(Ordering::SeqCst);
        OrchestratorStats {
            created,
            destroyed: self.counters.destroyed.load(Ordering::SeqCst),
            live: created.saturating_sub(retired),
            cleanup_failures: self.counters.cleanup_failures.load(Ordering::SeqCst),
        }
    }

    /// Number of environments that can still be admitted (None = unbounded)
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available_permits())
    }
}
