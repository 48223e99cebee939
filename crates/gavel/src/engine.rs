//! Submission pipeline
//!
//! The [`Engine`] resolves a language, validates the source, hands the
//! attempt to an [`Executor`] and classifies the outcome. Two executors
//! exist: [`SecureExecutor`], which runs every attempt in its own container,
//! and the host-based [`LegacyExecutor`], whose verdicts are always flagged
//! insecure. The executor is picked once when the engine is built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, ConfigError, LanguageProfile, Registry};
use crate::container::{
    ContainerError, ContainerRuntime, DockerRuntime, Orchestrator, OrchestratorStats,
};
use crate::legacy::{LegacyError, LegacyExecutor};
use crate::supervisor::{CancelToken, Supervisor, SupervisorError};
use crate::types::{BatchSubmission, ExecutionResult, ResourceLimits, Submission};
use crate::validator::{CodeValidator, Rejection};
use crate::verdict::{JudgeReport, Verdict, VerdictKind, classify};

/// Errors that end a submission without a verdict
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("submission rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("no capacity for another submission")]
    SystemBusy,

    #[error("attempt cancelled")]
    Cancelled,

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("configuration error: {0}")]
    Config(#[source] ConfigError),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::UnsupportedLanguage(language) => EngineError::UnsupportedLanguage(language),
            other => EngineError::Config(other),
        }
    }
}

impl From<ContainerError> for EngineError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Busy => EngineError::SystemBusy,
            e if e.is_unavailable() => EngineError::EnvironmentUnavailable(e.to_string()),
            e => EngineError::Infrastructure(e.to_string()),
        }
    }
}

impl From<SupervisorError> for EngineError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Cancelled => EngineError::Cancelled,
            SupervisorError::Container(e) => EngineError::Infrastructure(e.to_string()),
        }
    }
}

impl From<LegacyError> for EngineError {
    fn from(err: LegacyError) -> Self {
        match err {
            LegacyError::Cancelled => EngineError::Cancelled,
            e => EngineError::Infrastructure(e.to_string()),
        }
    }
}

/// Runs one validated attempt and returns its raw result
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    async fn execute(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, EngineError>;

    /// Whether results from this executor lack container isolation
    fn is_insecure(&self) -> bool {
        false
    }
}

/// Executes each attempt in a fresh container
#[derive(Debug)]
pub struct SecureExecutor {
    orchestrator: Arc<Orchestrator>,
    supervisor: Supervisor,
}

impl SecureExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            supervisor: Supervisor::new(),
        }
    }
}

#[async_trait]
impl Executor for SecureExecutor {
    async fn execute(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let env = self.orchestrator.acquire(profile, limits).await?;
        let outcome = self.supervisor.run(&env, profile, submission, cancel).await;

        // the environment goes away whatever happened inside it
        let name = env.name().to_owned();
        if let Err(e) = env.release().await {
            warn!(env = %name, error = %e, "failed to release environment");
        }

        Ok(outcome?)
    }
}

#[async_trait]
impl Executor for LegacyExecutor {
    async fn execute(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, EngineError> {
        Ok(self.run(profile, limits, submission, cancel).await?)
    }

    fn is_insecure(&self) -> bool {
        true
    }
}

/// Result of the readiness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// Whether the container runtime answered
    pub runtime_available: bool,

    /// Image readiness keyed by language identifier
    #[serde(rename = "per_language_image_ready")]
    pub images: BTreeMap<String, bool>,

    /// Whether submissions currently run without isolation
    pub insecure: bool,
}

impl Readiness {
    /// Whether every language can be judged in isolation
    pub fn is_ready(&self) -> bool {
        self.runtime_available && !self.insecure && self.images.values().all(|ready| *ready)
    }
}

/// Validates, executes and classifies submissions
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    validator: CodeValidator,
    orchestrator: Option<Arc<Orchestrator>>,
    executor: Arc<dyn Executor>,
}

impl Engine {
    /// Build an engine that isolates every attempt using `runtime`
    pub fn secure(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self, EngineError> {
        let orchestrator = Arc::new(Orchestrator::from_config(runtime, config));
        Ok(Self {
            registry: Arc::new(config.registry()?),
            validator: CodeValidator::new(config.max_source_bytes),
            executor: Arc::new(SecureExecutor::new(Arc::clone(&orchestrator))),
            orchestrator: Some(orchestrator),
        })
    }

    /// Build an engine that runs attempts on the host without isolation
    pub fn legacy(config: &Config) -> Result<Self, EngineError> {
        warn!("engine built in insecure mode, submissions run without isolation");
        Ok(Self {
            registry: Arc::new(config.registry()?),
            validator: CodeValidator::new(config.max_source_bytes),
            orchestrator: None,
            executor: Arc::new(LegacyExecutor::new()),
        })
    }

    /// Connect to the configured Docker endpoint and build an engine.
    ///
    /// When the daemon does not answer, the host executor is used only if
    /// `insecure_fallback` is set; otherwise the engine stays secure and
    /// submissions fail with [`EngineError::EnvironmentUnavailable`].
    #[instrument(skip(config), fields(docker_host = ?config.docker_host))]
    pub async fn connect(config: &Config) -> Result<Self, EngineError> {
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::from_host(config.docker_host.as_deref())?);

        match runtime.ping().await {
            Ok(()) => {
                debug!("container runtime reachable");
                Self::secure(config, runtime)
            }
            Err(e) if config.insecure_fallback => {
                warn!(error = %e, "container runtime unreachable, falling back to host execution");
                Self::legacy(config)
            }
            Err(e) => {
                warn!(error = %e, "container runtime unreachable");
                Self::secure(config, runtime)
            }
        }
    }

    /// Language catalog used by this engine
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether verdicts from this engine are flagged insecure
    pub fn is_insecure(&self) -> bool {
        self.executor.is_insecure()
    }

    /// Lifecycle counters of the orchestrator (None in insecure mode)
    pub fn stats(&self) -> Option<OrchestratorStats> {
        self.orchestrator.as_ref().map(|o| o.stats())
    }

    /// Judge one submission
    #[instrument(skip_all, fields(language = %submission.language))]
    pub async fn submit(&self, submission: &Submission, cancel: &CancelToken) -> Result<Verdict, EngineError> {
        let profile = self.admit(&submission.language, &submission.source)?;
        self.attempt(&profile, submission, cancel).await
    }

    /// Judge one submission that cannot be cancelled
    pub async fn judge(&self, submission: &Submission) -> Result<Verdict, EngineError> {
        self.submit(submission, &CancelToken::new()).await
    }

    /// Judge one source against every test case of a batch.
    ///
    /// Each case is a separate attempt with its own environment. A compile
    /// error stops the batch, since every later case would fail the same way.
    #[instrument(skip_all, fields(language = %batch.language, cases = batch.test_cases.len()))]
    pub async fn judge_all(&self, batch: &BatchSubmission, cancel: &CancelToken) -> Result<JudgeReport, EngineError> {
        let profile = self.admit(&batch.language, &batch.source)?;
        let mut report = JudgeReport::new(batch.test_cases.len());

        for index in 0..batch.test_cases.len() {
            let Some(submission) = batch.case(index) else {
                break;
            };
            let verdict = self.attempt(&profile, &submission, cancel).await?;
            let kind = verdict.kind();
            report.push(verdict);
            if kind == VerdictKind::CompileError {
                debug!(index, "compilation failed, skipping remaining cases");
                break;
            }
        }

        info!(status = %report.status, passed = report.passed, total = report.total, "batch judged");
        Ok(report)
    }

    /// Probe the runtime and every language's image
    #[instrument(skip(self))]
    pub async fn check_system_requirements(&self) -> Readiness {
        let mut images = BTreeMap::new();
        let runtime_available = match &self.orchestrator {
            Some(orchestrator) => orchestrator.ping().await.is_ok(),
            None => false,
        };

        for (id, profile) in self.registry.iter() {
            let ready = match &self.orchestrator {
                Some(orchestrator) if runtime_available => orchestrator
                    .image_ready(&profile.image)
                    .await
                    .unwrap_or(false),
                _ => false,
            };
            images.insert(id.to_owned(), ready);
        }

        Readiness {
            runtime_available,
            images,
            insecure: self.is_insecure(),
        }
    }

    /// Pull every image the registry refers to, once each.
    ///
    /// This never runs on the submission path.
    #[instrument(skip(self))]
    pub async fn provision_images(&self) -> Result<Vec<String>, EngineError> {
        let orchestrator = self.orchestrator.as_ref().ok_or_else(|| {
            EngineError::EnvironmentUnavailable("no container runtime configured".to_owned())
        })?;

        let images: BTreeSet<&str> = self.registry.iter().map(|(_, p)| p.image.as_str()).collect();
        let mut provisioned = Vec::with_capacity(images.len());
        for image in images {
            orchestrator.provision(image).await?;
            provisioned.push(image.to_owned());
        }
        Ok(provisioned)
    }

    /// Resolve the language and validate the source
    fn admit(&self, language: &str, source: &str) -> Result<Arc<LanguageProfile>, EngineError> {
        let profile = self.registry.lookup(language)?;
        if let Err(rejection) = self.validator.validate(source, &profile) {
            info!(%rejection, "submission rejected");
            return Err(rejection.into());
        }
        Ok(profile)
    }

    async fn attempt(
        &self,
        profile: &LanguageProfile,
        submission: &Submission,
        cancel: &CancelToken,
    ) -> Result<Verdict, EngineError> {
        let limits = profile.limits.narrowed(&submission.limits, &profile.max_limits);
        let result = self.executor.execute(profile, &limits, submission, cancel).await?;

        let verdict = classify(result, submission.expected_output.as_deref());
        if self.executor.is_insecure() {
            Ok(verdict.into_insecure())
        } else {
            Ok(verdict)
        }
    }
}
