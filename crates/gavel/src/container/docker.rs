//! Docker implementation of [`ContainerRuntime`] using bollard

use async_trait::async_trait;
use bollard::container::{KillContainerOptions, LogOutput, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::stream::StreamExt;
use tracing::{debug, instrument, warn};

use crate::container::{
    ContainerError, ContainerRuntime, EnvironmentSpec, ExecRequest, ExecSession, ExecStatus,
    OutputChunk,
};

/// Seconds before a request to the daemon is abandoned
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Runtime backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect_local() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }

    /// Connect to an explicit endpoint (`unix://`, `tcp://` or `http://`)
    pub fn connect(host: &str) -> Result<Self, ContainerError> {
        let docker = if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(map_error)?;
        Ok(Self { docker })
    }

    /// Connect to `host` if given, otherwise to the local defaults
    pub fn from_host(host: Option<&str>) -> Result<Self, ContainerError> {
        match host {
            Some(host) => Self::connect(host),
            None => Self::connect_local(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), ContainerError> {
        self.docker.ping().await.map_err(map_error)?;
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, ContainerError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(map_error)?;
            if let Some(status) = progress.status {
                debug!(%status, "pull progress");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = spec.name(), image = spec.image()))]
    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, ContainerError> {
        let created = self
            .docker
            .create_container(Some(spec.create_options()), spec.build())
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => ContainerError::ImageMissing(spec.image().to_owned()),
                e => map_error(e),
            })?;

        for warning in &created.warnings {
            warn!(%warning, "runtime warning on create");
        }

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            // never leave a created-but-unstarted container behind
            if let Err(remove_err) = self.remove(&created.id).await {
                warn!(id = %created.id, error = %remove_err, "failed to remove unstarted container");
            }
            return Err(map_error(e));
        }

        debug!(id = %created.id, "environment started");
        Ok(created.id)
    }

    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecSession, ContainerError> {
        let options = CreateExecOptions {
            cmd: Some(request.command),
            attach_stdin: Some(request.stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            working_dir: request.working_dir,
            ..Default::default()
        };

        let exec_id = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(map_error)?
            .id;

        match self.docker.start_exec(&exec_id, None).await.map_err(map_error)? {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                                Some(Ok(OutputChunk::Stdout(message.to_vec())))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(OutputChunk::Stderr(message.to_vec())))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(ContainerError::Stream(e.to_string()))),
                        }
                    })
                    .boxed();

                Ok(ExecSession {
                    exec_id,
                    stdin: request.stdin.then_some(input),
                    output,
                })
            }
            StartExecResults::Detached => Err(ContainerError::Stream(
                "exec started detached, no output attached".to_owned(),
            )),
        }
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, ContainerError> {
        let inspect = self.docker.inspect_exec(exec_id).await.map_err(map_error)?;
        if inspect.running == Some(true) {
            Ok(ExecStatus::Running)
        } else {
            Ok(ExecStatus::Exited(inspect.exit_code))
        }
    }

    #[instrument(skip(self))]
    async fn kill_all(&self, id: &str) -> Result<(), ContainerError> {
        let options = Some(KillContainerOptions { signal: "SIGKILL" });
        match self.docker.kill_container(id, options).await {
            Ok(()) => Ok(()),
            // already stopped or gone
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            // gone already, or auto-removal is in progress
            Err(DockerError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }
}

/// Map a bollard error onto the runtime taxonomy
fn map_error(error: DockerError) -> ContainerError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ContainerError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => ContainerError::Api {
            status: status_code,
            message,
        },
        DockerError::IOError { err } => ContainerError::Unavailable(err.to_string()),
        e @ (DockerError::HyperResponseError { .. } | DockerError::RequestTimeoutError) => {
            ContainerError::Unavailable(e.to_string())
        }
        e => ContainerError::Api {
            status: 0,
            message: e.to_string(),
        },
    }
}
