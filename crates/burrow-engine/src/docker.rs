//! Docker Engine implementation of [`ContainerEngine`] via bollard.

use crate::config::{ContainerSpec, ExecSpec};
use crate::engine::{ContainerEngine, ContainerStatus, ContainerSummary, ExecChannel, RawState};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ExecInspectResponse, HostConfig, PortBinding as DockerPortBinding};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

/// Client-side timeout for engine API calls, in seconds.
const API_TIMEOUT_SECS: u64 = 120;

/// Container engine backed by a Docker daemon.
///
/// Holds one long-lived `Docker` handle. Create it once at startup and
/// share it; it is never re-created implicitly.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Connect to an explicit endpoint: `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn connect(host: &str) -> Result<Self> {
        let docker = if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else {
            return Err(EngineError::Unavailable(format!(
                "unsupported engine endpoint: {host}"
            )));
        };
        Ok(Self { docker })
    }

    /// Wrap an existing bollard handle.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        let start = std::time::Instant::now();
        self.docker.ping().await?;
        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Docker daemon reachable"
        );
        Ok(())
    }

    /// Pull an image, draining the progress stream.
    async fn pull_image(&self, image: &str) -> Result<()> {
        tracing::info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_for_each(|progress| async move {
                if let Some(status) = progress.status {
                    tracing::trace!(status = %status, "Pull progress");
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let exposed_ports = (!spec.ports.is_empty()).then(|| {
            spec.ports
                .iter()
                .map(|p| (p.container_key(), HashMap::new()))
                .collect::<HashMap<_, _>>()
        });

        let port_bindings = (!spec.ports.is_empty()).then(|| {
            let mut bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
            for p in &spec.ports {
                bindings
                    .entry(p.container_key())
                    .or_insert_with(|| Some(Vec::new()))
                    .get_or_insert_with(Vec::new)
                    .push(DockerPortBinding {
                        host_ip: None,
                        host_port: Some(p.host_port.to_string()),
                    });
            }
            bindings
        });

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(spec.labels.clone()),
            exposed_ports,
            host_config: Some(HostConfig {
                port_bindings,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Treat "304 Not Modified" (already started / already stopped) as success.
fn not_modified_ok(result: std::result::Result<(), bollard::errors::Error>) -> Result<()> {
    match result {
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => other.map_err(EngineError::from),
    }
}

fn is_missing_image(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, message }
            if message.contains("No such image")
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_all(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        tracing::debug!(count = containers.len(), "Listed containers");

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image.unwrap_or_default(),
                state: RawState::parse(&c.state.map(|s| s.to_string()).unwrap_or_default()),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        tracing::debug!(name = %spec.name, image = %spec.image, "Creating container");
        let options = || CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = match self
            .docker
            .create_container(Some(options()), Self::container_config(spec))
            .await
        {
            Ok(r) => r,
            Err(e) if is_missing_image(&e) => {
                self.pull_image(&spec.image).await?;
                self.docker
                    .create_container(Some(options()), Self::container_config(spec))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        for warning in &response.warnings {
            tracing::warn!(container_id = %response.id, warning = %warning, "Engine warning");
        }
        tracing::info!(container_id = %response.id, name = %spec.name, "Container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        tracing::debug!(container_id = %container_id, "Starting container");
        not_modified_ok(
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        tracing::debug!(container_id = %container_id, grace_secs = grace.as_secs(), "Stopping container");
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        not_modified_ok(self.docker.stop_container(container_id, Some(options)).await)
    }

    async fn restart(&self, container_id: &str, grace: Duration) -> Result<()> {
        tracing::debug!(container_id = %container_id, "Restarting container");
        let options = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        self.docker
            .restart_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        tracing::debug!(container_id = %container_id, "Removing container");
        let options = RemoveContainerOptions {
            force: false,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        let state = response.state.unwrap_or_default();
        let raw = state
            .status
            .map(|s| RawState::parse(&s.to_string()))
            .unwrap_or_else(|| RawState::Other(String::new()));
        tracing::trace!(container_id = %container_id, state = %raw, "Inspected container");

        Ok(ContainerStatus {
            id: response.id.unwrap_or_else(|| container_id.to_string()),
            state: raw,
            exit_code: state.exit_code,
            started_at: state.started_at,
        })
    }

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            tty: Some(spec.tty),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, options).await?;
        tracing::debug!(container_id = %container_id, exec_id = %created.id, "Exec created");
        Ok(created.id)
    }

    async fn exec_start(&self, exec_id: &str) -> Result<ExecChannel> {
        let mode = ExecMode::from_inspect(&self.docker.inspect_exec(exec_id).await?);
        let options = StartExecOptions {
            detach: false,
            tty: mode.tty,
            output_capacity: None,
        };
        match self.docker.start_exec(exec_id, Some(options)).await? {
            StartExecResults::Attached { output, input } => {
                tracing::debug!(exec_id = %exec_id, tty = mode.tty, stdin = mode.stdin, "Exec attached");
                let output = output
                    .map(|chunk| chunk.map(|c| c.into_bytes()).map_err(EngineError::from))
                    .boxed();
                Ok(ExecChannel {
                    exec_id: exec_id.to_string(),
                    output,
                    input: mode.stdin.then_some(input),
                })
            }
            StartExecResults::Detached => Err(EngineError::Stream(format!(
                "exec {exec_id} started detached, no output stream"
            ))),
        }
    }

    async fn exec_resize(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        tracing::trace!(exec_id = %exec_id, cols, rows, "Resizing exec TTY");
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    width: cols,
                    height: rows,
                },
            )
            .await?;
        Ok(())
    }
}

/// How an exec was created, read back before starting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExecMode {
    tty: bool,
    stdin: bool,
}

impl ExecMode {
    fn from_inspect(inspect: &ExecInspectResponse) -> Self {
        Self {
            tty: inspect
                .process_config
                .as_ref()
                .and_then(|p| p.tty)
                .unwrap_or(false),
            stdin: inspect.open_stdin.unwrap_or(false),
        }
    }
}
