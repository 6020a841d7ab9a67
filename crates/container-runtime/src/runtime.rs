//! The `ContainerRuntime` trait and its `bollard`-backed implementation
//! (spec.md §4.1), grounded on nanocl's job-instance lifecycle and
//! dockertest's create/start/destroy wrapping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{HostConfig, Resources};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use scan_core::{CoreError, CoreResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::target::validate_target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// No network access beyond what the scanner needs to reach `target`.
    Isolated,
    Bridge,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_nanos: i64,
    pub memory_bytes: i64,
    pub pids: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_nanos: 1_000_000_000,
            memory_bytes: 512 * 1024 * 1024,
            pids: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub container_name: String,
    pub target: String,
    pub command: Vec<String>,
    pub timeout: Duration,
    pub network_mode: NetworkMode,
    pub resource_limits: ResourceLimits,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(image: impl Into<String>, container_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            container_name: container_name.into(),
            target: target.into(),
            command: Vec::new(),
            timeout: Duration::from_secs(30 * 60),
            network_mode: NetworkMode::Isolated,
            resource_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_name: String,
    pub runtime_id: String,
    pub target: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogChunk {
    pub source: LogSource,
    /// Byte offset of the start of `data` within the combined stream, used
    /// by C2/C3 as the high-water-mark for resumable streaming.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Encapsulates every interaction with the container runtime for a single
/// scanner invocation (spec.md §4.1).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> CoreResult<ContainerHandle>;

    /// Stream combined stdout/stderr starting at `since_offset` bytes into
    /// the combined stream. Returns a receiver of [`LogChunk`]s and a token
    /// the caller can cancel to stop the stream early.
    async fn stream_logs(
        &self,
        handle: &ContainerHandle,
        since_offset: u64,
    ) -> CoreResult<(mpsc::Receiver<LogChunk>, CancellationToken)>;

    async fn wait(&self, handle: &ContainerHandle, deadline: Duration) -> CoreResult<i64>;

    /// Idempotent; always safe to call, including on an already-removed
    /// container.
    async fn destroy(&self, handle: &ContainerHandle) -> CoreResult<()>;
}

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connect to the Docker Engine API at `endpoint` (e.g.
    /// `unix:///var/run/docker.sock`).
    ///
    /// # Errors
    /// Returns [`CoreError::RuntimeUnavailable`] if the socket can't be
    /// reached.
    pub fn connect(endpoint: &str) -> CoreResult<Self> {
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(endpoint, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| CoreError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    #[must_use]
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn launch(&self, spec: LaunchSpec) -> CoreResult<ContainerHandle> {
        validate_target(&spec.target)?;

        let mut labels = HashMap::new();
        labels.insert("io.scanforge.scan".to_string(), spec.container_name.clone());

        let host_config = HostConfig {
            network_mode: Some(match spec.network_mode {
                NetworkMode::Isolated => "none".to_string(),
                NetworkMode::Bridge => "bridge".to_string(),
            }),
            resources: Some(Resources {
                nano_cpus: Some(spec.resource_limits.cpu_nanos),
                memory: Some(spec.resource_limits.memory_bytes),
                pids_limit: Some(spec.resource_limits.pids),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.container_name.clone(),
            platform: None,
        });

        let created = self.docker.create_container(options, config).await.map_err(|e| {
            classify_create_error(&e, &spec.image)
        })?;

        debug!(container_name = %spec.container_name, runtime_id = %created.id, "container created");

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(container_name = %spec.container_name, error = %e, "start failed, destroying container");
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await;
            return Err(CoreError::RuntimeUnavailable(e.to_string()));
        }

        info!(container_name = %spec.container_name, runtime_id = %created.id, "container started");

        Ok(ContainerHandle {
            container_name: spec.container_name,
            runtime_id: created.id,
            target: spec.target,
            start_time: Utc::now(),
        })
    }

    async fn stream_logs(
        &self,
        handle: &ContainerHandle,
        since_offset: u64,
    ) -> CoreResult<(mpsc::Receiver<LogChunk>, CancellationToken)> {
        let (tx, rx) = mpsc::channel(256);
        let token = CancellationToken::new();
        let child_token = token.clone();
        let docker = self.docker.clone();
        let runtime_id = handle.runtime_id.clone();

        tokio::spawn(async move {
            let options = Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                since: 0,
                ..Default::default()
            });

            let mut stream = docker.logs(&runtime_id, options);
            let mut high_water_mark: u64 = 0;

            loop {
                tokio::select! {
                    () = child_token.cancelled() => break,
                    next = stream.next() => {
                        let Some(item) = next else { break };
                        let Ok(output) = item else { break };
                        let (source, bytes) = split_log_output(output);
                        let len = bytes.len() as u64;
                        if high_water_mark + len <= since_offset {
                            high_water_mark += len;
                            continue;
                        }
                        let chunk = LogChunk { source, offset: high_water_mark, data: bytes };
                        high_water_mark += len;
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((rx, token))
    }

    async fn wait(&self, handle: &ContainerHandle, deadline: Duration) -> CoreResult<i64> {
        let options = Some(WaitContainerOptions { condition: "not-running" });
        let mut stream = self.docker.wait_container(&handle.runtime_id, options);

        let result = tokio::time::timeout(deadline, stream.next()).await;
        match result {
            Err(_) => Err(CoreError::Timeout(deadline)),
            Ok(None) => Err(CoreError::RuntimeUnavailable(
                "wait stream ended without a status".to_string(),
            )),
            Ok(Some(Ok(response))) => Ok(response.status_code),
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => Ok(code),
            Ok(Some(Err(e))) => Err(CoreError::RuntimeUnavailable(e.to_string())),
        }
    }

    async fn destroy(&self, handle: &ContainerHandle) -> CoreResult<()> {
        let options = Some(RemoveContainerOptions { force: true, ..Default::default() });
        match self.docker.remove_container(&handle.runtime_id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(CoreError::RuntimeUnavailable(e.to_string())),
        }
    }
}

fn classify_create_error(e: &bollard::errors::Error, image: &str) -> CoreError {
    if let bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } = e {
        CoreError::ImageMissing(image.to_string())
    } else {
        CoreError::RuntimeUnavailable(e.to_string())
    }
}

fn split_log_output(output: bollard::container::LogOutput) -> (LogSource, Vec<u8>) {
    match output {
        bollard::container::LogOutput::StdOut { message } => (LogSource::Stdout, message.to_vec()),
        bollard::container::LogOutput::StdErr { message } => (LogSource::Stderr, message.to_vec()),
        bollard::container::LogOutput::StdIn { message } | bollard::container::LogOutput::Console { message } => {
            (LogSource::Stdout, message.to_vec())
        }
    }
}
