//! Container backend on the Docker Engine API.
//!
//! Each session gets exactly one container, found again by its session label.
//! The container is locked down:
//!
//! - all capabilities dropped, not privileged
//! - read-only root filesystem
//! - 64 MB tmpfs mounted at the working directory
//! - half a CPU and 64 MB of memory
//! - exits on its own after an hour (`sleep 3600`)
//!
//! Creation is not guarded against a concurrent create for the same session:
//! two first runs racing past discovery both try to create, and the loser
//! gets the engine's name conflict back as an error.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{shell_command, Context, Release, Result, RunResult, Runner, SandboxError};
use super::{SAFETY_TIMEOUT_SECS, SESSION_LABEL, WORK_DIR};
use crate::config::DockerOptions;

const BACKEND: &str = "docker";

/// Size cap of the scratch tmpfs, in bytes.
const SCRATCH_BYTES: i64 = 64_000_000;
/// Memory cap, in bytes.
const MEMORY_BYTES: i64 = 64_000_000;
/// Half a CPU, in units of 10^-9 CPUs.
const NANO_CPUS: i64 = 500_000_000;

/// A container as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Resource and capability limits applied to every sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPolicy {
    pub cap_drop: Vec<String>,
    pub privileged: bool,
    pub readonly_rootfs: bool,
    pub scratch_bytes: i64,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    pub auto_remove: bool,
}

impl IsolationPolicy {
    pub fn strict(auto_remove: bool) -> Self {
        Self {
            cap_drop: vec!["ALL".to_string()],
            privileged: false,
            readonly_rootfs: true,
            scratch_bytes: SCRATCH_BYTES,
            nano_cpus: NANO_CPUS,
            memory_bytes: MEMORY_BYTES,
            auto_remove,
        }
    }
}

/// Everything needed to create one session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
    pub isolation: IsolationPolicy,
}

impl ContainerSpec {
    pub fn for_session(session: &str, options: &DockerOptions) -> Self {
        Self {
            name: format!("scriptbox-{session}"),
            image: options.image.clone(),
            working_dir: WORK_DIR.to_string(),
            entrypoint: vec!["sh".to_string(), "-c".to_string()],
            cmd: vec![format!("sleep {SAFETY_TIMEOUT_SECS}")],
            labels: HashMap::from([(SESSION_LABEL.to_string(), session.to_string())]),
            isolation: IsolationPolicy::strict(options.auto_remove),
        }
    }

    /// Translates the container spec into the engine's create request body.
    pub fn create_body(&self) -> ContainerCreateBody {
        let isolation = &self.isolation;
        ContainerCreateBody {
            image: Some(self.image.clone()),
            working_dir: Some(self.working_dir.clone()),
            entrypoint: Some(self.entrypoint.clone()),
            cmd: Some(self.cmd.clone()),
            labels: Some(self.labels.clone()),
            host_config: Some(HostConfig {
                auto_remove: Some(isolation.auto_remove),
                cap_drop: Some(isolation.cap_drop.clone()),
                privileged: Some(isolation.privileged),
                readonly_rootfs: Some(isolation.readonly_rootfs),
                tmpfs: Some(HashMap::from([(
                    self.working_dir.clone(),
                    format!("size={}", isolation.scratch_bytes),
                )])),
                nano_cpus: Some(isolation.nano_cpus),
                memory: Some(isolation.memory_bytes),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        }
    }
}

/// The subset of the container engine API the backend relies on.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Lists every container, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerEntry>>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a container. Already running is not an error.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Runs `cmd` in the container with a TTY and returns the attachment.
    async fn exec_attached(&self, id: &str, cmd: Vec<String>, working_dir: &str) -> Result<RunResult>;

    /// Force-removes a container.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// [`ContainerEngine`] backed by a bollard client.
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    /// Uses the local engine (`DOCKER_HOST` or the default socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|err| SandboxError::Connectivity {
            backend: BACKEND,
            message: err.to_string(),
        })?;
        Ok(Self { docker })
    }
}

fn engine_error(operation: &'static str, subject: &str, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::NotFound(subject.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if operation == "create_container" => {
            debug!(%message, "Container name conflict");
            SandboxError::AlreadyExists(subject.to_string())
        }
        BollardError::DockerResponseServerError { message, .. } => {
            SandboxError::Api { operation, message }
        }
        err @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::HyperLegacyError { .. }
        | BollardError::RequestTimeoutError) => SandboxError::Connectivity {
            backend: BACKEND,
            message: err.to_string(),
        },
        err => SandboxError::Api {
            operation,
            message: err.to_string(),
        },
    }
}

/// Keeps the exec's write half open until the gateway is done reading.
struct ExecAttachment {
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
impl Release for ExecAttachment {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self.input);
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn list_containers(&self) -> Result<Vec<ContainerEntry>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(true).build()))
            .await
            .map_err(|err| engine_error("list_containers", "containers", err))?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerEntry {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                spec.create_body(),
            )
            .await
            .map_err(|err| engine_error("create_container", &spec.name, err))?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(engine_error("start_container", id, err)),
        }
    }

    async fn exec_attached(&self, id: &str, cmd: Vec<String>, working_dir: &str) -> Result<RunResult> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(false),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(cmd),
                    working_dir: Some(working_dir.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| engine_error("create_exec", id, err))?;

        debug!(exec_id = %exec.id, "Attaching to exec");
        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|err| engine_error("start_exec", &exec.id, err))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output.map(|chunk| chunk.map(LogOutput::into_bytes).map_err(io::Error::other));
                Ok(RunResult::new(StreamReader::new(output), ExecAttachment { input }))
            }
            StartExecResults::Detached => Err(SandboxError::Api {
                operation: "start_exec",
                message: "exec started detached".to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptionsBuilder::new().force(true).build()))
            .await
            .map_err(|err| engine_error("remove_container", id, err))
    }
}

/// Runner giving each session one locked-down container.
pub struct DockerRunner<E = BollardEngine> {
    engine: E,
    options: DockerOptions,
}

impl DockerRunner<BollardEngine> {
    pub fn connect(options: DockerOptions) -> Result<Self> {
        Ok(Self::with_engine(BollardEngine::connect()?, options))
    }
}

impl<E: ContainerEngine> DockerRunner<E> {
    pub fn with_engine(engine: E, options: DockerOptions) -> Self {
        Self { engine, options }
    }

    /// Scans every container for the session label. First match wins.
    async fn find_container(&self, session: &str) -> Result<Option<String>> {
        debug!(session, "Listing containers");
        let containers = self.engine.list_containers().await?;
        Ok(containers
            .into_iter()
            .find(|c| c.labels.get(SESSION_LABEL).map(String::as_str) == Some(session))
            .map(|c| c.id))
    }

    async fn provision(&self, session: &str) -> Result<String> {
        let id = match self.find_container(session).await? {
            Some(id) => id,
            None => {
                let spec = ContainerSpec::for_session(session, &self.options);
                info!(
                    session,
                    image = %spec.image,
                    auto_remove = spec.isolation.auto_remove,
                    "Creating container"
                );
                self.engine.create_container(&spec).await?
            }
        };
        info!(session, container_id = %id, "Starting container");
        self.engine.start_container(&id).await?;
        Ok(id)
    }
}

#[async_trait]
impl<E: ContainerEngine> Runner for DockerRunner<E> {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn run(&self, ctx: &Context, session: &str, script: &str) -> Result<RunResult> {
        let id = ctx.bound("provisioning container", self.provision(session)).await?;
        debug!(session, container_id = %id, "Creating exec");
        self.engine
            .exec_attached(&id, shell_command(script), WORK_DIR)
            .await
    }

    async fn reset(&self, ctx: &Context, session: &str) -> Result<()> {
        let Some(id) = ctx.bound("listing containers", self.find_container(session)).await? else {
            debug!(session, "No container to remove");
            return Ok(());
        };
        info!(session, container_id = %id, "Removing container");
        match self.engine.remove_container(&id).await {
            Err(err) if err.is_not_found() => {
                debug!(session, container_id = %id, "Container already gone");
                Ok(())
            }
            other => other,
        }
    }
}
