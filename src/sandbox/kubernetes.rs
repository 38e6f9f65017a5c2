//! Orchestrator backend on the Kubernetes API.
//!
//! One pod per session, named after the session. State changes are observed
//! through watch subscriptions filtered to the pod's name; those waits only end
//! when the control plane reports the transition, the watch breaks, or the
//! caller's [`Context`] gives up.

use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, Pod, PodSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{merge_output, shell_command, Context, NoopRelease, Result, RunResult, Runner, SandboxError};
use super::{SAFETY_TIMEOUT_SECS, SESSION_LABEL, WORK_DIR};
use crate::config::PodOptions;

const BACKEND: &str = "kubernetes";

const CONTAINER_NAME: &str = "main";
const SCRATCH_VOLUME: &str = "wd";
const CPU: &str = "500m";
const MEMORY: &str = "64M";
const SANDBOX_UID: i64 = 1000;

/// Pod name for a session.
pub fn pod_name(session: &str) -> String {
    format!("{session}.scriptbox")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            Some("Unknown") => PodPhase::Unknown,
            _ => PodPhase::Pending,
        }
    }

    /// Pods in these phases never run again and must not be reused.
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

fn phase_of(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// One watch notification about the session pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEvent {
    Added(PodPhase),
    Modified(PodPhase),
    Deleted,
}

impl PodEvent {
    fn phase(self) -> Option<PodPhase> {
        match self {
            PodEvent::Added(phase) | PodEvent::Modified(phase) => Some(phase),
            PodEvent::Deleted => None,
        }
    }
}

pub type PodEvents = BoxStream<'static, Result<PodEvent>>;

/// Result of a remote command: everything it printed, plus how it failed.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub combined: Vec<u8>,
    pub error: Option<SandboxError>,
}

/// The subset of the pod API the backend relies on.
#[async_trait]
pub trait PodControl: Send + Sync {
    /// Current phase of the pod, `NotFound` if there is none.
    async fn phase(&self, name: &str) -> Result<PodPhase>;

    /// `AlreadyExists` if a pod with that name is present.
    async fn create(&self, pod: &Pod) -> Result<()>;

    /// `NotFound` if there is no such pod.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Subscribes to events for the named pod, starting with its current state.
    async fn watch(&self, name: &str) -> Result<PodEvents>;

    /// Runs `command` in `container`, collecting stdout and stderr together.
    async fn exec(&self, name: &str, container: &str, command: Vec<String>) -> ExecOutput;
}

fn kube_error(operation: &'static str, subject: &str, err: kube::Error) -> SandboxError {
    match err {
        kube::Error::Api(response) if response.code == 404 => SandboxError::NotFound(subject.to_string()),
        kube::Error::Api(response) if response.code == 409 => {
            SandboxError::AlreadyExists(subject.to_string())
        }
        kube::Error::Api(response) => SandboxError::Api {
            operation,
            message: response.message.clone(),
        },
        err @ (kube::Error::HyperError(_) | kube::Error::Service(_)) => SandboxError::Connectivity {
            backend: BACKEND,
            message: err.to_string(),
        },
        err => SandboxError::Api {
            operation,
            message: err.to_string(),
        },
    }
}

/// [`PodControl`] backed by a kube client scoped to one namespace.
pub struct KubePods {
    pods: Api<Pod>,
}

impl KubePods {
    /// Uses the in-cluster config or the local kubeconfig.
    pub async fn connect(namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|err| SandboxError::Connectivity {
                backend: BACKEND,
                message: err.to_string(),
            })?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| client.default_namespace().to_string());
        info!(%namespace, "Using namespace for sandbox pods");
        Ok(Self {
            pods: Api::namespaced(client, &namespace),
        })
    }
}

#[async_trait]
impl PodControl for KubePods {
    async fn phase(&self, name: &str) -> Result<PodPhase> {
        let pod = self
            .pods
            .get(name)
            .await
            .map_err(|err| kube_error("get_pod", name, err))?;
        Ok(phase_of(&pod))
    }

    async fn create(&self, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(|err| kube_error("create_pod", name, err))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.pods
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|err| kube_error("delete_pod", name, err))?;
        Ok(())
    }

    async fn watch(&self, name: &str) -> Result<PodEvents> {
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let events = self
            .pods
            .watch(&params, "0")
            .await
            .map_err(|err| kube_error("watch_pod", name, err))?;
        let name = name.to_string();
        Ok(events
            .filter_map(move |event| {
                let event = match event {
                    Ok(WatchEvent::Added(pod)) => Some(Ok(PodEvent::Added(phase_of(&pod)))),
                    Ok(WatchEvent::Modified(pod)) => Some(Ok(PodEvent::Modified(phase_of(&pod)))),
                    Ok(WatchEvent::Deleted(_)) => Some(Ok(PodEvent::Deleted)),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(status)) => Some(Err(SandboxError::WaitStream(format!(
                        "watch on pod {name} failed: {}",
                        status.message
                    )))),
                    Err(err) => Some(Err(kube_error("watch_pod", &name, err))),
                };
                async move { event }
            })
            .boxed())
    }

    async fn exec(&self, name: &str, container: &str, command: Vec<String>) -> ExecOutput {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = match self.pods.exec(name, command, &params).await {
            Ok(attached) => attached,
            Err(err) => {
                return ExecOutput {
                    combined: Vec::new(),
                    error: Some(kube_error("exec", name, err)),
                }
            }
        };

        let mut output = ExecOutput::default();
        if let (Some(stdout), Some(stderr)) = (attached.stdout(), attached.stderr()) {
            if let Err(err) = merge_output(stdout, stderr)
                .read_to_end(&mut output.combined)
                .await
            {
                output.error = Some(err.into());
            }
        }
        if let Some(status) = attached.take_status() {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    let message = status.message.unwrap_or_else(|| "command failed".to_string());
                    output.error.get_or_insert(SandboxError::Execution(message));
                }
            }
        }
        if let Err(err) = attached.join().await {
            output.error.get_or_insert(SandboxError::Api {
                operation: "exec",
                message: err.to_string(),
            });
        }
        output
    }
}

/// Builds the pod for a session: one locked-down container with scratch
/// space at the working directory and a one hour active deadline.
pub fn pod_manifest(session: &str, name: &str, options: &PodOptions) -> Pod {
    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(CPU.to_string())),
        ("memory".to_string(), Quantity(MEMORY.to_string())),
    ]);
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                SESSION_LABEL.to_string(),
                session.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(options.image.clone()),
                working_dir: Some(WORK_DIR.to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("sleep {SAFETY_TIMEOUT_SECS}"),
                ]),
                image_pull_policy: Some("IfNotPresent".to_string()),
                // requests == limits gives the Guaranteed QoS class
                resources: Some(ResourceRequirements {
                    limits: Some(resources.clone()),
                    requests: Some(resources),
                    ..ResourceRequirements::default()
                }),
                security_context: Some(SecurityContext {
                    capabilities: Some(Capabilities {
                        drop: Some(vec!["ALL".to_string()]),
                        ..Capabilities::default()
                    }),
                    privileged: Some(false),
                    run_as_user: Some(SANDBOX_UID),
                    run_as_group: Some(SANDBOX_UID),
                    run_as_non_root: Some(true),
                    read_only_root_filesystem: Some(true),
                    allow_privilege_escalation: Some(false),
                    ..SecurityContext::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: SCRATCH_VOLUME.to_string(),
                    mount_path: WORK_DIR.to_string(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            restart_policy: Some("Never".to_string()),
            active_deadline_seconds: Some(SAFETY_TIMEOUT_SECS as i64),
            service_account_name: options.service_account.clone(),
            automount_service_account_token: Some(false),
            priority_class_name: options.priority_class.clone(),
            volumes: Some(vec![Volume {
                name: SCRATCH_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

/// Consumes `events` until `done` accepts one.
async fn wait_for(
    mut events: PodEvents,
    name: &str,
    state: &str,
    done: impl Fn(PodEvent) -> bool + Send,
) -> Result<()> {
    debug!(pod = name, state, "Waiting for pod");
    while let Some(event) = events.next().await {
        let event = event?;
        debug!(pod = name, ?event, "Pod event");
        if done(event) {
            return Ok(());
        }
    }
    Err(SandboxError::WaitStream(format!(
        "watch on pod {name} closed before it was {state}"
    )))
}

/// Runner giving each session one pod.
pub struct KubernetesRunner<P = KubePods> {
    pods: P,
    options: PodOptions,
}

impl KubernetesRunner<KubePods> {
    pub async fn connect(options: PodOptions) -> Result<Self> {
        let pods = KubePods::connect(options.namespace.as_deref()).await?;
        Ok(Self::with_pods(pods, options))
    }
}

impl<P: PodControl> KubernetesRunner<P> {
    pub fn with_pods(pods: P, options: PodOptions) -> Self {
        Self { pods, options }
    }

    /// Deletes the pod if it has already finished.
    async fn delete_terminal_pod(&self, ctx: &Context, name: &str) -> Result<()> {
        match self.pods.phase(name).await {
            Ok(phase) if phase.is_terminal() => {
                info!(pod = name, ?phase, "Deleting finished pod");
                self.remove_pod(ctx, name).await
            }
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Deletes the pod and waits until the control plane reports it gone.
    async fn remove_pod(&self, ctx: &Context, name: &str) -> Result<()> {
        let events = self.pods.watch(name).await?;
        match self.pods.delete(name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(pod = name, "No pod to delete");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        ctx.bound(
            "waiting for pod deletion",
            wait_for(events, name, "deleted", |event| event == PodEvent::Deleted),
        )
        .await
    }

    /// Creates the pod unless it exists, then waits for it to run.
    async fn ensure_running(&self, ctx: &Context, session: &str, name: &str) -> Result<()> {
        let pod = pod_manifest(session, name, &self.options);
        match self.pods.create(&pod).await {
            Ok(()) => info!(pod = name, image = %self.options.image, "Created pod"),
            Err(err) if err.is_already_exists() => debug!(pod = name, "Pod already exists"),
            Err(err) => return Err(err),
        }
        let events = self.pods.watch(name).await?;
        ctx.bound(
            "waiting for pod to run",
            wait_for(events, name, "running", |event| {
                event.phase() == Some(PodPhase::Running)
            }),
        )
        .await
    }
}

#[async_trait]
impl<P: PodControl> Runner for KubernetesRunner<P> {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn run(&self, ctx: &Context, session: &str, script: &str) -> Result<RunResult> {
        let name = pod_name(session);
        self.delete_terminal_pod(ctx, &name).await?;
        self.ensure_running(ctx, session, &name).await?;

        debug!(pod = %name, "Streaming exec");
        let ExecOutput {
            mut combined,
            error,
        } = self
            .pods
            .exec(&name, CONTAINER_NAME, shell_command(script))
            .await;
        if let Some(err) = error {
            warn!(pod = %name, error = %err, "Exec failed");
            combined.extend_from_slice(err.to_string().as_bytes());
        }
        Ok(RunResult::new(Cursor::new(combined), NoopRelease))
    }

    async fn reset(&self, ctx: &Context, session: &str) -> Result<()> {
        let name = pod_name(session);
        info!(pod = %name, "Resetting pod");
        self.remove_pod(ctx, &name).await
    }
}
