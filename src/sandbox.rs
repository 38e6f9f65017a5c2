//! Runner contract shared by every sandbox backend.
//!
//! A [`Runner`] owns the session-to-sandbox lifecycle: `run` resolves or
//! provisions the session's sandbox and submits a script to it, `reset` tears
//! the sandbox down. The backend is picked once at startup by [`connect`].

pub mod docker;
pub mod kubernetes;
pub mod local;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{RunnerConfig, RunnerKind};
pub use crate::error::{Result, SandboxError};

/// Label carried by every sandbox, holding the owning session id.
pub const SESSION_LABEL: &str = "scriptbox/session-id";

/// Working directory inside the sandbox, backed by scratch storage.
pub const WORK_DIR: &str = "/wd";

/// Wall-clock bound after which an abandoned sandbox exits on its own.
pub const SAFETY_TIMEOUT_SECS: u64 = 60 * 60;

/// Combined stdout/stderr of one exec, in arrival order.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Frees backend resources tied to one exec. Consumed on use.
#[async_trait]
pub trait Release: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Release for attachments with nothing left to free.
pub struct NoopRelease;

#[async_trait]
impl Release for NoopRelease {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Handle that must be invoked exactly once when the caller is done reading.
pub struct ReleaseHandle(Box<dyn Release>);

impl ReleaseHandle {
    pub fn new(release: impl Release + 'static) -> Self {
        Self(Box::new(release))
    }

    pub async fn release(self) -> Result<()> {
        self.0.release().await
    }
}

/// Output of a successful `run`.
///
/// Releasing never stops the sandbox; it only drops this exec's attachment.
pub struct RunResult {
    pub output: OutputStream,
    pub release: ReleaseHandle,
}

impl RunResult {
    pub fn new(output: impl AsyncRead + Send + 'static, release: impl Release + 'static) -> Self {
        Self {
            output: Box::pin(output),
            release: ReleaseHandle::new(release),
        }
    }
}

/// Execution context for one runner call.
///
/// Carries the caller's cancellation token and an optional deadline. Waits on
/// the control plane go through [`Context::bound`] so either one ends them.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds waits to `timeout` from now, or leaves them unbounded on `None`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drives `fut` until it completes, the context is cancelled or the
    /// deadline passes. `what` names the wait in the deadline error.
    pub async fn bound<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(SandboxError::Cancelled),
            _ = deadline => Err(SandboxError::DeadlineExceeded(what.to_string())),
        }
    }
}

/// A sandbox backend.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Makes sure the session's sandbox is running and submits `script` to it.
    async fn run(&self, ctx: &Context, session: &str, script: &str) -> Result<RunResult>;

    /// Removes the session's sandbox. Succeeds when there is none.
    async fn reset(&self, ctx: &Context, session: &str) -> Result<()>;
}

/// Builds the runner selected by `config`.
pub async fn connect(config: &RunnerConfig) -> Result<Arc<dyn Runner>> {
    info!(runner = ?config.runner, "Connecting sandbox runner");
    let runner: Arc<dyn Runner> = match config.runner {
        RunnerKind::Docker => Arc::new(docker::DockerRunner::connect(config.docker_options())?),
        RunnerKind::Kubernetes => {
            Arc::new(kubernetes::KubernetesRunner::connect(config.pod_options()).await?)
        }
        RunnerKind::Local => Arc::new(local::LocalRunner::new(config.project_dir()?)),
    };
    Ok(runner)
}

/// Interleaves two readers into one stream in arrival order.
pub(crate) fn merge_output<A, B>(stdout: A, stderr: B) -> OutputStream
where
    A: AsyncRead + Send + 'static,
    B: AsyncRead + Send + 'static,
{
    let merged = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
    Box::pin(StreamReader::new(merged))
}

/// Command that submits `script` to a POSIX shell.
pub(crate) fn shell_command(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}
