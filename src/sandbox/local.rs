//! Local-process backend. Scripts run as plain subprocesses of the server,
//! with no isolation at all; only meant for trusted use during development.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{merge_output, Context, Release, ReleaseHandle, Result, RunResult, Runner, SandboxError};

const BACKEND: &str = "local";

/// Runs each script in a fresh `sh -c` rooted at the project directory.
pub struct LocalRunner {
    dir: PathBuf,
}

impl LocalRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Waits for the script to exit when the caller releases it.
struct WaitForExit {
    child: Child,
}

#[async_trait]
impl Release for WaitForExit {
    async fn release(self: Box<Self>) -> Result<()> {
        let mut child = self.child;
        let status = child.wait().await?;
        debug!(%status, "Script exited");
        if status.success() {
            Ok(())
        } else {
            Err(SandboxError::Execution(format!("script finished with {status}")))
        }
    }
}

#[async_trait]
impl Runner for LocalRunner {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn run(&self, _ctx: &Context, session: &str, script: &str) -> Result<RunResult> {
        info!(session, dir = ?self.dir, "Spawning local script");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SandboxError::Execution("script output was not captured".to_string()));
        };
        Ok(RunResult {
            output: merge_output(stdout, stderr),
            release: ReleaseHandle::new(WaitForExit { child }),
        })
    }

    async fn reset(&self, _ctx: &Context, _session: &str) -> Result<()> {
        Err(SandboxError::Unsupported {
            operation: "reset",
            backend: BACKEND,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn run_to_end(runner: &LocalRunner, script: &str) -> (String, Result<()>) {
        let RunResult { mut output, release } =
            runner.run(&Context::new(), "s1", script).await.unwrap();
        let mut text = String::new();
        output.read_to_string(&mut text).await.unwrap();
        (text, release.release().await)
    }

    #[tokio::test]
    async fn runs_in_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());

        let (out, status) = run_to_end(&runner, "pwd -P").await;

        assert!(status.is_ok());
        assert_eq!(
            PathBuf::from(out.trim()),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());

        let (out, status) = run_to_end(&runner, "echo out; echo err >&2").await;

        assert!(status.is_ok());
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["err", "out"]);
    }

    #[tokio::test]
    async fn keeps_line_order_of_one_stream() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());

        let (out, _) = run_to_end(&runner, "for i in 1 2 3 4 5; do echo $i; done").await;
        assert_eq!(out, "1\n2\n3\n4\n5\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_release_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new(dir.path());

        let (out, status) = run_to_end(&runner, "echo partial; exit 3").await;

        assert_eq!(out, "partial\n");
        assert!(matches!(status, Err(SandboxError::Execution(_))));
    }

    #[tokio::test]
    async fn missing_project_dir_fails_run() {
        let runner = LocalRunner::new("/definitely/not/here");
        let err = runner
            .run(&Context::new(), "s1", "true")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[tokio::test]
    async fn reset_is_unsupported() {
        let runner = LocalRunner::new(".");
        for session in ["abc123", "", "other"] {
            let err = runner.reset(&Context::new(), session).await.unwrap_err();
            assert!(matches!(
                err,
                SandboxError::Unsupported {
                    operation: "reset",
                    ..
                }
            ));
        }
    }
}
