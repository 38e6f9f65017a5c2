//! Runner selection and backend settings, read from flags or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::error::Result;

/// Image used for new sandboxes when none is configured.
pub const DEFAULT_IMAGE: &str = "ubuntu";

/// Which backend executes scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunnerKind {
    /// One container per session on the local Docker engine.
    Docker,
    /// One pod per session in a Kubernetes namespace.
    Kubernetes,
    /// Plain subprocesses in the project directory. No isolation.
    Local,
}

#[derive(Args, Debug, Clone)]
pub struct RunnerConfig {
    /// Sandbox backend
    #[arg(long, env = "SCRIPTBOX_RUNNER", value_enum, default_value = "docker")]
    pub runner: RunnerKind,

    /// Image for new sandboxes
    #[arg(long, env = "DOCKER_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Remove sandbox containers once they exit
    #[arg(long, env = "DOCKER_AUTO_REMOVE", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_remove: bool,

    /// Namespace for sandbox pods (defaults to the kubeconfig namespace)
    #[arg(long, env = "SCRIPTBOX_NAMESPACE")]
    pub namespace: Option<String>,

    /// Service account assigned to sandbox pods
    #[arg(long, env = "SCRIPTBOX_SERVICE_ACCOUNT")]
    pub service_account: Option<String>,

    /// Priority class assigned to sandbox pods
    #[arg(long, env = "SCRIPTBOX_PRIORITY_CLASS")]
    pub priority_class: Option<String>,

    /// Working directory for the local runner (defaults to the current directory)
    #[arg(long, env = "SCRIPTBOX_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Upper bound in seconds on waits for sandbox state changes (unbounded if unset)
    #[arg(long, env = "SCRIPTBOX_WAIT_TIMEOUT_SECS")]
    pub wait_timeout_secs: Option<u64>,
}

/// Settings for the container backend.
#[derive(Debug, Clone)]
pub struct DockerOptions {
    pub image: String,
    pub auto_remove: bool,
}

/// Settings for the orchestrator backend.
#[derive(Debug, Clone)]
pub struct PodOptions {
    pub image: String,
    pub namespace: Option<String>,
    pub service_account: Option<String>,
    pub priority_class: Option<String>,
}

impl Default for PodOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            namespace: None,
            service_account: None,
            priority_class: None,
        }
    }
}

impl RunnerConfig {
    pub fn docker_options(&self) -> DockerOptions {
        DockerOptions {
            image: self.image.clone(),
            auto_remove: self.auto_remove,
        }
    }

    pub fn pod_options(&self) -> PodOptions {
        PodOptions {
            image: self.image.clone(),
            namespace: self.namespace.clone(),
            service_account: self.service_account.clone(),
            priority_class: self.priority_class.clone(),
        }
    }

    pub fn project_dir(&self) -> Result<PathBuf> {
        match &self.project_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        runner: RunnerConfig,
    }

    #[test]
    fn defaults_select_docker() {
        let cli = TestCli::try_parse_from(["scriptbox"]).unwrap();
        assert_eq!(cli.runner.runner, RunnerKind::Docker);
        assert!(cli.runner.wait_timeout().is_none());
    }

    #[test]
    fn auto_remove_can_be_disabled() {
        let cli = TestCli::try_parse_from([
            "scriptbox",
            "--runner",
            "kubernetes",
            "--auto-remove",
            "false",
            "--wait-timeout-secs",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.runner.runner, RunnerKind::Kubernetes);
        assert!(!cli.runner.docker_options().auto_remove);
        assert_eq!(cli.runner.wait_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn explicit_project_dir_wins() {
        let cli = TestCli::try_parse_from(["scriptbox", "--runner", "local", "--project-dir", "/srv/docs"])
            .unwrap();
        assert_eq!(cli.runner.project_dir().unwrap(), PathBuf::from("/srv/docs"));
    }
}
