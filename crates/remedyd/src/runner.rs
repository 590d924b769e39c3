//! System command runner
//!
//! Maps an `ActionKind` onto docker / systemctl / sh invocations. Children
//! are spawned with `kill_on_drop`, so a cancelled or timed-out action stops
//! the process as well as the wait.

use async_trait::async_trait;
use remedy_common::{ActionKind, RemedyError, Result, Target, TargetType};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::ports::CommandRunner;

/// What running an action amounts to on this host
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
    Exec { program: String, args: Vec<String> },
    /// Look up the container's json log file and truncate it
    TruncateLogs { container: String },
}

fn exec(program: &str, args: &[&str]) -> Plan {
    Plan::Exec {
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

pub struct SystemRunner {
    docker_bin: String,
}

impl SystemRunner {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    pub(crate) fn plan(&self, action: &ActionKind, target: &Target) -> Result<Plan> {
        if !action.supports(target.target_type) {
            return Err(RemedyError::InvalidRequest(format!(
                "{} is not supported for {} targets",
                action.action_type(),
                target.target_type
            )));
        }

        let id = target.target_id.as_str();
        let docker = self.docker_bin.as_str();
        let plan = match (action, target.target_type) {
            (ActionKind::Custom { command }, _) => exec("sh", &["-c", command]),
            (ActionKind::Restart, TargetType::Container) => exec(docker, &["restart", id]),
            (ActionKind::Start, TargetType::Container) => exec(docker, &["start", id]),
            (ActionKind::Stop, TargetType::Container) => exec(docker, &["stop", id]),
            (ActionKind::Restart, _) => exec("systemctl", &["restart", id]),
            (ActionKind::Start, _) => exec("systemctl", &["start", id]),
            (ActionKind::Stop, _) => exec("systemctl", &["stop", id]),
            (ActionKind::UpdateMemoryLimit { memory_mb }, _) => {
                let limit = format!("{}m", memory_mb);
                exec(docker, &["update", "--memory", &limit, "--memory-swap", &limit, id])
            }
            (ActionKind::UpdateCpuLimit { cpus }, _) => {
                let cpus = format!("{}", cpus);
                exec(docker, &["update", "--cpus", &cpus, id])
            }
            (ActionKind::ClearLogs, _) => Plan::TruncateLogs {
                container: id.to_string(),
            },
        };
        Ok(plan)
    }

    async fn truncate_logs(&self, container: &str) -> Result<String> {
        let path = run_command(
            &self.docker_bin,
            &[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.LogPath}}".to_string(),
                container.to_string(),
            ],
        )
        .await?;
        let path = path.trim();
        if path.is_empty() {
            return Err(RemedyError::ExecutionFailure(format!(
                "{} has no log file",
                container
            )));
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| RemedyError::ExecutionFailure(format!("open {}: {}", path, e)))?;
        file.set_len(0)
            .await
            .map_err(|e| RemedyError::ExecutionFailure(format!("truncate {}: {}", path, e)))?;
        Ok(format!("truncated {}", path))
    }
}

async fn run_command(program: &str, args: &[String]) -> Result<String> {
    debug!("Executing: {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RemedyError::Unavailable(format!("failed to run {}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() {
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RemedyError::ExecutionFailure(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, action: &ActionKind, target: &Target, timeout: Duration) -> Result<String> {
        let plan = self.plan(action, target)?;
        info!(action = action.action_type(), target = %target, "Running remediation");

        let work = async {
            match &plan {
                Plan::Exec { program, args } => run_command(program, args).await,
                Plan::TruncateLogs { container } => self.truncate_logs(container).await,
            }
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RemedyError::Timeout(format!(
                "{} on {} after {}s",
                action.action_type(),
                target,
                timeout.as_secs()
            ))),
        }
    }
}
