//! Metrics sources
//!
//! - docker: container cpu/memory, state, health and restart deltas
//! - host: sysinfo cpu, memory, swap, root disk and load
//! - systemd: `systemctl is-active` for configured units
//!
//! `CompositeSource` merges them; one failing source only loses its own samples.

mod docker;
mod host;
mod systemd;

pub use docker::DockerSource;
pub use host::HostSource;
pub use systemd::SystemdSource;

use async_trait::async_trait;
use remedy_common::{config::SourcesConfig, RemedyError, Result, Sample};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ports::MetricsSource;

/// Run a command and return stdout. Non-zero exit is an error unless `allow_failure`.
pub(crate) async fn command_output(
    program: &str,
    args: &[&str],
    allow_failure: bool,
) -> Result<String> {
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

    if output.status.success() || allow_failure {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(RemedyError::Unavailable(format!(
            "{} {} exited with {}: {}",
            program,
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

pub struct CompositeSource {
    sources: Vec<Arc<dyn MetricsSource>>,
}

impl CompositeSource {
    pub fn new(sources: Vec<Arc<dyn MetricsSource>>) -> Self {
        Self { sources }
    }

    /// Sources enabled in the configuration
    pub fn from_config(config: &SourcesConfig) -> Self {
        let mut sources: Vec<Arc<dyn MetricsSource>> = Vec::new();
        if config.docker {
            sources.push(Arc::new(DockerSource::new(config.docker_bin.clone())));
        }
        if config.host {
            sources.push(Arc::new(HostSource::new()));
        }
        if !config.services.is_empty() {
            sources.push(Arc::new(SystemdSource::new(config.services.clone())));
        }
        Self::new(sources)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl MetricsSource for CompositeSource {
    async fn poll(&self) -> Result<Vec<Sample>> {
        if self.sources.is_empty() {
            return Ok(Vec::new());
        }

        let mut samples = Vec::new();
        let mut errors = Vec::new();
        for source in &self.sources {
            match source.poll().await {
                Ok(mut batch) => samples.append(&mut batch),
                Err(e) => {
                    warn!(source = source.name(), "Metrics source failed: {}", e);
                    errors.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        if errors.len() == self.sources.len() {
            return Err(RemedyError::Unavailable(errors.join("; ")));
        }
        Ok(samples)
    }

    fn name(&self) -> &str {
        "composite"
    }
}
